use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use loadbench_core::{
    bytes_to_f32, Backend, BackendCapabilities, BackendModel, DType, Device, IOName, ImageFormat,
    LoadOptions, ModelArtifact, ModelSpec, Shape, Tensor, TensorSpec,
};
use ort::{
    session::{builder::SessionBuilder, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use parking_lot::Mutex;
use tracing::info;

const ORT_VERSION: &str = "ort-2.0.0-rc.10";

pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// A loaded ONNX session. `Session::run` needs exclusive access, so calls
/// from concurrent workers are serialized on the mutex.
pub struct OrtModel {
    spec: ModelSpec,
    session: Mutex<Session>,
    name: String,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn version(&self) -> String {
        ORT_VERSION.to_string()
    }

    fn load(&self, artifact: &ModelArtifact, opts: &LoadOptions) -> Result<Self::Model> {
        let ModelArtifact::OnnxPath(path) = artifact else {
            bail!("onnxruntime backend expects an ONNX file path");
        };

        let mut builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?;
        if let Some(threads) = opts.intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .context("failed to set ORT intra-op threads")?;
        }

        let builder = configure_session_builder(builder, &opts.device)?;

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model {}", path.display()))?;

        let spec = build_model_spec(&session, opts)?;
        info!(
            model = %path.display(),
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            "onnx model loaded"
        );

        Ok(OrtModel {
            spec,
            session: Mutex::new(session),
            name: self.name().to_string(),
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            image_format: ImageFormat::Nchw,
        }
    }
}

impl BackendModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> String {
        ORT_VERSION.to_string()
    }

    fn predict(&self, feed: Vec<(IOName, Tensor)>) -> Result<Vec<Tensor>> {
        ensure!(
            feed.len() <= self.spec.inputs.len(),
            "expected at most {} inputs, got {}",
            self.spec.inputs.len(),
            feed.len()
        );

        let mut ort_inputs = Vec::with_capacity(feed.len());
        for (name, input) in feed {
            let value = tensor_to_ort_value(input)?;
            ort_inputs.push((name.0, SessionInputValue::from(value)));
        }

        let mut session = self.session.lock();
        let outputs = session.run(ort_inputs)?;
        let mut by_name = Vec::with_capacity(outputs.len());
        for (name, value) in outputs.iter() {
            if self.spec.output_names().any(|n| n.as_str() == name) {
                by_name.push((name.to_string(), ort_value_to_tensor(&value)?));
            }
        }

        // Keep the declared output order, not the session's.
        self.spec
            .output_names()
            .map(|wanted| {
                by_name
                    .iter()
                    .position(|(name, _)| name == wanted.as_str())
                    .map(|i| by_name[i].1.clone())
                    .with_context(|| format!("model produced no output named {wanted}"))
            })
            .collect()
    }
}

/// Describe the session's IO, restricted to the requested names when given.
fn build_model_spec(session: &Session, opts: &LoadOptions) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .filter(|input| wanted(&opts.inputs, &input.name))
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .filter(|output| wanted(&opts.outputs, &output.name))
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    ensure!(!inputs.is_empty(), "none of the requested inputs exist in the model");
    ensure!(!outputs.is_empty(), "none of the requested outputs exist in the model");

    Ok(ModelSpec { inputs, outputs })
}

fn wanted(requested: &[IOName], name: &str) -> bool {
    requested.is_empty() || requested.iter().any(|r| r.as_str() == name)
}

fn configure_session_builder(builder: SessionBuilder, device: &Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but loadbench-backend-ort was built without the `cuda` feature")
    }
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type");
    };

    let dtype = ort_tensor_element_to_dtype(*ty)?;
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype,
        rank: shape.len(),
        dims,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float16 => Ok(DType::F16),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

fn tensor_to_ort_value(tensor: Tensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.desc.shape.0.iter().copied().collect();
    let expected_bytes = tensor.desc.shape.numel() * tensor.desc.dtype.byte_size();
    ensure!(
        tensor.byte_len() == expected_bytes,
        "input byte size mismatch: got {}, expected {}",
        tensor.byte_len(),
        expected_bytes
    );

    let bytes = &tensor.bytes;
    let value = match tensor.desc.dtype {
        DType::F32 => {
            let data = bytes_to_f32(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I64 => {
            let data = bytes_to_i64(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I32 => {
            let data = bytes_to_i32(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => {
            let data = bytes.to_vec();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::F16 => bail!("f16 inputs are not supported yet"),
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<Tensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let out_shape = Shape::from_slice(&dims);

    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(Tensor::from_f32(out_shape, slice))
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            let bytes: Vec<u8> = slice.iter().flat_map(|v| v.to_le_bytes()).collect();
            Ok(Tensor::from_cpu_bytes(DType::I64, out_shape, Bytes::from(bytes)))
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            let bytes: Vec<u8> = slice.iter().flat_map(|v| v.to_le_bytes()).collect();
            Ok(Tensor::from_cpu_bytes(DType::I32, out_shape, Bytes::from(bytes)))
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(Tensor::from_cpu_bytes(
                DType::U8,
                out_shape,
                Bytes::copy_from_slice(slice),
            ))
        }
        TensorElementType::Float16 => bail!("f16 outputs are not supported yet"),
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}

fn bytes_to_i64(bytes: &[u8]) -> Result<Vec<i64>> {
    ensure!(bytes.len() % 8 == 0, "i64 input has invalid byte length");
    Ok(bytes
        .chunks_exact(8)
        .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

fn bytes_to_i32(bytes: &[u8]) -> Result<Vec<i32>> {
    ensure!(bytes.len() % 4 == 0, "i32 input has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_names_filter_io() {
        let requested = vec![IOName::new("ArgMax:0")];
        assert!(wanted(&requested, "ArgMax:0"));
        assert!(!wanted(&requested, "softmax"));
        assert!(wanted(&[], "anything"));
    }

    #[test]
    fn integer_buffers_decode_little_endian() -> Result<()> {
        let bytes: Vec<u8> = [7i64, -1].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(bytes_to_i64(&bytes)?, vec![7, -1]);
        assert!(bytes_to_i32(&[1, 2, 3]).is_err());
        Ok(())
    }

    #[test]
    fn element_types_map_to_dtypes() -> Result<()> {
        assert_eq!(ort_tensor_element_to_dtype(TensorElementType::Float32)?, DType::F32);
        assert_eq!(ort_tensor_element_to_dtype(TensorElementType::Uint8)?, DType::U8);
        assert!(ort_tensor_element_to_dtype(TensorElementType::Bool).is_err());
        Ok(())
    }
}
