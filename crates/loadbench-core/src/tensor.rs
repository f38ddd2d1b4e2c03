use anyhow::{bail, ensure, Result};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda {
        device_id: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

/// Memory layout hint a backend gives the dataset when it pre-processes images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Nhwc,
    Nchw,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
    /// Leading (batch) dimension, if the shape has one.
    pub fn batch(&self) -> Option<usize> {
        self.0.first().copied()
    }
    /// The shape of one sample once the batch dimension is dropped.
    pub fn sample(&self) -> Shape {
        Self(self.0.iter().skip(1).copied().collect())
    }
    pub fn with_batch(&self, batch: usize) -> Shape {
        let mut dims: SmallVec<[usize; 6]> = SmallVec::with_capacity(self.rank() + 1);
        dims.push(batch);
        dims.extend(self.0.iter().copied());
        Self(dims)
    }
}

#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

/// Dense CPU tensor. Storage is little-endian and row-major.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub bytes: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            desc: TensorDesc {
                dtype,
                shape,
                device: Device::Cpu,
            },
            bytes,
        }
    }

    pub fn from_f32(shape: Shape, data: &[f32]) -> Self {
        Self::from_cpu_bytes(DType::F32, shape, f32_to_bytes(data))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.desc.shape.batch()
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        ensure!(
            self.desc.dtype == DType::F32,
            "expected f32 tensor, got {:?}",
            self.desc.dtype
        );
        bytes_to_f32(&self.bytes)
    }

    /// Numeric view of any supported dtype, widened to f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let b = &self.bytes;
        let values = match self.desc.dtype {
            DType::F32 => bytes_to_f32(b)?.into_iter().map(f64::from).collect(),
            DType::I64 => {
                ensure!(b.len() % 8 == 0, "i64 buffer has invalid byte length");
                b.chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
                    .collect()
            }
            DType::I32 => {
                ensure!(b.len() % 4 == 0, "i32 buffer has invalid byte length");
                b.chunks_exact(4)
                    .map(|c| f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect()
            }
            DType::U8 => b.iter().map(|v| f64::from(*v)).collect(),
            DType::F16 => bail!("f16 tensors cannot be read on the host yet"),
        };
        Ok(values)
    }

    /// Stack single-sample tensors of identical dtype and shape into one batch.
    pub fn stack(samples: &[Tensor]) -> Result<Tensor> {
        let Some(first) = samples.first() else {
            bail!("cannot stack an empty tensor list");
        };
        let mut buf = BytesMut::with_capacity(first.byte_len() * samples.len());
        for t in samples {
            ensure!(
                t.desc.dtype == first.desc.dtype && t.desc.shape == first.desc.shape,
                "tensor {:?}/{:?} does not match {:?}/{:?}",
                t.desc.dtype,
                t.desc.shape,
                first.desc.dtype,
                first.desc.shape
            );
            buf.put_slice(&t.bytes);
        }
        Ok(Tensor::from_cpu_bytes(
            first.desc.dtype,
            first.desc.shape.with_batch(samples.len()),
            buf.freeze(),
        ))
    }
}

pub fn f32_to_bytes(data: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() * 4);
    for v in data {
        buf.put_f32_le(*v);
    }
    buf.freeze()
}

pub fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 4 == 0, "f32 buffer has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
