use std::sync::Arc;

use anyhow::{ensure, Result};
use loadbench_core::{
    Backend, BackendCapabilities, BackendModel, DType, IOName, ImageFormat, LoadOptions,
    ModelArtifact, ModelSpec, Shape, Tensor, TensorSpec,
};

use crate::config::ConfigError;

/// A model ready for the runner, plus what the harness needs to know about its backend.
pub struct LoadedModel {
    pub model: Arc<dyn BackendModel>,
    pub backend: &'static str,
    pub version: String,
    pub image_format: ImageFormat,
}

pub type Constructor = fn(&ModelArtifact, &LoadOptions) -> Result<LoadedModel>;

#[derive(Clone, Copy)]
pub struct BackendEntry {
    pub key: &'static str,
    pub build: Constructor,
}

/// Every backend compiled into this binary.
pub fn backends() -> Vec<BackendEntry> {
    #[allow(unused_mut)]
    let mut entries = vec![BackendEntry {
        key: "null",
        build: |artifact, opts| load_with(NullBackend, artifact, opts),
    }];
    #[cfg(feature = "onnxruntime")]
    entries.push(BackendEntry {
        key: "onnxruntime",
        build: |artifact, opts| {
            load_with(loadbench_backend_ort::OrtBackend::new(), artifact, opts)
        },
    });
    entries
}

pub fn lookup(key: &str) -> Result<BackendEntry, ConfigError> {
    let entries = backends();
    entries
        .iter()
        .find(|e| e.key == key)
        .copied()
        .ok_or_else(|| ConfigError::UnknownBackend {
            name: key.to_string(),
            available: entries.iter().map(|e| e.key).collect::<Vec<_>>().join(", "),
        })
}

fn load_with<B: Backend>(backend: B, artifact: &ModelArtifact, opts: &LoadOptions) -> Result<LoadedModel> {
    let BackendCapabilities { image_format, .. } = backend.capabilities();
    let model = backend.load(artifact, opts)?;
    Ok(LoadedModel {
        model: Arc::new(model),
        backend: backend.name(),
        version: backend.version(),
        image_format,
    })
}

/// Backend that skips inference and answers every batch with zeros.
///
/// Measures harness overhead; with the arg-max post-processor every sample
/// predicts class 0.
pub struct NullBackend;

pub struct NullModel {
    spec: ModelSpec,
}

impl Backend for NullBackend {
    type Model = NullModel;

    fn name(&self) -> &'static str {
        "null"
    }

    fn version(&self) -> String {
        "-".to_string()
    }

    fn load(&self, _artifact: &ModelArtifact, opts: &LoadOptions) -> Result<NullModel> {
        let io = |names: &[IOName], fallback: &str| -> Vec<TensorSpec> {
            let names = if names.is_empty() {
                vec![IOName::new(fallback)]
            } else {
                names.to_vec()
            };
            names
                .into_iter()
                .map(|name| TensorSpec {
                    name,
                    dtype: DType::F32,
                    rank: 2,
                    dims: vec![None, Some(1)],
                })
                .collect()
        };
        Ok(NullModel {
            spec: ModelSpec {
                inputs: io(&opts.inputs, "input"),
                outputs: io(&opts.outputs, "output"),
            },
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            image_format: ImageFormat::Nhwc,
        }
    }
}

impl BackendModel for NullModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn name(&self) -> &str {
        "null"
    }

    fn version(&self) -> String {
        "-".to_string()
    }

    fn predict(&self, feed: Vec<(IOName, Tensor)>) -> Result<Vec<Tensor>> {
        ensure!(!feed.is_empty(), "null backend got an empty feed");
        let batch = feed[0].1.batch_size().unwrap_or(1);
        let zeros = vec![0.0f32; batch];
        Ok(self
            .spec
            .outputs
            .iter()
            .map(|_| Tensor::from_f32(Shape::from_slice(&[batch, 1]), &zeros))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_is_always_registered() {
        assert!(lookup("null").is_ok());
    }

    #[test]
    fn unknown_backend_names_available_keys() {
        let err = lookup("tensorflow").err().unwrap();
        match err {
            ConfigError::UnknownBackend { name, available } => {
                assert_eq!(name, "tensorflow");
                assert!(available.contains("null"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn null_model_answers_zeros_per_sample() -> Result<()> {
        let opts = LoadOptions {
            outputs: vec![IOName::new("a"), IOName::new("b")],
            ..LoadOptions::default()
        };
        let loaded = (lookup("null")?.build)(&ModelArtifact::Synthetic, &opts)?;
        assert_eq!(loaded.backend, "null");
        assert_eq!(loaded.model.inputs(), vec![IOName::new("input")]);

        let input = Tensor::from_f32(Shape::from_slice(&[3, 2]), &[1.0; 6]);
        let out = loaded.model.predict(vec![(IOName::new("input"), input)])?;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to_f32_vec()?, vec![0.0; 3]);
        Ok(())
    }
}
