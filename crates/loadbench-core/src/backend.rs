use anyhow::Result;

use crate::{Device, IOName, ImageFormat, ModelArtifact, ModelSpec, Tensor};

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub image_format: ImageFormat,
}

/// Knobs handed to [`Backend::load`]. Names left empty are taken from the model file.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub device: Device,
    pub inputs: Vec<IOName>,
    pub outputs: Vec<IOName>,
    pub intra_threads: Option<usize>,
}

pub trait Backend: Send + Sync + 'static {
    type Model: BackendModel;

    fn name(&self) -> &'static str;
    fn version(&self) -> String;
    fn load(&self, artifact: &ModelArtifact, opts: &LoadOptions) -> Result<Self::Model>;
    fn capabilities(&self) -> BackendCapabilities;
}

/// The model under test.
///
/// `predict` may be called from several worker threads at once. Models that
/// are not re-entrant must serialize internally.
pub trait BackendModel: Send + Sync + 'static {
    fn spec(&self) -> &ModelSpec;

    fn name(&self) -> &str;

    fn version(&self) -> String {
        String::new()
    }

    /// Inputs arrive already batched along the leading dimension.
    fn predict(&self, feed: Vec<(IOName, Tensor)>) -> Result<Vec<Tensor>>;

    fn inputs(&self) -> Vec<IOName> {
        self.spec().input_names().cloned().collect()
    }

    fn outputs(&self) -> Vec<IOName> {
        self.spec().output_names().cloned().collect()
    }
}
