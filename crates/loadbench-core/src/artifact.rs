use std::path::PathBuf;

#[derive(Clone, Debug)]
pub enum ModelArtifact {
    OnnxPath(PathBuf),
    /// No file backs the model; used by backends that fabricate outputs.
    Synthetic,
}

impl ModelArtifact {
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ModelArtifact::OnnxPath(p) => Some(p),
            ModelArtifact::Synthetic => None,
        }
    }
}
