use std::time::Instant;

use anyhow::Result;

use crate::Tensor;

/// Ground truth for one dataset entry.
pub type Label = i64;

/// Source of pre-processed samples, addressed by index.
///
/// The load generator decides which indices are resident through
/// `load_query_samples`/`unload_query_samples`; the runner only reads.
pub trait Dataset: Send + Sync {
    /// Batch the inputs of `indices` along a new leading dimension.
    fn get_samples(&self, indices: &[usize]) -> Result<(Tensor, Option<Vec<Label>>)>;

    fn item_count(&self) -> usize;

    /// Human readable location of an entry, for diagnostics.
    fn item_loc(&self, index: usize) -> String;

    fn load_query_samples(&self, indices: &[usize]) -> Result<()>;

    /// `None` unloads everything.
    fn unload_query_samples(&self, indices: Option<&[usize]>) -> Result<()>;

    fn last_loaded(&self) -> Option<Instant> {
        None
    }
}
