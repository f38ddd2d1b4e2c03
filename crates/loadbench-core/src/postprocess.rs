use std::path::Path;

use anyhow::Result;

use crate::{Dataset, Label, RunState, Tensor};

/// Output of [`PostProcessor::process`] for one item.
///
/// The score is only committed to the run once the runner has accepted the
/// records, so a rejected item never touches `good`/`total`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Processed {
    /// One record per query of the item.
    pub records: Vec<Vec<f32>>,
    pub good: u64,
    pub total: u64,
}

/// Turns raw model outputs into one processed record per query and scores them.
pub trait PostProcessor: Send + Sync {
    /// Reset accumulated accuracy records.
    fn start(&self);

    /// Returns exactly one record per entry of `content_ids`.
    fn process(
        &self,
        results: &[Tensor],
        content_ids: &[usize],
        labels: Option<&[Label]>,
    ) -> Result<Processed>;

    fn add_results(&self, processed: &[Vec<f32>]);

    /// May attach a domain metric through [`RunState::set_extra_metric`].
    fn finalize(&self, state: &RunState, dataset: &dyn Dataset, output_dir: &Path) -> Result<()>;
}
