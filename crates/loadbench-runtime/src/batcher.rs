use anyhow::{ensure, Result};
use loadbench_core::{Dataset, QuerySample};
use tracing::debug;

use crate::Item;

#[derive(Clone, Copy, Debug)]
pub struct BatchPolicy {
    pub max_batch: usize,
}

/// Splits issued query samples into contiguous items of at most `max_batch`.
///
/// Stateless across calls; ordering of the input is preserved.
#[derive(Clone, Debug)]
pub struct Batcher {
    policy: BatchPolicy,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Result<Self> {
        ensure!(policy.max_batch > 0, "max batch size must be at least 1");
        Ok(Self { policy })
    }

    pub fn max_batch(&self) -> usize {
        self.policy.max_batch
    }

    pub fn partition<'a>(
        &self,
        samples: &'a [QuerySample],
    ) -> impl Iterator<Item = &'a [QuerySample]> + 'a {
        samples.chunks(self.policy.max_batch)
    }

    /// Fetch the dataset rows for each partition and build its item.
    ///
    /// Each partition is paired with its own result so a failed read only
    /// affects the queries of that partition.
    pub fn items<'a>(
        &'a self,
        dataset: &'a dyn Dataset,
        samples: &'a [QuerySample],
    ) -> impl Iterator<Item = (&'a [QuerySample], Result<Item>)> + 'a {
        self.partition(samples).map(move |chunk| {
            (chunk, self.item_for(dataset, chunk))
        })
    }

    /// Build the item for one partition, reading its inputs and labels.
    pub fn item_for(&self, dataset: &dyn Dataset, chunk: &[QuerySample]) -> Result<Item> {
        let content_ids: Vec<usize> = chunk.iter().map(|q| q.index).collect();
        let query_ids = chunk.iter().map(|q| q.id).collect();
        debug!(batch = chunk.len(), first = ?content_ids.first(), "building item");
        let (input, labels) = dataset.get_samples(&content_ids)?;
        Item::new(query_ids, content_ids, input, labels)
    }
}
