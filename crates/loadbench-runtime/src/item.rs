use std::time::Instant;

use anyhow::{ensure, Result};
use loadbench_core::{Label, QueryId, Tensor};

/// One unit of dispatch: a batch of queries executed together.
#[derive(Debug)]
pub struct Item {
    pub query_ids: Vec<QueryId>,
    pub content_ids: Vec<usize>,
    pub input: Tensor,
    pub labels: Option<Vec<Label>>,
    pub enqueued_at: Instant,
}

impl Item {
    pub fn new(
        query_ids: Vec<QueryId>,
        content_ids: Vec<usize>,
        input: Tensor,
        labels: Option<Vec<Label>>,
    ) -> Result<Self> {
        ensure!(
            query_ids.len() == content_ids.len(),
            "item has {} query ids but {} content ids",
            query_ids.len(),
            content_ids.len()
        );
        if let Some(batch) = input.batch_size() {
            ensure!(
                batch == query_ids.len(),
                "input batch dimension {batch} does not match {} queries",
                query_ids.len()
            );
        }
        if let Some(labels) = &labels {
            ensure!(
                labels.len() == query_ids.len(),
                "item has {} labels for {} queries",
                labels.len(),
                query_ids.len()
            );
        }
        Ok(Self {
            query_ids,
            content_ids,
            input,
            labels,
            enqueued_at: Instant::now(),
        })
    }
}
