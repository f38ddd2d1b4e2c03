#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use loadbench_core::{
    BackendModel, CompletionSink, DType, Dataset, IOName, Label, ModelSpec, PostProcessor,
    Processed, QueryId, QueryResponse, QuerySample, RunState, Shape, Tensor, TensorSpec,
};
use loadbench_runtime::{BatchPolicy, Batcher, RunnerCore};
use parking_lot::Mutex;

/// Dataset whose sample `i` is the single value `i` with label `i`.
pub struct VecDataset {
    pub len: usize,
    pub reads: AtomicUsize,
}

impl VecDataset {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            reads: AtomicUsize::new(0),
        }
    }
}

impl Dataset for VecDataset {
    fn get_samples(&self, indices: &[usize]) -> Result<(Tensor, Option<Vec<Label>>)> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        for &i in indices {
            ensure!(i < self.len, "index {i} out of range");
        }
        let values: Vec<f32> = indices.iter().map(|i| *i as f32).collect();
        let input = Tensor::from_f32(Shape::from_slice(&[indices.len(), 1]), &values);
        let labels = indices.iter().map(|i| *i as Label).collect();
        Ok((input, Some(labels)))
    }

    fn item_count(&self) -> usize {
        self.len
    }

    fn item_loc(&self, index: usize) -> String {
        format!("mem://{index}")
    }

    fn load_query_samples(&self, _indices: &[usize]) -> Result<()> {
        Ok(())
    }

    fn unload_query_samples(&self, _indices: Option<&[usize]>) -> Result<()> {
        Ok(())
    }
}

fn spec() -> ModelSpec {
    ModelSpec {
        inputs: vec![TensorSpec {
            name: IOName::new("x"),
            dtype: DType::F32,
            rank: 2,
            dims: vec![None, Some(1)],
        }],
        outputs: vec![TensorSpec {
            name: IOName::new("y"),
            dtype: DType::F32,
            rank: 2,
            dims: vec![None, Some(1)],
        }],
    }
}

/// Returns its input. Fails for any batch containing `fail_on`.
pub struct EchoModel {
    spec: ModelSpec,
    pub fail_on: Option<f32>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl EchoModel {
    pub fn new() -> Self {
        Self {
            spec: spec(),
            fail_on: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(value: usize) -> Self {
        Self {
            fail_on: Some(value as f32),
            ..Self::new()
        }
    }
}

impl BackendModel for EchoModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn name(&self) -> &str {
        "echo"
    }

    fn predict(&self, feed: Vec<(IOName, Tensor)>) -> Result<Vec<Tensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let (name, input) = feed.into_iter().next().expect("feed has one input");
        assert_eq!(name.as_str(), "x");
        if let Some(bad) = self.fail_on {
            if input.to_f32_vec()?.contains(&bad) {
                bail!("poisoned sample {bad}");
            }
        }
        Ok(vec![input])
    }
}

/// Scores a query as good when the echoed value equals its label.
#[derive(Default)]
pub struct EchoPost {
    pub starts: AtomicUsize,
    pub accumulated: Mutex<Vec<Vec<f32>>>,
}

impl EchoPost {
    fn score(&self, results: &[Tensor], labels: Option<&[Label]>) -> Result<Processed> {
        let values = results[0].to_f32_vec()?;
        let mut good = 0;
        for (i, v) in values.iter().enumerate() {
            if labels.map(|l| l[i] as f32) == Some(*v) {
                good += 1;
            }
        }
        Ok(Processed {
            total: values.len() as u64,
            records: values.into_iter().map(|v| vec![v]).collect(),
            good,
        })
    }
}

impl PostProcessor for EchoPost {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.accumulated.lock().clear();
    }

    fn process(
        &self,
        results: &[Tensor],
        _content_ids: &[usize],
        labels: Option<&[Label]>,
    ) -> Result<Processed> {
        self.score(results, labels)
    }

    fn add_results(&self, processed: &[Vec<f32>]) {
        self.accumulated.lock().extend_from_slice(processed);
    }

    fn finalize(&self, _state: &RunState, _dataset: &dyn Dataset, _output_dir: &Path) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Error,
    Panic,
    /// Scores the whole item but returns one record too few.
    ShortRecords,
}

/// Behaves like [`EchoPost`] except for items containing `poison`.
pub struct FaultyPost {
    pub inner: EchoPost,
    pub poison: usize,
    pub fault: Fault,
}

impl FaultyPost {
    pub fn new(poison: usize, fault: Fault) -> Self {
        Self {
            inner: EchoPost::default(),
            poison,
            fault,
        }
    }
}

impl PostProcessor for FaultyPost {
    fn start(&self) {
        self.inner.start();
    }

    fn process(
        &self,
        results: &[Tensor],
        content_ids: &[usize],
        labels: Option<&[Label]>,
    ) -> Result<Processed> {
        let mut processed = self.inner.score(results, labels)?;
        if !content_ids.contains(&self.poison) {
            return Ok(processed);
        }
        match self.fault {
            Fault::Error => bail!("cannot score sample {}", self.poison),
            Fault::Panic => panic!("scorer crashed on sample {}", self.poison),
            Fault::ShortRecords => {
                processed.records.pop();
                Ok(processed)
            }
        }
    }

    fn add_results(&self, processed: &[Vec<f32>]) {
        self.inner.add_results(processed);
    }

    fn finalize(&self, state: &RunState, dataset: &dyn Dataset, output_dir: &Path) -> Result<()> {
        self.inner.finalize(state, dataset, output_dir)
    }
}

/// Records every completion the runner reports.
#[derive(Default)]
pub struct RecordingSink {
    pub responses: Mutex<Vec<QueryResponse>>,
    pub calls: AtomicUsize,
}

impl RecordingSink {
    pub fn counts(&self) -> HashMap<QueryId, usize> {
        let mut counts = HashMap::new();
        for r in self.responses.lock().iter() {
            *counts.entry(r.id).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }
}

impl CompletionSink for RecordingSink {
    fn complete(&self, responses: Vec<QueryResponse>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses.lock().extend(responses);
    }
}

pub fn samples(n: usize) -> Vec<QuerySample> {
    (0..n).map(|i| QuerySample::new(i, 1000 + i as u64)).collect()
}

pub fn core(
    model: Arc<dyn BackendModel>,
    dataset: Arc<dyn Dataset>,
    post: Arc<dyn PostProcessor>,
    sink: Arc<dyn CompletionSink>,
    max_batch: usize,
) -> RunnerCore {
    let batcher = Batcher::new(BatchPolicy { max_batch }).expect("valid batch size");
    RunnerCore::new(model, dataset, post, sink, batcher)
}
