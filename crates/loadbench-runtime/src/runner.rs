use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use loadbench_core::{
    f32_to_bytes, BackendModel, CompletionSink, Dataset, PostProcessor, Processed,
    QueryResponse, QuerySample, RunState,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::{Batcher, Item};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    Draining,
}

/// Entry points the load generator drives during a scenario.
pub trait Runner: Send + Sync {
    /// Begin a run: counters are reset and the post-processor is restarted.
    fn start_run(&self, state: Arc<RunState>, accuracy: bool) -> Result<()>;

    /// Dispatch issued samples. Every sample receives exactly one completion.
    fn enqueue(&self, samples: &[QuerySample]) -> Result<()>;

    /// Stop accepting work and wait until everything queued has completed.
    ///
    /// A runner that executes on the caller's thread never has queued work,
    /// so for it this is a no-op.
    fn finish(&self) -> Result<()>;

    /// Latencies recorded by the runner itself during the current run.
    fn result_timing(&self) -> Vec<f64>;

    fn phase(&self) -> RunPhase;
}

#[derive(Clone)]
struct ActiveRun {
    state: Arc<RunState>,
    accuracy: bool,
}

/// Everything needed to execute an item end to end.
///
/// Shared by reference between the caller thread (inline runner) or every
/// worker (queue runner). Only the run state and the post-processor carry
/// mutable run-wide data, and both synchronize internally.
pub struct RunnerCore {
    model: Arc<dyn BackendModel>,
    dataset: Arc<dyn Dataset>,
    post: Arc<dyn PostProcessor>,
    sink: Arc<dyn CompletionSink>,
    batcher: Batcher,
    run: RwLock<Option<ActiveRun>>,
    phase: Mutex<RunPhase>,
    batch_count: AtomicU64,
}

impl RunnerCore {
    pub fn new(
        model: Arc<dyn BackendModel>,
        dataset: Arc<dyn Dataset>,
        post: Arc<dyn PostProcessor>,
        sink: Arc<dyn CompletionSink>,
        batcher: Batcher,
    ) -> Self {
        Self {
            model,
            dataset,
            post,
            sink,
            batcher,
            run: RwLock::new(None),
            phase: Mutex::new(RunPhase::Idle),
            batch_count: AtomicU64::new(0),
        }
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock() = phase;
    }

    /// Number of items that reached the model since construction.
    pub fn batch_count(&self) -> u64 {
        self.batch_count.load(Ordering::Relaxed)
    }

    pub fn start_run(&self, state: Arc<RunState>, accuracy: bool) {
        state.reset();
        info!(scenario = state.scenario(), accuracy, "run started");
        *self.run.write() = Some(ActiveRun { state, accuracy });
        self.post.start();
        self.set_phase(RunPhase::Running);
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.phase() {
            RunPhase::Running => Ok(()),
            other => bail!("runner is {other:?}; call start_run before enqueue"),
        }
    }

    pub fn result_timing(&self) -> Vec<f64> {
        self.run
            .read()
            .as_ref()
            .map(|run| run.state.snapshot().latencies)
            .unwrap_or_default()
    }

    /// Predict, post-process and report one item.
    ///
    /// Never fails: any error is logged and every query of the item is
    /// completed with an empty payload.
    pub fn execute(&self, item: Item) {
        let run = self.run.read().clone();
        let Item {
            query_ids,
            content_ids,
            input,
            labels,
            enqueued_at,
        } = item;

        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<Vec<f32>>> {
            let run = run.as_ref().context("no active run")?;
            let input_name = self
                .model
                .spec()
                .inputs
                .first()
                .map(|s| s.name.clone())
                .context("model declares no inputs")?;
            let results = self.model.predict(vec![(input_name, input)])?;
            let n = self.batch_count.fetch_add(1, Ordering::Relaxed);
            debug!(batch = n, queries = query_ids.len(), "batch predicted");

            let Processed {
                records: processed,
                good,
                total,
            } = self
                .post
                .process(&results, &content_ids, labels.as_deref())?;
            if processed.len() != query_ids.len() {
                bail!(
                    "post-processor returned {} results for {} queries",
                    processed.len(),
                    query_ids.len()
                );
            }
            run.state.add_outcome(good, total);
            if run.accuracy {
                self.post.add_results(&processed);
                run.state.push_latency(enqueued_at.elapsed().as_secs_f64());
            }
            Ok(processed)
        }))
        .unwrap_or_else(|panic| Err(anyhow!("item execution panicked: {}", panic_message(&panic))));

        let responses = match outcome {
            Ok(processed) => query_ids
                .iter()
                .zip(processed.iter())
                .map(|(id, values)| QueryResponse {
                    id: *id,
                    payload: f32_to_bytes(values),
                })
                .collect(),
            Err(err) => {
                self.log_failure(&content_ids, &err);
                query_ids.iter().copied().map(QueryResponse::empty).collect()
            }
        };
        self.sink.complete(responses);
    }

    /// Complete queries that never became an item.
    pub fn fail_samples(&self, samples: &[QuerySample], err: &anyhow::Error) {
        let content_ids: Vec<usize> = samples.iter().map(|q| q.index).collect();
        self.log_failure(&content_ids, err);
        self.sink
            .complete(samples.iter().map(|q| QueryResponse::empty(q.id)).collect());
    }

    fn log_failure(&self, content_ids: &[usize], err: &anyhow::Error) {
        let src: Vec<String> = content_ids
            .iter()
            .map(|i| self.dataset.item_loc(*i))
            .collect();
        error!(content = ?src, error = ?err, "item failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Executes every item on the caller's thread. Used for single-stream.
pub struct InlineRunner {
    core: Arc<RunnerCore>,
}

impl InlineRunner {
    pub fn new(core: RunnerCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub fn core(&self) -> &RunnerCore {
        &self.core
    }
}

impl Runner for InlineRunner {
    fn start_run(&self, state: Arc<RunState>, accuracy: bool) -> Result<()> {
        self.core.start_run(state, accuracy);
        Ok(())
    }

    fn enqueue(&self, samples: &[QuerySample]) -> Result<()> {
        self.core.ensure_running()?;
        for (chunk, item) in self.core.batcher().items(self.core.dataset(), samples) {
            match item {
                Ok(item) => self.core.execute(item),
                Err(err) => self.core.fail_samples(chunk, &err),
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn result_timing(&self) -> Vec<f64> {
        self.core.result_timing()
    }

    fn phase(&self) -> RunPhase {
        self.core.phase()
    }
}
