use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, ensure, Context, Result};
use loadbench_core::{QuerySample, RunState};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{Job, RunPhase, Runner, RunnerCore, Worker};

/// Work queue slots per worker. Producers block once the queue is full.
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Fixed pool of worker threads behind one bounded queue.
///
/// `enqueue` only fetches and pushes; execution and completion happen on the
/// workers. Must not be driven from inside an async runtime, since pushes
/// block the caller when the queue is full.
pub struct QueueRunner {
    core: Arc<RunnerCore>,
    tx: mpsc::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl QueueRunner {
    pub fn new(core: RunnerCore, threads: usize) -> Result<Self> {
        ensure!(threads > 0, "queue runner needs at least one worker thread");
        let core = Arc::new(core);
        let (tx, rx) = mpsc::channel(threads * QUEUE_DEPTH_PER_WORKER);
        let inbox = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let worker = Worker {
                id: id as u32,
                inbox: inbox.clone(),
                core: core.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("loadbench-worker-{id}"))
                .spawn(move || worker.run())
                .context("failed to spawn worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            core,
            tx,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn core(&self) -> &RunnerCore {
        &self.core
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn shut_down(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return Ok(());
        }
        self.core.set_phase(RunPhase::Draining);
        for _ in 0..workers.len() {
            // Workers that are already gone dropped the receiver; nothing to stop.
            if self.tx.blocking_send(Job::Stop).is_err() {
                break;
            }
        }
        let mut panicked = 0;
        for handle in workers {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        self.core.set_phase(RunPhase::Idle);
        info!(threads = self.threads, "worker pool drained");
        if panicked > 0 {
            bail!("{panicked} worker thread(s) panicked");
        }
        Ok(())
    }
}

impl Runner for QueueRunner {
    fn start_run(&self, state: Arc<RunState>, accuracy: bool) -> Result<()> {
        ensure!(
            !self.workers.lock().is_empty(),
            "queue runner has been finished; build a new one"
        );
        self.core.start_run(state, accuracy);
        Ok(())
    }

    fn enqueue(&self, samples: &[QuerySample]) -> Result<()> {
        self.core.ensure_running()?;
        let batcher = self.core.batcher();
        let mut closed = false;
        for chunk in batcher.partition(samples) {
            if closed {
                self.core
                    .fail_samples(chunk, &anyhow::anyhow!("work queue closed"));
                continue;
            }
            match batcher.item_for(self.core.dataset(), chunk) {
                Ok(item) => {
                    if self.tx.blocking_send(Job::Run(item)).is_err() {
                        closed = true;
                        self.core
                            .fail_samples(chunk, &anyhow::anyhow!("work queue closed"));
                    }
                }
                Err(err) => self.core.fail_samples(chunk, &err),
            }
        }
        if closed {
            bail!("work queue closed while enqueueing {} samples", samples.len());
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.shut_down()
    }

    fn result_timing(&self) -> Vec<f64> {
        self.core.result_timing()
    }

    fn phase(&self) -> RunPhase {
        self.core.phase()
    }
}

impl Drop for QueueRunner {
    fn drop(&mut self) {
        if let Err(err) = self.shut_down() {
            error!(error = ?err, "queue runner shutdown failed");
        }
    }
}
