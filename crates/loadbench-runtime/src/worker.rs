use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::{Item, RunnerCore};

/// Message on the shared work queue.
#[derive(Debug)]
pub enum Job {
    Run(Item),
    /// One per worker; the worker exits after taking it.
    Stop,
}

/// A pool thread. All workers of a runner pull from the same queue.
pub struct Worker {
    pub id: u32,
    pub inbox: Arc<Mutex<mpsc::Receiver<Job>>>,
    pub core: Arc<RunnerCore>,
}

impl Worker {
    /// Blocking loop; must run on a plain thread, not inside an async runtime.
    pub fn run(self) {
        info!(worker_id = self.id, "worker started");
        loop {
            let job = {
                let mut inbox = self.inbox.lock();
                inbox.blocking_recv()
            };
            match job {
                Some(Job::Run(item)) => self.core.execute(item),
                Some(Job::Stop) | None => break,
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }
}
