use parking_lot::Mutex;

/// Per-run counters shared by every worker of a runner.
///
/// All mutation goes through one lock so `good`, `total` and the latency list
/// never lose updates under concurrent workers.
#[derive(Debug)]
pub struct RunState {
    scenario: String,
    inner: Mutex<Tally>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tally {
    pub good: u64,
    pub total: u64,
    /// Per-query latency in seconds, recorded by the runner in accuracy mode.
    pub latencies: Vec<f64>,
    /// Domain metric attached by the post-processor at finalize (mAP for detection).
    pub extra_metric: Option<f64>,
}

impl RunState {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            inner: Mutex::new(Tally::default()),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn add_outcome(&self, good: u64, total: u64) {
        let mut t = self.inner.lock();
        t.good += good;
        t.total += total;
    }

    pub fn push_latency(&self, seconds: f64) {
        self.inner.lock().latencies.push(seconds);
    }

    pub fn set_extra_metric(&self, value: f64) {
        self.inner.lock().extra_metric = Some(value);
    }

    pub fn snapshot(&self) -> Tally {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Tally::default();
    }
}
