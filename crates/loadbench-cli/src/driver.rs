use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::Result;
use loadbench_core::{CompletionSink, Dataset, QueryId, QueryResponse, QuerySample};
use loadbench_runtime::Runner;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::Scenario;

/// Upper bound on the distinct samples a performance run cycles through.
pub const PERFORMANCE_SAMPLE_COUNT: usize = 1000;

#[derive(Clone, Copy, Debug)]
pub struct TestSettings {
    pub scenario: Scenario,
    pub accuracy: bool,
    /// Queries to issue in performance mode. Ignored in accuracy mode.
    pub query_count: usize,
    pub samples_per_query: usize,
}

impl TestSettings {
    fn group_size(&self, total: usize) -> usize {
        match self.scenario {
            Scenario::SingleStream | Scenario::Server => 1,
            Scenario::MultiStream => self.samples_per_query.max(1),
            Scenario::Offline => total.max(1),
        }
    }

    /// Whether each issue waits for its completions before the next one.
    fn waits_per_issue(&self) -> bool {
        matches!(self.scenario, Scenario::SingleStream | Scenario::MultiStream)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriverReport {
    /// Issue to completion, in seconds, one entry per completed query.
    pub latencies: Vec<f64>,
    pub issued: usize,
    pub completed: usize,
    pub unexpected_completions: usize,
    pub duplicate_completions: usize,
    /// Completions that carried no payload.
    pub failed: usize,
}

#[derive(Default)]
struct Ledger {
    next_id: u64,
    outstanding: HashMap<QueryId, Instant>,
    answered: HashSet<QueryId>,
    report: DriverReport,
}

/// In-process load generator.
///
/// Issues queries to a [`Runner`] in the shape of a scenario and is itself the
/// runner's [`CompletionSink`], so it sees every response and can check that
/// each issued query completes exactly once.
#[derive(Default)]
pub struct LocalDriver {
    ledger: Mutex<Ledger>,
    drained: Condvar,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.ledger.lock().outstanding.len()
    }

    /// Run one test against `runner`, which must already be started.
    ///
    /// Loads the samples the test needs, issues them, waits until every
    /// issued query has completed, then unloads.
    pub fn start_test(
        &self,
        runner: &dyn Runner,
        dataset: &dyn Dataset,
        settings: &TestSettings,
    ) -> Result<DriverReport> {
        {
            let mut ledger = self.ledger.lock();
            ledger.outstanding.clear();
            ledger.answered.clear();
            ledger.report = DriverReport::default();
        }

        let indices = schedule(dataset.item_count(), settings);
        let mut resident: Vec<usize> = indices.clone();
        resident.sort_unstable();
        resident.dedup();
        dataset.load_query_samples(&resident)?;
        info!(
            scenario = %settings.scenario,
            accuracy = settings.accuracy,
            queries = indices.len(),
            resident = resident.len(),
            "test started"
        );

        let outcome = self.issue_all(runner, &indices, settings);
        self.wait_idle();
        dataset.unload_query_samples(Some(&resident))?;
        outcome?;

        let report = std::mem::take(&mut self.ledger.lock().report);
        if report.unexpected_completions > 0 || report.duplicate_completions > 0 {
            warn!(
                unexpected = report.unexpected_completions,
                duplicates = report.duplicate_completions,
                "runner violated the completion protocol"
            );
        }
        info!(
            scenario = %settings.scenario,
            issued = report.issued,
            completed = report.completed,
            failed = report.failed,
            "test finished"
        );
        Ok(report)
    }

    fn issue_all(&self, runner: &dyn Runner, indices: &[usize], settings: &TestSettings) -> Result<()> {
        for group in indices.chunks(settings.group_size(indices.len())) {
            let samples = self.register(group);
            debug!(samples = samples.len(), "issuing query");
            if let Err(err) = runner.enqueue(&samples) {
                self.forget(&samples);
                return Err(err);
            }
            if settings.waits_per_issue() {
                self.wait_idle();
            }
        }
        Ok(())
    }

    fn register(&self, indices: &[usize]) -> Vec<QuerySample> {
        let mut ledger = self.ledger.lock();
        let now = Instant::now();
        let samples: Vec<QuerySample> = indices
            .iter()
            .map(|&index| {
                ledger.next_id += 1;
                QuerySample::new(index, ledger.next_id)
            })
            .collect();
        for q in &samples {
            ledger.outstanding.insert(q.id, now);
        }
        ledger.report.issued += samples.len();
        samples
    }

    /// Drop queries the runner refused so waiting for them cannot hang.
    fn forget(&self, samples: &[QuerySample]) {
        let mut ledger = self.ledger.lock();
        for q in samples {
            ledger.outstanding.remove(&q.id);
        }
        self.drained.notify_all();
    }

    fn wait_idle(&self) {
        let mut ledger = self.ledger.lock();
        while !ledger.outstanding.is_empty() {
            self.drained.wait(&mut ledger);
        }
    }
}

impl CompletionSink for LocalDriver {
    fn complete(&self, responses: Vec<QueryResponse>) {
        let done = Instant::now();
        let mut ledger = self.ledger.lock();
        for r in responses {
            match ledger.outstanding.remove(&r.id) {
                Some(issued) => {
                    let report = &mut ledger.report;
                    report.latencies.push(done.duration_since(issued).as_secs_f64());
                    report.completed += 1;
                    if r.payload.is_empty() {
                        report.failed += 1;
                    }
                    ledger.answered.insert(r.id);
                }
                None if ledger.answered.contains(&r.id) => ledger.report.duplicate_completions += 1,
                None => ledger.report.unexpected_completions += 1,
            }
        }
        if ledger.outstanding.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Dataset indices to issue, in order.
fn schedule(item_count: usize, settings: &TestSettings) -> Vec<usize> {
    if settings.accuracy {
        return (0..item_count).collect();
    }
    let pool = item_count.min(PERFORMANCE_SAMPLE_COUNT);
    if pool == 0 {
        return Vec::new();
    }
    let per_query = match settings.scenario {
        Scenario::MultiStream => settings.samples_per_query.max(1),
        _ => 1,
    };
    (0..settings.query_count * per_query).map(|i| i % pool).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(scenario: Scenario, accuracy: bool, query_count: usize) -> TestSettings {
        TestSettings {
            scenario,
            accuracy,
            query_count,
            samples_per_query: 4,
        }
    }

    #[test]
    fn accuracy_issues_every_index_once() {
        let s = settings(Scenario::Offline, true, 7);
        assert_eq!(schedule(5, &s), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn performance_cycles_through_bounded_pool() {
        let s = settings(Scenario::Server, false, 2500);
        let indices = schedule(5000, &s);
        assert_eq!(indices.len(), 2500);
        assert_eq!(indices[1000], 0);
        assert!(indices.iter().all(|i| *i < PERFORMANCE_SAMPLE_COUNT));

        let s = settings(Scenario::MultiStream, false, 3);
        assert_eq!(schedule(2, &s).len(), 12);
        assert!(schedule(0, &s).is_empty());
    }

    #[test]
    fn group_shape_follows_scenario() {
        assert_eq!(settings(Scenario::SingleStream, false, 1).group_size(10), 1);
        assert_eq!(settings(Scenario::MultiStream, false, 1).group_size(10), 4);
        assert_eq!(settings(Scenario::Server, false, 1).group_size(10), 1);
        assert_eq!(settings(Scenario::Offline, false, 1).group_size(10), 10);
    }

    #[test]
    fn stray_and_repeated_completions_are_counted() {
        let driver = LocalDriver::new();
        let issued = driver.register(&[0, 1]);
        assert_eq!(driver.outstanding(), 2);

        driver.complete(vec![QueryResponse::empty(issued[0].id)]);
        driver.complete(vec![
            QueryResponse::empty(issued[0].id),
            QueryResponse::empty(QueryId(999)),
        ]);
        driver.forget(&issued[1..]);
        driver.wait_idle();

        let report = driver.ledger.lock().report.clone();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.duplicate_completions, 1);
        assert_eq!(report.unexpected_completions, 1);
        assert_eq!(report.latencies.len(), 1);
    }
}
