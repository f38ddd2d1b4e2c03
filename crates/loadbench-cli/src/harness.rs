use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use loadbench_core::{BackendModel, Dataset, PostProcessor, RunState};
use loadbench_runtime::{
    add_result, BatchPolicy, Batcher, BenchmarkReport, InlineRunner, QueueRunner, Runner,
    RunnerCore,
};
use tracing::{info, warn};

use crate::config::{BenchConfig, Scenario};
use crate::dataset::SyntheticDataset;
use crate::driver::{LocalDriver, TestSettings};
use crate::postprocess;
use crate::registry::LoadedModel;

/// Items in the synthetic dataset when `--count` is not given.
pub const DEFAULT_ITEM_COUNT: usize = 1024;

const WARMUP_PREDICTS: usize = 5;

/// Wires one model, dataset and post-processor to the local driver and runs
/// every configured scenario.
pub struct Harness {
    config: BenchConfig,
    model: Arc<dyn BackendModel>,
    dataset: Arc<SyntheticDataset>,
    post: Arc<dyn PostProcessor>,
    driver: Arc<LocalDriver>,
}

impl Harness {
    pub fn new(config: BenchConfig, loaded: &LoadedModel) -> Self {
        let count = config.count.unwrap_or(DEFAULT_ITEM_COUNT);
        let dataset = SyntheticDataset::new(
            count,
            config.sample_shape(loaded.image_format),
            config.classes,
        );
        let post = postprocess::build(config.postprocess, config.label_offset);
        Self {
            config,
            model: loaded.model.clone(),
            dataset: Arc::new(dataset),
            post,
            driver: Arc::new(LocalDriver::new()),
        }
    }

    /// Push one sample through the model a few times before anything is timed.
    pub fn warmup(&self) -> Result<()> {
        let input = self
            .model
            .inputs()
            .into_iter()
            .next()
            .context("model declares no inputs")?;
        self.dataset.load_query_samples(&[0])?;
        let (sample, _) = self.dataset.get_samples(&[0])?;
        for _ in 0..WARMUP_PREDICTS {
            self.model.predict(vec![(input.clone(), sample.clone())])?;
        }
        self.dataset.unload_query_samples(None)?;
        info!(predicts = WARMUP_PREDICTS, "warmup done");
        Ok(())
    }

    pub fn run(&self, report: &mut BenchmarkReport) -> Result<()> {
        for &scenario in &self.config.scenarios {
            let runner = self.build_runner(scenario)?;
            let outcome = self.run_scenario(runner.as_ref(), scenario, report);
            runner.finish()?;
            outcome?;
        }
        Ok(())
    }

    fn build_runner(&self, scenario: Scenario) -> Result<Box<dyn Runner>> {
        let core = RunnerCore::new(
            self.model.clone(),
            self.dataset.clone(),
            self.post.clone(),
            self.driver.clone(),
            Batcher::new(BatchPolicy {
                max_batch: self.config.max_batchsize,
            })?,
        );
        if scenario.is_pooled() {
            info!(%scenario, threads = self.config.threads, "starting worker pool");
            Ok(Box::new(QueueRunner::new(core, self.config.threads)?))
        } else {
            Ok(Box::new(InlineRunner::new(core)))
        }
    }

    fn run_scenario(&self, runner: &dyn Runner, scenario: Scenario, report: &mut BenchmarkReport) -> Result<()> {
        if scenario == Scenario::Server {
            for latency in &self.config.max_latencies {
                let name = format!("{scenario}-{latency}");
                self.run_once(runner, scenario, &name, report)?;
            }
            return Ok(());
        }
        self.run_once(runner, scenario, scenario.as_str(), report)
    }

    fn run_once(
        &self,
        runner: &dyn Runner,
        scenario: Scenario,
        name: &str,
        report: &mut BenchmarkReport,
    ) -> Result<()> {
        let state = Arc::new(RunState::new(scenario.as_str()));
        runner.start_run(state.clone(), self.config.accuracy)?;

        let settings = TestSettings {
            scenario,
            accuracy: self.config.accuracy,
            query_count: self.query_count(scenario),
            samples_per_query: self.config.samples_per_query,
        };
        let started = Instant::now();
        let driven = self
            .driver
            .start_test(runner, self.dataset.as_ref(), &settings)
            .with_context(|| format!("{name} run failed"))?;
        let took = self
            .dataset
            .last_loaded()
            .unwrap_or(started)
            .elapsed()
            .as_secs_f64();

        if self.config.accuracy {
            self.post
                .finalize(&state, self.dataset.as_ref(), &self.config.output_dir)?;
        }
        if driven.failed > 0 {
            warn!(name, failed = driven.failed, "queries completed without a result");
        }

        let latencies = if driven.latencies.is_empty() {
            runner.result_timing()
        } else {
            driven.latencies
        };
        add_result(report, name, &state.snapshot(), &latencies, took, self.config.accuracy);
        Ok(())
    }

    fn query_count(&self, scenario: Scenario) -> usize {
        match scenario {
            Scenario::SingleStream => self.config.queries_single,
            Scenario::MultiStream | Scenario::Server => self.config.queries_multi,
            Scenario::Offline => self.config.queries_offline,
        }
    }
}
