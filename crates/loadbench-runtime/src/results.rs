use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use loadbench_core::Tally;
use serde::Serialize;
use tracing::info;

/// Latency percentiles reported for every run.
pub const PERCENTILES: [f64; 6] = [50.0, 80.0, 90.0, 95.0, 99.0, 99.9];

/// Summary of one scenario run (one per target latency for server).
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SummaryResult {
    #[serde(skip)]
    pub name: String,
    pub took: f64,
    pub mean: f64,
    pub percentiles: BTreeMap<String, f64>,
    pub qps: f64,
    pub count: usize,
    pub good_items: u64,
    pub total_items: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(rename = "mAP", skip_serializing_if = "Option::is_none")]
    pub map: Option<f64>,
}

/// All results of one benchmark invocation, keyed by run name.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BenchmarkReport {
    pub runtime: String,
    pub version: String,
    pub time: u64,
    pub cmdline: String,
    #[serde(flatten)]
    pub results: BTreeMap<String, SummaryResult>,
}

impl BenchmarkReport {
    pub fn new(runtime: impl Into<String>, version: impl Into<String>, cmdline: impl Into<String>) -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            runtime: runtime.into(),
            version: version.into(),
            time,
            cmdline: cmdline.into(),
            results: BTreeMap::new(),
        }
    }

    /// Pretty JSON with keys sorted at every level.
    pub fn to_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write report to {}", path.display()))
    }
}

/// Linear interpolation between closest ranks. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

pub fn percentiles(samples: &[f64], ps: &[f64]) -> Vec<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    ps.iter().map(|p| percentile(&sorted, *p)).collect()
}

/// Aggregate one run into `report` under `name`.
///
/// `latencies` are per-query seconds as reported by the load generator,
/// `took` the wall time of the run in seconds.
pub fn add_result<'a>(
    report: &'a mut BenchmarkReport,
    name: &str,
    tally: &Tally,
    latencies: &[f64],
    took: f64,
    show_accuracy: bool,
) -> &'a SummaryResult {
    let buckets = percentiles(latencies, &PERCENTILES);
    let count = latencies.len();
    let mean = if count == 0 {
        0.0
    } else {
        latencies.iter().sum::<f64>() / count as f64
    };
    let qps = if took > 0.0 { count as f64 / took } else { 0.0 };
    let total = if tally.total == 0 { count as u64 } else { tally.total };

    let mut result = SummaryResult {
        name: name.to_string(),
        took,
        mean,
        percentiles: PERCENTILES
            .iter()
            .zip(&buckets)
            .map(|(p, v)| (format!("{p:?}"), *v))
            .collect(),
        qps,
        count,
        good_items: tally.good,
        total_items: total,
        accuracy: None,
        map: None,
    };

    let mut acc_str = String::new();
    if show_accuracy {
        let accuracy = if total == 0 {
            0.0
        } else {
            100.0 * tally.good as f64 / total as f64
        };
        result.accuracy = Some(accuracy);
        acc_str = format!(", acc={accuracy:.4}");
        if let Some(map) = tally.extra_metric {
            result.map = Some(map);
            acc_str.push_str(&format!(", mAP={map:.15}"));
        }
    }

    let tiles = PERCENTILES
        .iter()
        .zip(&buckets)
        .map(|(p, b)| format!("{p:?}:{b:.4}"))
        .collect::<Vec<_>>()
        .join(",");
    info!(
        "{name} qps={:.2}, mean={:.4}, time={took:.2}{acc_str}, queries={count}, tiles={tiles}",
        result.qps, result.mean
    );

    report.results.insert(name.to_string(), result);
    &report.results[name]
}
