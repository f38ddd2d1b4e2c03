use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use loadbench_core::{Dataset, Label, PostProcessor, Processed, RunState, Tensor};
use parking_lot::Mutex;
use tracing::info;

use crate::config::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostKind {
    /// Output already holds the class id per sample.
    Common,
    /// Output holds per-class scores; the best one wins.
    ArgMax,
    /// Object detection. Positions of the class and score outputs in the
    /// model's declared output list.
    Detection { classes: usize, scores: usize },
}

impl FromStr for PostKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "common" => Ok(PostKind::Common),
            "argmax" => Ok(PostKind::ArgMax),
            // num_detections, detection_boxes, detection_scores, detection_classes
            "coco" => Ok(PostKind::Detection {
                classes: 3,
                scores: 2,
            }),
            // bboxes, labels, scores
            "coco-onnx" => Ok(PostKind::Detection {
                classes: 1,
                scores: 2,
            }),
            other => Err(ConfigError::Invalid {
                field: "post-processor",
                reason: format!("`{other}` is not one of argmax, common, coco, coco-onnx"),
            }),
        }
    }
}

pub fn build(kind: PostKind, offset: i64) -> Arc<dyn PostProcessor> {
    match kind {
        PostKind::Common | PostKind::ArgMax => Arc::new(Classification::new(kind, offset)),
        PostKind::Detection { classes, scores } => {
            Arc::new(Detection::new(classes, scores, offset))
        }
    }
}

fn write_accuracy(output_dir: &Path, doc: &serde_json::Value) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join("accuracy.json");
    std::fs::write(&path, serde_json::to_string_pretty(doc)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "accuracy written");
    Ok(())
}

/// Per-sample rows of one output, or an error if it cannot be split evenly.
fn rows(output: &Tensor, batch: usize) -> Result<(Vec<f64>, usize)> {
    let values = output.to_f64_vec()?;
    ensure!(
        batch > 0 && !values.is_empty() && values.len() % batch == 0,
        "output of {} values cannot be split into {batch} samples",
        values.len()
    );
    let per_sample = values.len() / batch;
    Ok((values, per_sample))
}

fn output_at<'a>(results: &'a [Tensor], index: usize, what: &str) -> Result<&'a Tensor> {
    results
        .get(index)
        .with_context(|| format!("model has no {what} output at position {index}"))
}

/// Top-1 classification scoring against dataset labels.
pub struct Classification {
    kind: PostKind,
    offset: i64,
    accumulated: Mutex<Vec<Vec<f32>>>,
}

impl Classification {
    pub fn new(kind: PostKind, offset: i64) -> Self {
        Self {
            kind,
            offset,
            accumulated: Mutex::new(Vec::new()),
        }
    }

    fn predict(&self, row: &[f64]) -> i64 {
        let class = match self.kind {
            PostKind::ArgMax => argmax(row) as i64,
            _ => row.first().copied().unwrap_or_default() as i64,
        };
        class + self.offset
    }
}

fn argmax(row: &[f64]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
}

impl PostProcessor for Classification {
    fn start(&self) {
        self.accumulated.lock().clear();
    }

    fn process(
        &self,
        results: &[Tensor],
        content_ids: &[usize],
        labels: Option<&[Label]>,
    ) -> Result<Processed> {
        let output = results.first().context("model returned no outputs")?;
        let batch = content_ids.len();
        let (values, per_sample) = rows(output, batch)?;

        let mut processed = Processed {
            total: batch as u64,
            ..Processed::default()
        };
        for (i, row) in values.chunks_exact(per_sample).enumerate() {
            let predicted = self.predict(row);
            if labels.and_then(|l| l.get(i)) == Some(&predicted) {
                processed.good += 1;
            }
            processed.records.push(vec![predicted as f32]);
        }
        Ok(processed)
    }

    fn add_results(&self, processed: &[Vec<f32>]) {
        self.accumulated.lock().extend_from_slice(processed);
    }

    fn finalize(&self, state: &RunState, dataset: &dyn Dataset, output_dir: &Path) -> Result<()> {
        let tally = state.snapshot();
        let predictions = self.accumulated.lock().clone();
        write_accuracy(
            output_dir,
            &serde_json::json!({
                "scenario": state.scenario(),
                "dataset_items": dataset.item_count(),
                "good": tally.good,
                "total": tally.total,
                "predictions": predictions,
            }),
        )
    }
}

/// Detection scoring against one ground-truth class per sample.
///
/// A sample counts as good when its highest-scoring detection has the
/// sample's class. At finalize, the mean average precision over classes is
/// attached to the run. Records are `[content_id, class, score, class, score, ..]`.
pub struct Detection {
    classes: usize,
    scores: usize,
    offset: i64,
    ground_truth: Mutex<HashMap<usize, Label>>,
    accumulated: Mutex<Vec<Vec<f32>>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Scored {
    content_id: usize,
    class: Label,
    score: f64,
}

impl Detection {
    pub fn new(classes: usize, scores: usize, offset: i64) -> Self {
        Self {
            classes,
            scores,
            offset,
            ground_truth: Mutex::new(HashMap::new()),
            accumulated: Mutex::new(Vec::new()),
        }
    }

    fn detections(&self) -> Vec<Scored> {
        self.accumulated
            .lock()
            .iter()
            .filter_map(|record| {
                let (id, pairs) = record.split_first()?;
                Some(pairs.chunks_exact(2).map(move |p| Scored {
                    content_id: *id as usize,
                    class: p[0] as Label,
                    score: f64::from(p[1]),
                }))
            })
            .flatten()
            .collect()
    }
}

impl PostProcessor for Detection {
    fn start(&self) {
        self.accumulated.lock().clear();
        self.ground_truth.lock().clear();
    }

    fn process(
        &self,
        results: &[Tensor],
        content_ids: &[usize],
        labels: Option<&[Label]>,
    ) -> Result<Processed> {
        let batch = content_ids.len();
        let (classes, per_sample) = rows(output_at(results, self.classes, "class")?, batch)?;
        let (scores, score_cols) = rows(output_at(results, self.scores, "score")?, batch)?;
        ensure!(
            per_sample == score_cols,
            "{per_sample} classes but {score_cols} scores per sample"
        );

        if let Some(labels) = labels {
            let mut gt = self.ground_truth.lock();
            gt.extend(content_ids.iter().copied().zip(labels.iter().copied()));
        }

        let mut processed = Processed {
            total: batch as u64,
            ..Processed::default()
        };
        for (i, (cls, sc)) in classes
            .chunks_exact(per_sample)
            .zip(scores.chunks_exact(per_sample))
            .enumerate()
        {
            let mut record = Vec::with_capacity(1 + 2 * per_sample);
            record.push(content_ids[i] as f32);
            let mut best: Option<(Label, f64)> = None;
            for (c, s) in cls.iter().zip(sc) {
                let class = *c as Label + self.offset;
                if best.map_or(true, |(_, top)| *s > top) {
                    best = Some((class, *s));
                }
                record.extend([class as f32, *s as f32]);
            }
            if let (Some((class, _)), Some(label)) = (best, labels.and_then(|l| l.get(i))) {
                if class == *label {
                    processed.good += 1;
                }
            }
            processed.records.push(record);
        }
        Ok(processed)
    }

    fn add_results(&self, processed: &[Vec<f32>]) {
        self.accumulated.lock().extend_from_slice(processed);
    }

    fn finalize(&self, state: &RunState, dataset: &dyn Dataset, output_dir: &Path) -> Result<()> {
        let detections = self.detections();
        let ground_truth = self.ground_truth.lock().clone();
        let map = mean_average_precision(&detections, &ground_truth);
        state.set_extra_metric(map);

        let tally = state.snapshot();
        write_accuracy(
            output_dir,
            &serde_json::json!({
                "scenario": state.scenario(),
                "dataset_items": dataset.item_count(),
                "good": tally.good,
                "total": tally.total,
                "detections": detections.len(),
                "mAP": map,
            }),
        )
    }
}

/// Mean over ground-truth classes of non-interpolated average precision.
///
/// Each sample holds one object of its label; the first detection of that
/// class in a sample is a true positive, any further one a false positive.
fn mean_average_precision(detections: &[Scored], ground_truth: &HashMap<usize, Label>) -> f64 {
    let mut per_class: HashMap<Label, usize> = HashMap::new();
    for label in ground_truth.values() {
        *per_class.entry(*label).or_default() += 1;
    }
    if per_class.is_empty() {
        return 0.0;
    }

    let mut sum = 0.0;
    for (&class, &positives) in &per_class {
        let mut ranked: Vec<&Scored> = detections.iter().filter(|d| d.class == class).collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut matched = HashSet::new();
        let mut hits = 0usize;
        let mut precision_sum = 0.0;
        for (rank, d) in ranked.iter().enumerate() {
            if ground_truth.get(&d.content_id) == Some(&class) && matched.insert(d.content_id) {
                hits += 1;
                precision_sum += hits as f64 / (rank + 1) as f64;
            }
        }
        sum += precision_sum / positives as f64;
    }
    sum / per_class.len() as f64
}

#[cfg(test)]
mod tests {
    use loadbench_core::{DType, Shape};

    use super::*;

    #[test]
    fn argmax_scores_against_labels() -> Result<()> {
        let post = Classification::new(PostKind::ArgMax, 0);
        let logits = Tensor::from_f32(Shape::from_slice(&[2, 3]), &[0.1, 0.7, 0.2, 0.9, 0.0, 0.1]);

        let out = post.process(&[logits], &[4, 5], Some(&[1, 2][..]))?;
        assert_eq!(out.records, vec![vec![1.0], vec![0.0]]);
        assert_eq!((out.good, out.total), (1, 2));
        Ok(())
    }

    #[test]
    fn common_applies_offset_to_class_ids() -> Result<()> {
        let post = Classification::new(PostKind::Common, -1);
        let bytes: Vec<u8> = [3i64, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
        let ids = Tensor::from_cpu_bytes(DType::I64, Shape::from_slice(&[2]), bytes.into());

        let out = post.process(&[ids], &[0, 1], Some(&[2, 2][..]))?;
        assert_eq!(out.records, vec![vec![2.0], vec![7.0]]);
        assert_eq!(out.good, 1);
        Ok(())
    }

    #[test]
    fn ragged_output_is_an_error() {
        let post = Classification::new(PostKind::ArgMax, 0);
        let out = Tensor::from_f32(Shape::from_slice(&[3]), &[0.0, 1.0, 2.0]);
        assert!(post.process(&[out], &[0, 1], None).is_err());
    }

    #[test]
    fn finalize_writes_accumulated_predictions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let post = Classification::new(PostKind::ArgMax, 0);
        let state = RunState::new("Offline");
        post.add_results(&[vec![1.0], vec![2.0]]);
        let dataset = crate::dataset::SyntheticDataset::new(2, Shape::from_slice(&[1]), 2);

        post.finalize(&state, &dataset, dir.path())?;
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("accuracy.json"))?)?;
        assert_eq!(doc["scenario"], "Offline");
        assert_eq!(doc["predictions"].as_array().unwrap().len(), 2);

        post.start();
        assert!(post.accumulated.lock().is_empty());
        Ok(())
    }

    #[test]
    fn detection_profiles_select_output_layouts() {
        assert_eq!(
            "coco".parse::<PostKind>(),
            Ok(PostKind::Detection { classes: 3, scores: 2 })
        );
        assert_eq!(
            "coco-onnx".parse::<PostKind>(),
            Ok(PostKind::Detection { classes: 1, scores: 2 })
        );
        assert!("yolo".parse::<PostKind>().is_err());
    }

    /// bboxes, labels, scores for two samples with two detections each.
    fn onnx_outputs(labels: [f32; 4], scores: [f32; 4]) -> Vec<Tensor> {
        vec![
            Tensor::from_f32(Shape::from_slice(&[2, 2, 4]), &[0.0; 16]),
            Tensor::from_f32(Shape::from_slice(&[2, 2]), &labels),
            Tensor::from_f32(Shape::from_slice(&[2, 2]), &scores),
        ]
    }

    #[test]
    fn top_detection_decides_good() -> Result<()> {
        let post = Detection::new(1, 2, 0);
        let outputs = onnx_outputs([3.0, 1.0, 2.0, 5.0], [0.2, 0.9, 0.8, 0.1]);

        let out = post.process(&outputs, &[10, 11], Some(&[1, 5][..]))?;
        assert_eq!((out.good, out.total), (1, 2));
        assert_eq!(out.records[0], vec![10.0, 3.0, 0.2, 1.0, 0.9]);
        Ok(())
    }

    #[test]
    fn missing_detection_output_is_an_error() {
        let post = Detection::new(3, 2, 0);
        let outputs = onnx_outputs([0.0; 4], [0.0; 4]);
        assert!(post.process(&outputs, &[0, 1], None).is_err());
    }

    #[test]
    fn map_rewards_ranking_true_positives_first() {
        let gt: HashMap<usize, Label> = [(0, 1), (1, 1), (2, 2)].into_iter().collect();
        let det = |content_id, class, score| Scored {
            content_id,
            class,
            score,
        };
        let perfect = [det(0, 1, 0.9), det(1, 1, 0.8), det(2, 2, 0.7)];
        assert!((mean_average_precision(&perfect, &gt) - 1.0).abs() < 1e-12);

        // class 1: FP ranked first, then both hits -> (1/2 + 2/3) / 2; class 2 missed
        let noisy = [det(2, 1, 0.95), det(0, 1, 0.9), det(1, 1, 0.8)];
        let expected = ((0.5 + 2.0 / 3.0) / 2.0 + 0.0) / 2.0;
        assert!((mean_average_precision(&noisy, &gt) - expected).abs() < 1e-12);
        assert_eq!(mean_average_precision(&noisy, &HashMap::new()), 0.0);
    }

    #[test]
    fn finalize_attaches_map_to_the_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let post = Detection::new(1, 2, 0);
        let state = RunState::new("Offline");
        post.start();

        let outputs = onnx_outputs([1.0, 0.0, 2.0, 0.0], [0.9, 0.1, 0.8, 0.1]);
        let out = post.process(&outputs, &[0, 1], Some(&[1, 2][..]))?;
        post.add_results(&out.records);
        let dataset = crate::dataset::SyntheticDataset::new(2, Shape::from_slice(&[1]), 3);

        post.finalize(&state, &dataset, dir.path())?;
        assert_eq!(state.snapshot().extra_metric, Some(1.0));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("accuracy.json"))?)?;
        assert_eq!(doc["mAP"], 1.0);
        assert_eq!(doc["detections"], 4);
        Ok(())
    }
}
