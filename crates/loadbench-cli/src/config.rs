use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use loadbench_core::{Device, IOName, ImageFormat, Shape};

use crate::cli::RunArgs;
use crate::postprocess::PostKind;

pub const SUPPORTED_DATASETS: &[&str] = &["synthetic"];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown scenario `{0}`; valid scenarios: SingleStream, MultiStream, Server, Offline")]
    UnknownScenario(String),
    #[error("unknown backend `{name}`; available: {available}")]
    UnknownBackend { name: String, available: String },
    #[error("unknown profile `{name}`; available: {available}")]
    UnknownProfile { name: String, available: String },
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
    #[error("invalid latency `{0}`: expected a positive number of seconds")]
    InvalidLatency(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scenario {
    SingleStream,
    MultiStream,
    Server,
    Offline,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::SingleStream,
        Scenario::MultiStream,
        Scenario::Server,
        Scenario::Offline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::SingleStream => "SingleStream",
            Scenario::MultiStream => "MultiStream",
            Scenario::Server => "Server",
            Scenario::Offline => "Offline",
        }
    }

    /// Single-stream runs inline on the issuing thread; the rest use the pool.
    pub fn is_pooled(self) -> bool {
        !matches!(self, Scenario::SingleStream)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.as_str() == s.trim())
            .ok_or_else(|| ConfigError::UnknownScenario(s.trim().to_string()))
    }
}

pub fn parse_scenarios(raw: &str) -> Result<Vec<Scenario>, ConfigError> {
    raw.split(',').map(str::parse).collect()
}

pub fn parse_latencies(raw: &str) -> Result<Vec<f64>, ConfigError> {
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| ConfigError::InvalidLatency(s.trim().to_string()))
        })
        .collect()
}

fn split_names(raw: &str) -> Vec<IOName> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(IOName::new)
        .collect()
}

fn parse_image_format(raw: &str) -> Result<ImageFormat, ConfigError> {
    match raw.to_ascii_uppercase().as_str() {
        "NHWC" => Ok(ImageFormat::Nhwc),
        "NCHW" => Ok(ImageFormat::Nchw),
        _ => Err(ConfigError::Invalid {
            field: "data format",
            reason: format!("`{raw}` is neither NHWC nor NCHW"),
        }),
    }
}

pub fn parse_device(raw: &str) -> Result<Device, ConfigError> {
    if raw.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }
    if let Some(rest) = raw.strip_prefix("cuda:") {
        let device_id = rest.parse().map_err(|_| ConfigError::Invalid {
            field: "device",
            reason: format!("invalid cuda device id `{rest}`"),
        })?;
        return Ok(Device::Cuda { device_id });
    }
    Err(ConfigError::Invalid {
        field: "device",
        reason: format!("unsupported device `{raw}` (expected cpu or cuda:N)"),
    })
}

fn parse_image_size(raw: &str) -> Result<[usize; 3], ConfigError> {
    let dims: Vec<usize> = raw
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::Invalid {
            field: "image size",
            reason: e.to_string(),
        })?;
    match dims[..] {
        [h, w, c] if h > 0 && w > 0 && c > 0 => Ok([h, w, c]),
        _ => Err(ConfigError::Invalid {
            field: "image size",
            reason: format!("expected three positive dims H,W,C, got `{raw}`"),
        }),
    }
}

pub const DEFAULT_LATENCY: &str = "0.100";
const LATENCY_RESNET50: &str = "0.015";
const LATENCY_MOBILENET: &str = "0.010";
const LATENCY_SSD_MOBILENET: &str = "0.010";
const LATENCY_SSD_RESNET34: &str = "0.100";

/// Partial settings a named profile contributes on top of the defaults.
#[derive(Clone, Copy, Debug)]
pub struct ProfileEntry {
    pub name: &'static str,
    pub inputs: Option<&'static str>,
    pub outputs: Option<&'static str>,
    pub dataset: Option<&'static str>,
    pub backend: Option<&'static str>,
    pub max_latency: Option<&'static str>,
    pub data_format: Option<&'static str>,
    pub max_batchsize: Option<usize>,
    pub postprocess: Option<&'static str>,
    pub label_offset: Option<i64>,
}

impl ProfileEntry {
    const fn named(name: &'static str) -> Self {
        Self {
            name,
            inputs: None,
            outputs: None,
            dataset: None,
            backend: None,
            max_latency: None,
            data_format: None,
            max_batchsize: None,
            postprocess: None,
            label_offset: None,
        }
    }
}

pub const DEFAULT_PROFILE: &str = "defaults";

pub const PROFILES: &[ProfileEntry] = &[
    ProfileEntry {
        inputs: Some("input"),
        outputs: Some("output"),
        dataset: Some("synthetic"),
        backend: Some("null"),
        postprocess: Some("argmax"),
        label_offset: Some(0),
        ..ProfileEntry::named(DEFAULT_PROFILE)
    },
    ProfileEntry {
        outputs: Some("ArgMax:0"),
        backend: Some("onnxruntime"),
        max_latency: Some(LATENCY_RESNET50),
        postprocess: Some("common"),
        label_offset: Some(-1),
        ..ProfileEntry::named("resnet50-onnxruntime")
    },
    ProfileEntry {
        outputs: Some("MobilenetV1/Predictions/Reshape_1:0"),
        backend: Some("onnxruntime"),
        max_latency: Some(LATENCY_MOBILENET),
        label_offset: Some(-1),
        ..ProfileEntry::named("mobilenet-onnxruntime")
    },
    ProfileEntry {
        outputs: Some("num_detections:0,detection_boxes:0,detection_scores:0,detection_classes:0"),
        backend: Some("onnxruntime"),
        data_format: Some("NHWC"),
        max_latency: Some(LATENCY_SSD_MOBILENET),
        postprocess: Some("coco"),
        ..ProfileEntry::named("ssd-mobilenet-onnxruntime")
    },
    ProfileEntry {
        inputs: Some("image"),
        outputs: Some("bboxes,labels,scores"),
        backend: Some("onnxruntime"),
        data_format: Some("NCHW"),
        max_batchsize: Some(1),
        max_latency: Some(LATENCY_SSD_RESNET34),
        postprocess: Some("coco-onnx"),
        ..ProfileEntry::named("ssd-resnet34-onnxruntime")
    },
    ProfileEntry {
        backend: Some("null"),
        ..ProfileEntry::named("null")
    },
];

/// Fully resolved profile: defaults overlaid with one named profile.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub name: String,
    pub inputs: Vec<IOName>,
    pub outputs: Vec<IOName>,
    pub dataset: String,
    pub backend: String,
    pub max_latency: String,
    pub data_format: Option<ImageFormat>,
    pub max_batchsize: Option<usize>,
    pub postprocess: String,
    pub label_offset: i64,
}

impl Profile {
    fn overlay(&mut self, entry: &ProfileEntry) -> Result<(), ConfigError> {
        self.name = entry.name.to_string();
        if let Some(v) = entry.inputs {
            self.inputs = split_names(v);
        }
        if let Some(v) = entry.outputs {
            self.outputs = split_names(v);
        }
        if let Some(v) = entry.dataset {
            self.dataset = v.to_string();
        }
        if let Some(v) = entry.backend {
            self.backend = v.to_string();
        }
        if let Some(v) = entry.max_latency {
            self.max_latency = v.to_string();
        }
        if let Some(v) = entry.data_format {
            self.data_format = Some(parse_image_format(v)?);
        }
        if let Some(v) = entry.max_batchsize {
            self.max_batchsize = Some(v);
        }
        if let Some(v) = entry.postprocess {
            self.postprocess = v.to_string();
        }
        if let Some(v) = entry.label_offset {
            self.label_offset = v;
        }
        Ok(())
    }
}

fn find_profile(name: &str) -> Result<&'static ProfileEntry, ConfigError> {
    PROFILES
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ConfigError::UnknownProfile {
            name: name.to_string(),
            available: PROFILES.iter().map(|p| p.name).collect::<Vec<_>>().join(", "),
        })
}

/// Resolve a profile. Every call starts from a fresh copy of the defaults,
/// so keys of one profile never leak into the next lookup.
pub fn resolve_profile(name: Option<&str>) -> Result<Profile, ConfigError> {
    let mut profile = Profile {
        name: String::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        dataset: String::new(),
        backend: String::new(),
        max_latency: DEFAULT_LATENCY.to_string(),
        data_format: None,
        max_batchsize: None,
        postprocess: String::new(),
        label_offset: 0,
    };
    profile.overlay(find_profile(DEFAULT_PROFILE)?)?;
    if let Some(name) = name.filter(|n| *n != DEFAULT_PROFILE) {
        profile.overlay(find_profile(name)?)?;
    }
    Ok(profile)
}

/// Everything a benchmark invocation needs, after profile and flags are merged.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub profile: String,
    pub model: Option<PathBuf>,
    pub backend: String,
    pub dataset: String,
    pub postprocess: PostKind,
    pub label_offset: i64,
    pub inputs: Vec<IOName>,
    pub outputs: Vec<IOName>,
    pub data_format: Option<ImageFormat>,
    pub image_size: [usize; 3],
    pub classes: usize,
    pub count: Option<usize>,
    pub scenarios: Vec<Scenario>,
    pub max_latencies: Vec<f64>,
    pub max_batchsize: usize,
    pub threads: usize,
    pub queries_single: usize,
    pub queries_multi: usize,
    pub queries_offline: usize,
    pub samples_per_query: usize,
    pub accuracy: bool,
    pub output: PathBuf,
    pub output_dir: PathBuf,
    pub device: Device,
}

pub const DEFAULT_MAX_BATCHSIZE: usize = 128;

impl BenchConfig {
    pub fn from_args(args: &RunArgs) -> Result<Self, ConfigError> {
        let profile = resolve_profile(args.profile.as_deref())?;

        let scenarios = parse_scenarios(&args.scenario)?;
        let max_latencies =
            parse_latencies(args.max_latency.as_deref().unwrap_or(&profile.max_latency))?;
        let data_format = match &args.data_format {
            Some(raw) => Some(parse_image_format(raw)?),
            None => profile.data_format,
        };

        let max_batchsize = args
            .max_batchsize
            .or(profile.max_batchsize)
            .unwrap_or(DEFAULT_MAX_BATCHSIZE);
        positive("max batch size", max_batchsize)?;

        let threads = args.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        positive("threads", threads)?;
        positive("classes", args.classes)?;
        positive("samples per query", args.samples_per_query)?;
        if let Some(count) = args.count {
            positive("count", count)?;
        }
        let dataset = args.dataset.clone().unwrap_or_else(|| profile.dataset.clone());
        if !SUPPORTED_DATASETS.contains(&dataset.as_str()) {
            return Err(ConfigError::UnknownDataset(dataset));
        }

        Ok(Self {
            model: args.model.clone(),
            backend: args.backend.clone().unwrap_or(profile.backend),
            dataset,
            postprocess: args
                .postprocess
                .as_deref()
                .unwrap_or(&profile.postprocess)
                .parse()?,
            label_offset: args.label_offset.unwrap_or(profile.label_offset),
            inputs: args.inputs.as_deref().map(split_names).unwrap_or(profile.inputs),
            outputs: args.outputs.as_deref().map(split_names).unwrap_or(profile.outputs),
            profile: profile.name,
            data_format,
            image_size: parse_image_size(&args.image_size)?,
            classes: args.classes,
            count: args.count,
            scenarios,
            max_latencies,
            max_batchsize,
            threads,
            queries_single: args.queries_single,
            queries_multi: args.queries_multi,
            queries_offline: args.queries_offline,
            samples_per_query: args.samples_per_query,
            accuracy: args.accuracy,
            output: args.output.clone(),
            output_dir: args.output_dir.clone(),
            device: parse_device(&args.device)?,
        })
    }

    /// Per-sample input shape in the layout the backend prefers.
    pub fn sample_shape(&self, preferred: ImageFormat) -> Shape {
        let [h, w, c] = self.image_size;
        match self.data_format.unwrap_or(preferred) {
            ImageFormat::Nhwc => Shape::from_slice(&[h, w, c]),
            ImageFormat::Nchw => Shape::from_slice(&[c, h, w]),
        }
    }
}

fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["loadbench", "run"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            Command::Profiles => unreachable!(),
        }
    }

    #[test]
    fn scenarios_parse_in_order() {
        assert_eq!(
            parse_scenarios("Offline,SingleStream").unwrap(),
            vec![Scenario::Offline, Scenario::SingleStream]
        );
    }

    #[test]
    fn unknown_scenario_is_fatal() {
        assert_eq!(
            parse_scenarios("SingleStream,Burst"),
            Err(ConfigError::UnknownScenario("Burst".into()))
        );
    }

    #[test]
    fn latencies_must_be_positive_numbers() {
        assert_eq!(parse_latencies("0.1, 0.25").unwrap(), vec![0.1, 0.25]);
        assert!(matches!(
            parse_latencies("0.1,abc"),
            Err(ConfigError::InvalidLatency(s)) if s == "abc"
        ));
        assert!(parse_latencies("0").is_err());
        assert!(parse_latencies("").is_err());
    }

    #[test]
    fn profile_overlays_defaults() {
        let p = resolve_profile(Some("resnet50-onnxruntime")).unwrap();
        assert_eq!(p.backend, "onnxruntime");
        assert_eq!(p.outputs, vec![IOName::new("ArgMax:0")]);
        // not set by the profile, so the default survives
        assert_eq!(p.inputs, vec![IOName::new("input")]);
        assert_eq!(p.dataset, "synthetic");
        assert_eq!(p.max_latency, "0.015");
        assert_eq!(p.postprocess, "common");
        assert_eq!(p.label_offset, -1);
    }

    #[test]
    fn repeated_lookups_do_not_leak_keys() {
        let first = resolve_profile(Some("ssd-resnet34-onnxruntime")).unwrap();
        assert_eq!(first.max_batchsize, Some(1));
        let second = resolve_profile(Some("mobilenet-onnxruntime")).unwrap();
        assert_eq!(second.max_batchsize, None);
        assert_eq!(second.data_format, None);
        assert_eq!(second.inputs, vec![IOName::new("input")]);
        assert_eq!(resolve_profile(None).unwrap(), resolve_profile(Some("defaults")).unwrap());
    }

    #[test]
    fn detection_profiles_use_detection_scoring() {
        for (name, kind) in [
            ("ssd-mobilenet-onnxruntime", PostKind::Detection { classes: 3, scores: 2 }),
            ("ssd-resnet34-onnxruntime", PostKind::Detection { classes: 1, scores: 2 }),
        ] {
            let cfg = BenchConfig::from_args(&run_args(&["--profile", name])).unwrap();
            assert_eq!(cfg.postprocess, kind, "{name}");
        }
    }

    #[test]
    fn unknown_profile_is_fatal() {
        assert!(matches!(
            resolve_profile(Some("vgg-tf")),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn flags_override_profile() {
        let args = run_args(&[
            "--profile",
            "ssd-resnet34-onnxruntime",
            "--backend",
            "null",
            "--max-batchsize",
            "8",
            "--outputs",
            "a, b",
            "--scenario",
            "Server,Offline",
            "--max-latency",
            "0.05,0.1",
            "--threads",
            "2",
        ]);
        let cfg = BenchConfig::from_args(&args).unwrap();
        assert_eq!(cfg.backend, "null");
        assert_eq!(cfg.max_batchsize, 8);
        assert_eq!(cfg.outputs, vec![IOName::new("a"), IOName::new("b")]);
        assert_eq!(cfg.inputs, vec![IOName::new("image")]);
        assert_eq!(cfg.scenarios, vec![Scenario::Server, Scenario::Offline]);
        assert_eq!(cfg.max_latencies, vec![0.05, 0.1]);
        assert_eq!(cfg.sample_shape(ImageFormat::Nhwc), Shape::from_slice(&[3, 224, 224]));
    }

    #[test]
    fn unknown_dataset_and_postprocessor_are_fatal() {
        let args = run_args(&["--dataset", "imagenet"]);
        assert_eq!(
            BenchConfig::from_args(&args).err(),
            Some(ConfigError::UnknownDataset("imagenet".into()))
        );
        let args = run_args(&["--postprocess", "softmax"]);
        assert!(matches!(
            BenchConfig::from_args(&args),
            Err(ConfigError::Invalid { field: "post-processor", .. })
        ));
        let args = run_args(&["--postprocess", "common", "--label-offset", "-1"]);
        let cfg = BenchConfig::from_args(&args).unwrap();
        assert_eq!(cfg.postprocess, PostKind::Common);
        assert_eq!(cfg.label_offset, -1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let args = run_args(&["--max-batchsize", "0"]);
        assert!(matches!(
            BenchConfig::from_args(&args),
            Err(ConfigError::Invalid { field: "max batch size", .. })
        ));
    }

    #[test]
    fn devices_parse() {
        assert_eq!(parse_device("CPU").unwrap(), Device::Cpu);
        assert_eq!(parse_device("cuda:1").unwrap(), Device::Cuda { device_id: 1 });
        assert!(parse_device("tpu").is_err());
    }
}
