use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "loadbench", version, about = "MLPerf-style inference benchmark harness")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one or more scenarios against a model and write the report
    Run(RunArgs),
    /// List built-in profiles and available backends
    Profiles,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Model file handed to the backend
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Standard profile supplying defaults for backend, dataset and IO names
    #[arg(long)]
    pub profile: Option<String>,

    /// Comma separated scenarios: SingleStream, MultiStream, Server, Offline
    #[arg(long, default_value = "SingleStream")]
    pub scenario: String,

    /// Backend key (see `loadbench profiles`)
    #[arg(long)]
    pub backend: Option<String>,

    /// Dataset kind
    #[arg(long)]
    pub dataset: Option<String>,

    /// Post-processor: argmax or common
    #[arg(long)]
    pub postprocess: Option<String>,

    /// Added to every predicted class before it is compared with the label
    #[arg(long, allow_hyphen_values = true)]
    pub label_offset: Option<i64>,

    /// Comma separated model input names
    #[arg(long)]
    pub inputs: Option<String>,

    /// Comma separated model output names
    #[arg(long)]
    pub outputs: Option<String>,

    /// Image layout override (NHWC or NCHW)
    #[arg(long)]
    pub data_format: Option<String>,

    /// Per-sample image size as H,W,C
    #[arg(long, default_value = "224,224,3")]
    pub image_size: String,

    /// Number of classes the synthetic labels cycle through
    #[arg(long, default_value_t = 1000)]
    pub classes: usize,

    /// Dataset items to use
    #[arg(long)]
    pub count: Option<usize>,

    /// Max batch size in a single inference
    #[arg(long)]
    pub max_batchsize: Option<usize>,

    /// Worker threads for pooled scenarios
    #[arg(long)]
    pub threads: Option<usize>,

    /// Comma separated target latencies in seconds (server scenario)
    #[arg(long)]
    pub max_latency: Option<String>,

    /// Queries issued for SingleStream
    #[arg(long, default_value_t = 1024)]
    pub queries_single: usize,

    /// Queries issued for MultiStream and Server
    #[arg(long, default_value_t = 24576)]
    pub queries_multi: usize,

    /// Queries issued for Offline
    #[arg(long, default_value_t = 24576)]
    pub queries_offline: usize,

    /// Samples per MultiStream query
    #[arg(long, default_value_t = 4)]
    pub samples_per_query: usize,

    /// Score every dataset item once instead of timing
    #[arg(long)]
    pub accuracy: bool,

    /// Report path
    #[arg(long, default_value = "output.json")]
    pub output: PathBuf,

    /// Directory for accuracy artifacts
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Device for inference (cpu or cuda:N)
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Log level (RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log: String,
}
