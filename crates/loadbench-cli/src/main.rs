mod cli;
mod config;
mod dataset;
mod driver;
mod harness;
mod postprocess;
mod registry;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, RunArgs};
use config::{BenchConfig, PROFILES};
use harness::Harness;
use loadbench_core::{LoadOptions, ModelArtifact};
use loadbench_runtime::BenchmarkReport;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Profiles => {
            list_profiles();
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    std::env::set_var("RUST_LOG", &args.log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = BenchConfig::from_args(&args)?;
    tracing::info!(?config, "configuration resolved");

    let entry = registry::lookup(&config.backend)?;
    let artifact = match &config.model {
        Some(path) => ModelArtifact::OnnxPath(path.clone()),
        None => ModelArtifact::Synthetic,
    };
    let opts = LoadOptions {
        device: config.device,
        inputs: config.inputs.clone(),
        outputs: config.outputs.clone(),
        intra_threads: None,
    };
    let loaded = (entry.build)(&artifact, &opts)
        .with_context(|| format!("failed to load model with backend {}", entry.key))?;
    tracing::info!(
        backend = loaded.backend,
        version = %loaded.version,
        model = loaded.model.name(),
        path = ?artifact.path(),
        "model loaded"
    );

    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    let mut report = BenchmarkReport::new(loaded.backend, loaded.version.clone(), cmdline);
    let output = config.output.clone();

    let harness = Harness::new(config, &loaded);
    harness.warmup()?;
    harness.run(&mut report)?;

    report.write(&output)?;
    tracing::info!(path = %output.display(), results = report.results.len(), "report written");
    Ok(())
}

fn list_profiles() {
    println!("profiles:");
    for p in PROFILES {
        println!(
            "  {:<28} backend={:<12} outputs={}",
            p.name,
            p.backend.unwrap_or("-"),
            p.outputs.unwrap_or("-")
        );
    }
    let keys: Vec<&str> = registry::backends().iter().map(|b| b.key).collect();
    println!("backends: {}", keys.join(", "));
}
