use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use sockscope::{SockScopeEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Settings file (YAML); environment variables override it
    #[clap(short, long, env = "SOCKSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Print events as JSON lines instead of log records
    #[clap(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;
    if opt.json {
        settings.output.json = Some(true);
    }

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    // build.rs compiles sockscope-ebpf and drops the object in OUT_DIR
    let engine = SockScopeEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/sockscope")),
    )?;
    engine.run().await?;

    telemetry::shutdown_metrics();
    Ok(())
}
