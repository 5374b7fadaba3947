use std::fs;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kubeload::client::{build_clients, ClientPoolConfig};
use kubeload::config::{ContentType, LoadProfile};
use kubeload::report::RunnerMetricReport;
use kubeload::scheduler::schedule;

/// Benchmark a Kubernetes API server with a weighted request mixture.
#[derive(Parser, Debug)]
#[command(name = "kubeload", version, about)]
struct Cli {
    /// Path to the kubeconfig file.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Path to the load profile configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Total number of connections; overrides the config value.
    #[arg(long)]
    conns: Option<usize>,

    /// Total number of concurrent workers; overrides the config value.
    #[arg(long)]
    client: Option<usize>,

    /// Content type (json or protobuf); overrides the config value.
    #[arg(long)]
    content_type: Option<String>,

    /// Maximum requests per second, zero means unlimited; overrides the
    /// config value.
    #[arg(long)]
    rate: Option<f64>,

    /// Total number of requests; overrides the config value.
    #[arg(long)]
    total: Option<usize>,

    /// User agent sent with every request.
    #[arg(long)]
    user_agent: Option<String>,

    /// Path of the file the report is written to; defaults to stdout.
    #[arg(long)]
    result: Option<PathBuf>,

    /// Include raw latencies and the full error list in the report.
    #[arg(long)]
    raw_data: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut profile = LoadProfile::from_file(&cli.config)?;
    apply_overrides(&mut profile, &cli)?;
    profile.validate()?;

    let conns = build_clients(&ClientPoolConfig {
        kubeconfig: cli.kubeconfig.clone(),
        conns: profile.spec.conns,
        content_type: profile.spec.content_type,
        disable_http2: profile.spec.disable_http2,
        user_agent: cli.user_agent.clone(),
    })?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight requests");
            let _ = cancel_tx.send(true);
        }
    });

    let result = schedule(&profile.spec, conns, cancel_rx).await?;
    info!(
        total = result.total,
        duration = ?result.duration,
        received_bytes = result.stats.total_received_bytes,
        errors = result.stats.errors.len(),
        "benchmark finished"
    );

    let report =
        RunnerMetricReport::from_stats(&result.stats, result.duration, result.total, cli.raw_data);
    write_report(&report, cli.result.as_deref())?;

    Ok(())
}

fn apply_overrides(
    profile: &mut LoadProfile,
    cli: &Cli,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(rate) = cli.rate {
        profile.spec.rate = rate;
    }
    if let Some(conns) = cli.conns {
        profile.spec.conns = conns;
    }
    if let Some(client) = cli.client {
        profile.spec.client = client;
    }
    if let Some(total) = cli.total {
        profile.spec.total = total;
    }
    if let Some(content_type) = &cli.content_type {
        profile.spec.content_type = content_type.parse::<ContentType>()?;
    }
    Ok(())
}

fn write_report(
    report: &RunnerMetricReport,
    path: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string_pretty(report)?;
    match path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() && !dir.exists() {
                    fs::create_dir_all(dir)?;
                }
            }
            fs::write(path, json + "\n")?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{}", json),
    }
    Ok(())
}
