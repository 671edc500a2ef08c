//! Edge Sync Agent - Standalone Binary
//!
//! Re-converges a domain topology on a fixed interval (or once, for CronJob
//! mode) so drift in the account is corrected without operator action.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use edge_engine::edge::aws::{AwsCloud, AwsSettings};
use edge_engine::edge::memory::InMemoryCloud;
use edge_engine::edge::{ComponentStatus, ConvergenceEngine, DomainTopology, EngineConfig};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Aws,
    Simulated,
}

/// Edge Sync Agent - keeps a static site topology converged
#[derive(Parser, Debug)]
#[command(name = "edge-sync-agent", version, about)]
struct Args {
    /// Topology file (JSON)
    #[arg(long, env = "EDGE_TOPOLOGY")]
    topology: PathBuf,

    /// Account the agent converges
    #[arg(long, value_enum, env = "EDGE_BACKEND", default_value = "simulated")]
    backend: Backend,

    /// Region of the origin store (AWS backend)
    #[arg(long, env = "EDGE_AWS_REGION")]
    aws_region: Option<String>,

    /// Endpoint override for every AWS client
    #[arg(long, env = "EDGE_AWS_ENDPOINT")]
    aws_endpoint: Option<String>,

    /// Simulated account state file
    #[arg(long, env = "EDGE_STATE_FILE", default_value = "edge-account.json")]
    state_file: PathBuf,

    /// Engine config overrides (JSON)
    #[arg(long, env = "EDGE_CONFIG")]
    engine_config: Option<PathBuf>,

    /// Sync interval in seconds
    #[arg(long, default_value = "300", env = "SYNC_INTERVAL")]
    interval: u64,

    /// Run once and exit (for CronJob mode)
    #[arg(long, default_value = "false")]
    once: bool,

    /// Dry run - converge against a copy of the simulated account and discard it
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();

    info!(
        topology = ?args.topology,
        backend = ?args.backend,
        state_file = ?args.state_file,
        interval = args.interval,
        dry_run = args.dry_run,
        "Starting Edge Sync Agent"
    );

    let config = match &args.engine_config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let aws = match args.backend {
        Backend::Aws => {
            if args.dry_run {
                anyhow::bail!("--dry-run requires the simulated backend");
            }
            let settings = AwsSettings {
                region: args.aws_region.clone(),
                endpoint: args.aws_endpoint.clone(),
            };
            Some(Arc::new(AwsCloud::connect(settings).await?))
        }
        Backend::Simulated => None,
    };

    if args.once {
        let success = run_sync(&args, &config, aws.as_ref()).await?;
        if !success {
            anyhow::bail!("convergence run failed");
        }
    } else {
        let mut ticker = interval(Duration::from_secs(args.interval));

        loop {
            ticker.tick().await;

            if let Err(e) = run_sync(&args, &config, aws.as_ref()).await {
                error!(error = %e, "Sync cycle failed");
            }
        }
    }

    Ok(())
}

/// Run a single sync cycle, returning whether the run converged
async fn run_sync(args: &Args, config: &EngineConfig, aws: Option<&Arc<AwsCloud>>) -> Result<bool> {
    info!("Starting edge sync cycle");

    // Re-read every cycle so topology edits are picked up
    let topology = DomainTopology::from_file(&args.topology)?;

    let report = match aws {
        Some(cloud) => {
            ConvergenceEngine::new(cloud.clone(), config.clone())
                .converge(&topology)
                .await
        }
        None => {
            let cloud = InMemoryCloud::load(&args.state_file)?;
            let cloud = if args.dry_run {
                info!("DRY RUN - changes will not be persisted");
                Arc::new(cloud.fork())
            } else {
                Arc::new(cloud)
            };

            let report = ConvergenceEngine::new(cloud.clone(), config.clone())
                .converge(&topology)
                .await;
            if !args.dry_run {
                cloud
                    .save(&args.state_file)
                    .context("Failed to persist account state")?;
            }
            report
        }
    };

    for component in &report.components {
        match component.status {
            ComponentStatus::Converged => {}
            ComponentStatus::Failed => error!(
                component = %component.component,
                detail = component.detail.as_deref().unwrap_or(""),
                "Component failed"
            ),
            ComponentStatus::Skipped => warn!(component = %component.component, "Component skipped"),
        }
    }

    let tally = report.tally();
    info!(
        domain = %report.domain,
        success = report.success,
        created = tally.created,
        updated = tally.updated,
        unchanged = tally.unchanged,
        deleted = tally.deleted,
        "Edge sync cycle complete"
    );

    Ok(report.success)
}
