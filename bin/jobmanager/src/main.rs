//! JobManager - Live reconfiguration control plane for Gearshift.
//!
//! Deploys a keyed word-count job on in-process workers and drives one
//! reconfiguration scenario against it while words keep flowing:
//! - rebalancing key groups between tasks
//! - scaling out and in with keyed state moved to the new owners
//! - swapping the word-count function
//! - tuning a control attribute of the running function
//!
//! ```bash
//! RUST_LOG=gearshift_coordinator=debug gearshift-jobmanager --scenario loop --iterations 4
//! ```

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use gearshift_coordinator::CoordinatorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod controller;
mod job;

use controller::Controller;
use job::{ClusterSettings, DemoCluster};

const CORPUS: &[&str] = &[
    "gear", "chain", "pedal", "saddle", "spoke", "rim", "brake", "crank", "derailleur",
    "cassette", "hub", "tire", "valve", "fork", "stem", "bar", "cleat", "sprocket",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Move key groups between tasks at the same parallelism.
    Rebalance,
    /// Add one word-count task.
    ScaleOut,
    /// Remove one word-count task.
    ScaleIn,
    /// Swap the word-count function.
    UpdateFunction,
    /// Change the `min_count` control attribute.
    UpdateAttribute,
    /// Alternate scale-out and scale-in.
    Loop,
    /// Every scenario above, in order.
    All,
}

/// Gearshift JobManager - drives live reconfiguration of a running job.
#[derive(Debug, Parser)]
#[command(name = "gearshift-jobmanager")]
struct Args {
    /// Number of in-process workers.
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Task slots per worker.
    #[arg(long, default_value = "8")]
    slots: usize,

    /// Initial word-count parallelism.
    #[arg(long, default_value = "2")]
    parallelism: usize,

    /// Number of key groups of the word-count state.
    #[arg(long, default_value = "128")]
    key_groups: u32,

    /// Reconfiguration to run.
    #[arg(long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Rounds of the scaling loop.
    #[arg(long, default_value = "3")]
    iterations: usize,

    /// Rescale-point acknowledgement timeout; 0 waits forever.
    #[arg(long)]
    sync_timeout_ms: Option<u64>,

    /// Periodic checkpoint interval.
    #[arg(long)]
    checkpoint_interval_ms: Option<u64>,

    /// Coordinator configuration (JSON); flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::from_json_file(path)?,
            None => CoordinatorConfig::default(),
        };
        if let Some(ms) = self.sync_timeout_ms {
            config = config.with_sync_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if let Some(ms) = self.checkpoint_interval_ms {
            config.checkpoint = config.checkpoint.with_interval(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

async fn run_scenario(scenario: Scenario, controller: &mut Controller, cluster: &DemoCluster, iterations: usize) -> Result<()> {
    let parallelism = cluster.parallelism()?;
    match scenario {
        Scenario::Rebalance => controller.rebalance().await,
        Scenario::ScaleOut => controller.scale_to(parallelism + 1).await,
        Scenario::ScaleIn => {
            if parallelism < 2 {
                bail!("cannot scale in below one task");
            }
            controller.scale_to(parallelism - 1).await
        }
        Scenario::UpdateFunction => controller.update_function().await,
        Scenario::UpdateAttribute => controller.update_min_count(cluster.min_count() + 1).await,
        Scenario::Loop => controller.scaling_loop(iterations, CORPUS).await,
        Scenario::All => {
            controller.rebalance().await?;
            controller.scale_to(parallelism + 1).await?;
            controller.scale_to(parallelism).await?;
            controller.update_function().await?;
            controller.update_min_count(cluster.min_count() + 1).await?;
            controller.scaling_loop(iterations, CORPUS).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.coordinator_config()?;
    info!(?config, "Starting JobManager");

    let settings = ClusterSettings {
        workers: args.workers,
        slots: args.slots,
        parallelism: args.parallelism,
        key_groups: args.key_groups,
    };
    let cluster = Arc::new(DemoCluster::start(&settings, config).await?);
    let consumed = cluster.feed(CORPUS.iter().copied())?;
    info!(consumed, "Initial words counted");

    let mut controller = Controller::new(cluster.clone());
    run_scenario(args.scenario, &mut controller, &cluster, args.iterations).await?;

    let consumed = cluster.feed(CORPUS.iter().copied())?;
    info!(consumed, running = cluster.graph.is_running(), "Words counted after reconfiguration");
    cluster.report()?;
    Ok(())
}
