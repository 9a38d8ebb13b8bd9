//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "binary"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Binary entrypoint for the Entitle daemon."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use entitle_common::config::AppConfig;
use entitle_common::logging::{init_cli_tracing, init_tracing};
use entitle_core::{EntitlementManager, InitOptions, InitOutcome};
use entitle_licensing::EntitlementKind;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Entitle ", env!("CARGO_PKG_VERSION")),
    about = "Entitle license daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the license manager until interrupted")]
    Run,
    #[command(about = "Print the stored license as JSON")]
    Info,
    #[command(about = "Activate a license with an activation key")]
    Activate {
        #[arg(value_name = "KEY")]
        key: String,
    },
    #[command(about = "Renew the current license now")]
    Renew,
    #[command(about = "List every known feature and quota with its current value")]
    Features,
    #[command(about = "Print license metrics in the Prometheus text format")]
    Metrics,
}

#[derive(Debug, Serialize)]
struct FeatureRow<'a> {
    key: &'a str,
    kind: &'static str,
    value: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/entitle.toml"));
    candidates.push(PathBuf::from("/etc/entitle/entitle.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("entitled", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await?
        }
        Commands::Info => {
            init_cli_tracing();
            let manager = cli_manager(config, false).await?;
            println!("{}", serde_json::to_string_pretty(&manager.info())?);
            manager.shutdown().await;
        }
        Commands::Activate { key } => {
            init_cli_tracing();
            let manager = cli_manager(config, true).await?;
            let outcome = manager
                .activate(&key)
                .await
                .context("license activation failed")?;
            println!("activation: {outcome:?} (plan {})", manager.plan_name());
            manager.shutdown().await;
        }
        Commands::Renew => {
            init_cli_tracing();
            let manager = cli_manager(config, true).await?;
            let outcome = manager.renew().await.context("license renewal failed")?;
            println!("renewal: {outcome:?}");
            manager.shutdown().await;
        }
        Commands::Features => {
            init_cli_tracing();
            let manager = cli_manager(config, false).await?;
            let snapshot = manager.snapshot();
            let rows: Vec<FeatureRow<'_>> = manager
                .catalog()
                .iter()
                .map(|(key, kind)| match kind {
                    EntitlementKind::Flag => FeatureRow {
                        key,
                        kind: "flag",
                        value: snapshot.flag(key).into(),
                    },
                    EntitlementKind::Quota { .. } => FeatureRow {
                        key,
                        kind: "quota",
                        value: snapshot.quota(key).as_i64().into(),
                    },
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            manager.shutdown().await;
        }
        Commands::Metrics => {
            init_cli_tracing();
            let manager = cli_manager(config, false).await?;
            let mut buffer = Vec::new();
            TextEncoder::new()
                .encode(&prometheus::gather(), &mut buffer)
                .context("failed to encode metrics")?;
            print!("{}", String::from_utf8(buffer)?);
            manager.shutdown().await;
        }
    }

    Ok(())
}

/// Manager for one-shot commands. `online` commands reach the license server;
/// the others only read the stored certificate.
async fn cli_manager(config: AppConfig, online: bool) -> Result<Arc<EntitlementManager>> {
    let mut config = config;
    config.license.activation_key = None;
    let manager = EntitlementManager::builder(config)
        .with_metrics_registry(prometheus::default_registry().clone())
        .build()?;
    manager
        .initialize(InitOptions {
            force_recreate: false,
            is_primary_process: online,
            is_cli: true,
        })
        .await;
    Ok(manager)
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let is_primary_process = config.is_primary_process();
    let manager = EntitlementManager::builder(config)
        .with_metrics_registry(prometheus::default_registry().clone())
        .build()?;
    match manager
        .initialize(InitOptions {
            force_recreate: false,
            is_primary_process,
            is_cli: false,
        })
        .await
    {
        InitOutcome::Initialized => {}
        other => warn!(outcome = ?other, "license manager did not start cleanly"),
    }
    info!(
        plan = %manager.plan_name(),
        role = %manager.role(),
        "daemon running; waiting for termination signal"
    );

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    manager.shutdown().await;
    Ok(())
}
