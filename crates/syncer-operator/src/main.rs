//! Tenant syncer - projects tenant objects onto the super control plane

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use syncer_common::kube_utils::create_client;
use syncer_common::telemetry::{init_telemetry, TelemetryConfig};
use syncer_operator::{build_engine, select_resources, SyncerConfig};
use syncer_resources::{builtin_resources, ResourceKind, SyncerContext};

/// Syncer - downward sync from tenant control planes to the super control plane
#[derive(Parser, Debug)]
#[command(name = "syncer", version, about, long_about = None)]
struct Cli {
    /// Path to the syncer config file
    #[arg(long, env = "SYNCER_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig of the super control plane (overrides superKubeconfig)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Seconds between patrol passes (overrides patrolPeriodSecs)
    #[arg(long)]
    patrol_period_secs: Option<u64>,

    /// Concurrent reconciles per tenant controller (overrides concurrency)
    #[arg(long)]
    concurrency: Option<u16>,

    /// Comma-separated resource kinds to sync (overrides resources)
    #[arg(long, value_delimiter = ',')]
    resources: Option<Vec<ResourceKind>>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the syncer (default mode)
    Run,
    /// Print the effective configuration as YAML and exit
    PrintConfig,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SyncerConfig> {
        let mut config = match &self.config {
            Some(path) => SyncerConfig::load(path)?,
            None => SyncerConfig::default(),
        };
        if let Some(path) = &self.kubeconfig {
            config.super_kubeconfig = Some(path.clone());
        }
        if let Some(secs) = self.patrol_period_secs {
            config.patrol_period_secs = secs;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(resources) = &self.resources {
            config.resources = resources.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any kube client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The syncer cannot reach any API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Some(Commands::PrintConfig) => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{yaml}");
            Ok(())
        }
        Some(Commands::Run) | None => run(config).await,
    }
}

async fn run(config: SyncerConfig) -> anyhow::Result<()> {
    let kinds = config.resources.iter().map(ToString::to_string).collect();
    init_telemetry(&TelemetryConfig::from_env(kinds, config.tenants.len()))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let super_client = create_client(config.super_kubeconfig.as_deref()).await?;

    let mut tenants = BTreeMap::new();
    for tenant in &config.tenants {
        let client = create_client(Some(&tenant.kubeconfig)).await?;
        let key = tenant.cluster_key();
        tracing::info!(tenant = %tenant.name, cluster = %key, "registered tenant cluster");
        tenants.insert(key, client);
    }

    let cancel = CancellationToken::new();
    let ctx = SyncerContext {
        super_client,
        tenants: Arc::new(tenants),
        list_timeout: config.list_timeout(),
        controller: config.controller_options(),
        cancel: cancel.clone(),
    };

    let registrations = select_resources(&builtin_resources(), &config.resources)?;
    tracing::info!(tenants = config.tenants.len(), "Starting syncer");
    let handles: Vec<_> = build_engine(&ctx, &registrations, &config.patrol_options())
        .into_iter()
        .map(tokio::spawn)
        .collect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, shutting down...");
    cancel.cancel();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "syncer task failed");
        }
    }
    tracing::info!("Syncer stopped");
    Ok(())
}
