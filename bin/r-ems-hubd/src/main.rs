//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the hub daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_ems_common::config::HubConfig;
use r_ems_common::logging::init_tracing;
use r_ems_core::Manager;
use r_ems_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, ExportState, MetricsStore, SharedRegistry,
};
use r_ems_net::builtin_catalog;
use r_ems_persistence::{
    JsonFilePersister, PersistenceBridge, PersistenceWriter, DEFAULT_QUEUE_DEPTH,
};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/hub.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "R-EMS adapter hub daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the node manager until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "List the plugin modules compiled into this binary")]
    Plugins,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Plugins = command {
        print_plugins();
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let load_started = Instant::now();
    let loaded = HubConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    if let Commands::CheckConfig = command {
        println!(
            "{}: ok ({} declared nodes, {} subscriptions)",
            loaded.source.display(),
            config.nodes.len(),
            config.subscriptions.len()
        );
        return Ok(());
    }

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();

    init_tracing("r-ems-hubd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        nodes = config.nodes.len(),
        "configuration loaded"
    );

    run_daemon(config, metrics_registry).await
}

async fn run_daemon(config: HubConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let (bridge, writer) = open_persistence(&config)?;
    let store = Arc::new(MetricsStore::new());

    let handle = Manager::new(config, builtin_catalog(), Arc::clone(&store), bridge)
        .start()
        .await?;

    let metrics_server = if metrics_settings.enabled {
        let state = ExportState {
            store,
            bus: Some(handle.bus_counters()),
            registry,
        };
        match spawn_http_server(state, metrics_settings.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "metrics exporter listening");
                Some(server)
            }
            Err(err) => {
                warn!(error = %err, "failed to start metrics exporter");
                None
            }
        }
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    info!("hub running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(writer) = writer {
        tokio::task::spawn_blocking(move || writer.join())
            .await
            .context("persistence writer panicked")?;
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn open_persistence(config: &HubConfig) -> Result<(PersistenceBridge, Option<PersistenceWriter>)> {
    if !config.persistence.enabled {
        info!("persistence disabled by configuration");
        return Ok((PersistenceBridge::disabled(), None));
    }
    let directory = &config.persistence.directory;
    let persister = JsonFilePersister::new(directory.clone()).with_context(|| {
        format!("unable to open persistence directory {}", directory.display())
    })?;
    let (bridge, writer) = PersistenceBridge::spawn(Arc::new(persister), DEFAULT_QUEUE_DEPTH)
        .context("failed to start persistence writer")?;
    info!(directory = %directory.display(), "persistence enabled");
    Ok((bridge, Some(writer)))
}

fn print_plugins() {
    for module in builtin_catalog().iter() {
        let mut flags = Vec::new();
        if module.single {
            flags.push("single");
        }
        if module.system {
            flags.push("system");
        }
        println!(
            "{:<16} {:<7} {:<14} {}",
            module.name,
            module.kind.as_str(),
            flags.join(","),
            module.description
        );
    }
}
