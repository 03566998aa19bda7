//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the R-EMS channel manager daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_ems_channels::{
    ChannelConfiguration, ChannelEventListener, ChannelLocator, ChannelManager, EventType,
    RoleBasedAccess, SampledValueContainer, SamplingMode, SchedulerSettings,
};
use r_ems_common::config::AppConfig;
use r_ems_common::logging::init_tracing;
use r_ems_drivers::{Iec104Driver, ModbusDriver};
use r_ems_metrics::{new_registry, spawn_http_server, ChannelMetrics, DaemonMetrics};
use r_ems_security::rbac::RbacEngine;
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-EMS channel manager ", env!("CARGO_PKG_VERSION")),
    about = "R-EMS field channel manager daemon",
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
    #[command(about = "Configure channels and sample them until interrupted")]
    Run,
    #[command(about = "Validate the configuration and print the resulting channels")]
    CheckConfig,
}

/// Logs every changed value of the configured channels.
struct ChangeLogger;

impl ChannelEventListener for ChangeLogger {
    fn channel_event(&self, event: EventType, samples: &[SampledValueContainer]) {
        for container in samples {
            let value = container
                .sample
                .value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_owned());
            debug!(
                event = event.as_str(),
                channel = %container.locator,
                %value,
                quality = ?container.sample.quality,
                "channel value"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/channels.toml"));
    candidates.push(PathBuf::from("configs/channels.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let configurations = channel_configurations(&config)?;
            println!(
                "{}: {} channel(s)",
                loaded.source.display(),
                configurations.len()
            );
            for (name, configuration) in configurations {
                let mode = match configuration.sampling_mode() {
                    SamplingMode::Periodic(period) => format!("every {} ms", period.as_millis()),
                    SamplingMode::Pushed => "pushed".to_owned(),
                    SamplingMode::OnDemand => "on demand".to_owned(),
                };
                println!(
                    "  {name}: {} [{}] {mode}",
                    configuration.locator, configuration.direction
                );
            }
            Ok(())
        }
        Commands::Run => {
            init_tracing("r-emsd", &config.logging)?;
            info!(source = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await
        }
    }
}

fn channel_configurations(config: &AppConfig) -> Result<Vec<(String, ChannelConfiguration)>> {
    config
        .channels
        .iter()
        .map(|(name, entry)| {
            ChannelConfiguration::from_entry(entry)
                .with_context(|| format!("invalid channel '{name}'"))
                .map(|configuration| (name.clone(), configuration))
        })
        .collect()
}

async fn run_daemon(config: AppConfig, config_load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(config_load_seconds);
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let access = RoleBasedAccess::new(RbacEngine::new(), config.access.roles.clone());
    let manager = ChannelManager::new(SchedulerSettings::from(&config.scheduler))
        .with_access(Arc::new(access))
        .with_metrics(ChannelMetrics::new(&registry)?);
    manager.register_driver(ModbusDriver::shared());
    manager.register_driver(Iec104Driver::shared());
    info!(drivers = ?manager.driver_ids(), "drivers registered");

    let mut configured: Vec<ChannelLocator> = Vec::new();
    for (name, configuration) in channel_configurations(&config)? {
        let locator = configuration.locator.clone();
        match manager.add_channel(configuration) {
            Ok(()) => configured.push(locator),
            Err(err) => warn!(channel = %name, error = %err, "failed to add channel"),
        }
    }

    let logger: Arc<dyn ChannelEventListener> = Arc::new(ChangeLogger);
    if !configured.is_empty() {
        manager.register_changed_listener(&configured, &logger)?;
    }
    info!(
        channels = manager.channel_count(),
        device_groups = manager.device_group_count(),
        "channel manager running; waiting for termination signal"
    );

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    manager.unregister_changed_listener(&configured, &logger);
    manager.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
