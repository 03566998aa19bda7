//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_EMS_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `R_EMS_LOG` overrides the filter (e.g. `info`, `r_ems_channels=debug`). When unset
///   `RUST_LOG` is honoured, finally defaulting to `info` plus `config.directives`.
///   Per-poll diagnostics of the device workers are emitted at `debug` and `trace`
///   inside a `device_worker` span carrying the device and driver.
/// * Stdout receives JSON or pretty output depending on `config.format`; a rolling daily
///   JSON file is always written to `config.directory`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{}.log", prefix));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let override_directive = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = build_filter(config, override_directive.as_deref());

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    Ok(())
}

/// Resolve the channel manager's filter: an environment override wins, otherwise
/// `info` extended by the configured directives. Malformed entries are skipped.
fn build_filter(config: &LoggingConfig, override_directive: Option<&str>) -> EnvFilter {
    if let Some(directive) = override_directive {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!(
                "invalid {} directive ({}); falling back to configuration",
                LOG_ENV, err
            ),
        }
    }
    let mut filter = EnvFilter::new(DEFAULT_DIRECTIVE);
    for directive in &config.directives {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(err) => eprintln!("ignoring log directive '{}': {}", directive, err),
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(directives: &[&str]) -> LoggingConfig {
        LoggingConfig {
            directives: directives.iter().map(|d| d.to_string()).collect(),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn configured_directives_extend_the_default() {
        let rendered = build_filter(&config(&["r_ems_channels=debug"]), None).to_string();
        assert!(rendered.contains("r_ems_channels=debug"));
        assert!(rendered.contains("info"));
    }

    #[test]
    fn environment_override_replaces_configured_directives() {
        let rendered =
            build_filter(&config(&["r_ems_channels=debug"]), Some("r_ems_drivers=trace"))
                .to_string();
        assert!(rendered.contains("r_ems_drivers=trace"));
        assert!(!rendered.contains("r_ems_channels"));
    }

    #[test]
    fn malformed_directives_are_skipped() {
        let rendered =
            build_filter(&config(&["r_ems_channels=loud", "r_ems_drivers=warn"]), None).to_string();
        assert!(rendered.contains("r_ems_drivers=warn"));
        assert!(!rendered.contains("loud"));
    }
}
