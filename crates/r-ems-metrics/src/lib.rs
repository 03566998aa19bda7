//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every collector of the registry in the text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_emsd_starts_total",
            "Total number of times the channel manager daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_emsd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "r_emsd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Sampling and dispatch metrics for the channel manager.
#[derive(Clone, Debug)]
pub struct ChannelMetrics {
    reads: IntCounterVec,
    read_failures: IntCounterVec,
    pushed_samples: IntCounterVec,
    events: IntCounterVec,
    batch_size: Histogram,
    channels_configured: IntGauge,
    device_groups_active: IntGauge,
}

impl ChannelMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let reads = IntCounterVec::new(
            Opts::new(
                "r_ems_channel_reads_total",
                "Batched driver reads issued by device workers",
            ),
            &["driver"],
        )?;
        registry.register(Box::new(reads.clone()))?;

        let read_failures = IntCounterVec::new(
            Opts::new(
                "r_ems_channel_read_failures_total",
                "Batched driver reads that ended in BAD samples",
            ),
            &["driver"],
        )?;
        registry.register(Box::new(read_failures.clone()))?;

        let pushed_samples = IntCounterVec::new(
            Opts::new(
                "r_ems_channel_pushed_samples_total",
                "Samples delivered through driver push callbacks",
            ),
            &["driver"],
        )?;
        registry.register(Box::new(pushed_samples.clone()))?;

        let events = IntCounterVec::new(
            Opts::new(
                "r_ems_channel_events_total",
                "Listener notifications by event type",
            ),
            &["event"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "r_ems_channel_batch_size",
                "Number of channels per batched driver read",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let channels_configured = IntGauge::with_opts(Opts::new(
            "r_ems_channels_configured",
            "Channels currently configured",
        ))?;
        registry.register(Box::new(channels_configured.clone()))?;

        let device_groups_active = IntGauge::with_opts(Opts::new(
            "r_ems_device_groups_active",
            "Devices with a running polling worker",
        ))?;
        registry.register(Box::new(device_groups_active.clone()))?;

        Ok(Self {
            reads,
            read_failures,
            pushed_samples,
            events,
            batch_size,
            channels_configured,
            device_groups_active,
        })
    }

    pub fn record_read(&self, driver: &str, batch_len: usize) {
        self.reads.with_label_values(&[driver]).inc();
        self.batch_size.observe(batch_len as f64);
    }

    pub fn record_read_failure(&self, driver: &str) {
        self.read_failures.with_label_values(&[driver]).inc();
    }

    pub fn record_pushed(&self, driver: &str, samples: usize) {
        self.pushed_samples
            .with_label_values(&[driver])
            .inc_by(samples as u64);
    }

    pub fn record_events(&self, event: &str, notifications: usize) {
        self.events
            .with_label_values(&[event])
            .inc_by(notifications as u64);
    }

    pub fn set_channels(&self, count: usize) {
        self.channels_configured.set(count as i64);
    }

    pub fn set_device_groups(&self, count: usize) {
        self.device_groups_active.set(count as i64);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_metrics_render_after_updates() {
        let registry = new_registry();
        let metrics = ChannelMetrics::new(&registry).unwrap();
        metrics.record_read("modbus", 3);
        metrics.record_read_failure("modbus");
        metrics.set_channels(3);
        metrics.set_device_groups(1);

        let text = render(&registry).unwrap();
        assert!(text.contains("r_ems_channel_reads_total{driver=\"modbus\"} 1"));
        assert!(text.contains("r_ems_channels_configured 3"));
        assert!(text.contains("r_ems_device_groups_active 1"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        ChannelMetrics::new(&registry).unwrap();
        assert!(ChannelMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn http_exporter_binds_and_shuts_down() {
        let registry = new_registry();
        DaemonMetrics::new(&registry).unwrap().inc_start();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
