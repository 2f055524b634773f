use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::wsbridge::relay::Direction;

pub const CONNECTIONS_TOTAL: &str = "wsbridge_connections_total";
pub const CONNECTIONS_ACTIVE: &str = "wsbridge_connections_active";
pub const BYTES_TRANSFERRED_TOTAL: &str = "wsbridge_bytes_transferred_total";
pub const CONNECTION_DURATION_SECONDS: &str = "wsbridge_connection_duration_seconds";
pub const ERRORS_TOTAL: &str = "wsbridge_errors_total";

/// Prometheus client default buckets.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Recording interface consumed by the connection path.
///
/// Implementations must never block and must tolerate concurrent calls from
/// every session task.
pub trait MetricsSink: Send + Sync {
    /// Counts a connection outcome and raises the active gauge.
    fn record_connection(&self, kind: &'static str, status: &'static str);
    /// Lowers the active gauge. Called exactly once per accepted connection.
    fn record_connection_closed(&self);
    fn record_bytes_transferred(&self, direction: Direction, bytes: u64);
    fn record_connection_duration(&self, kind: &'static str, seconds: f64);
    fn record_error(&self, kind: &'static str, message: &str);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Used when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    #[inline]
    fn record_connection(&self, _kind: &'static str, _status: &'static str) {}
    #[inline]
    fn record_connection_closed(&self) {}
    #[inline]
    fn record_bytes_transferred(&self, _direction: Direction, _bytes: u64) {}
    #[inline]
    fn record_connection_duration(&self, _kind: &'static str, _seconds: f64) {}
    #[inline]
    fn record_error(&self, _kind: &'static str, _message: &str) {}
}

/// Records into the process-wide `metrics` recorder installed by [`init_prometheus`].
#[derive(Debug, Clone, Copy)]
pub struct PrometheusMetrics {
    _installed: (),
}

impl PrometheusMetrics {
    /// Taking the handle ties construction to a completed recorder install.
    pub fn new(_handle: &PrometheusHandle) -> Self {
        Self { _installed: () }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_connection(&self, kind: &'static str, status: &'static str) {
        counter!(CONNECTIONS_TOTAL, "type" => kind, "status" => status).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    }

    fn record_connection_closed(&self) {
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    }

    fn record_bytes_transferred(&self, direction: Direction, bytes: u64) {
        counter!(BYTES_TRANSFERRED_TOTAL, "direction" => direction.as_str()).increment(bytes);
    }

    fn record_connection_duration(&self, kind: &'static str, seconds: f64) {
        histogram!(CONNECTION_DURATION_SECONDS, "type" => kind).record(seconds);
    }

    fn record_error(&self, kind: &'static str, message: &str) {
        counter!(ERRORS_TOTAL, "type" => kind, "error" => message.to_owned()).increment(1);
    }
}

/// Builds the sink for the configured mode.
pub fn metrics_sink(enabled: bool) -> anyhow::Result<(SharedMetrics, Option<PrometheusHandle>)> {
    if !enabled {
        return Ok((Arc::new(NoopMetrics), None));
    }
    let handle = init_prometheus()?;
    tracing::info!("metrics: enabled");
    Ok((Arc::new(PrometheusMetrics::new(&handle)), Some(handle)))
}

/// Installs the Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// Installation happens once per process; later calls return the same handle.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

    let mut slot = HANDLE
        .lock()
        .map_err(|_| anyhow::anyhow!("metrics: recorder lock poisoned"))?;
    if let Some(h) = slot.as_ref() {
        return Ok(h.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(CONNECTION_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .context("metrics: configure histogram buckets")?
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;

    describe_counter!(CONNECTIONS_TOTAL, "Total number of connections");
    describe_gauge!(CONNECTIONS_ACTIVE, "Number of active connections");
    describe_counter!(BYTES_TRANSFERRED_TOTAL, "Total bytes transferred");
    describe_histogram!(
        CONNECTION_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Connection duration in seconds"
    );
    describe_counter!(ERRORS_TOTAL, "Total number of errors");

    *slot = Some(handle.clone());
    Ok(handle)
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}
