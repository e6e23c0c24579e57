// =============================================================================
// Metrics — Prometheus names and recorder install
// =============================================================================
//
// All metric names live here so dashboards and alerts have one place to look.
// The recorder is installed once at startup; `/metrics` renders the handle.
// =============================================================================

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CLIENTS_CONNECTED: &str = "meridian_clients_connected";
pub const EVENTS_APPLIED: &str = "meridian_events_applied_total";
pub const FRAMES_SENT: &str = "meridian_frames_sent_total";
pub const FRAMES_DROPPED: &str = "meridian_frames_dropped_total";
pub const RESYNCS: &str = "meridian_resyncs_total";
pub const TICK_LATENCY_SECONDS: &str = "meridian_tick_latency_seconds";
pub const UPSTREAM_MALFORMED: &str = "meridian_upstream_malformed_total";
pub const ADAPTER_RECONNECTS: &str = "meridian_adapter_reconnects_total";

/// Install the global Prometheus recorder and return the render handle used
/// by the `/metrics` route.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

pub fn event_applied(domain: &'static str) {
    metrics::counter!(EVENTS_APPLIED, "domain" => domain).increment(1);
}

pub fn frame_sent(kind: &'static str) {
    metrics::counter!(FRAMES_SENT, "kind" => kind).increment(1);
}

pub fn frame_dropped() {
    metrics::counter!(FRAMES_DROPPED).increment(1);
}

pub fn resync() {
    metrics::counter!(RESYNCS).increment(1);
}

pub fn tick_latency(seconds: f64) {
    metrics::histogram!(TICK_LATENCY_SECONDS).record(seconds);
}

pub fn clients_connected(count: usize) {
    metrics::gauge!(CLIENTS_CONNECTED).set(count as f64);
}

pub fn upstream_malformed(kind: &'static str) {
    metrics::counter!(UPSTREAM_MALFORMED, "adapter" => kind).increment(1);
}

pub fn adapter_reconnect(kind: &'static str) {
    metrics::counter!(ADAPTER_RECONNECTS, "adapter" => kind).increment(1);
}
