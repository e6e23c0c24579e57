// =============================================================================
// Hub Configuration — loaded once at startup
// =============================================================================
//
// Central configuration for the Meridian hub. Every field carries a serde
// default so older config files keep loading as fields are added. Endpoint
// and credential overrides come from `MERIDIAN_*` environment variables so
// deployments never put secrets in the file.
//
// There is no hot reload: the config is read once, validated, and handed to
// every component at construction. Validation failures refuse startup.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::HubError;
use crate::types::ClientKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_write_deadline_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    60_000
}

fn default_client_queue_size() -> usize {
    16
}

fn default_tui_ms() -> u64 {
    100
}

fn default_web_ms() -> u64 {
    250
}

fn default_service_ms() -> u64 {
    1_000
}

fn default_quote_staleness_ms() -> u64 {
    5_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

fn default_snapshot_override_ratio() -> f64 {
    0.5
}

fn default_history_max_range_s() -> u64 {
    86_400
}

fn default_event_channel_size() -> usize {
    1_024
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_market_data_pattern() -> String {
    "market:*".to_string()
}

fn default_orders_url() -> String {
    "ws://127.0.0.1:9101/events".to_string()
}

fn default_account_url() -> String {
    "ws://127.0.0.1:9102/stream".to_string()
}

fn default_strategy_url() -> String {
    "http://127.0.0.1:9103".to_string()
}

fn default_strategy_poll_ms() -> u64 {
    2_000
}

fn default_history_url() -> String {
    "http://127.0.0.1:9104".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// WebSocket gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    /// Upgrade path clients connect to.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Inbound frame limit; larger client frames close the connection.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Per-write deadline. Expiry closes the connection.
    #[serde(default = "default_write_deadline_ms")]
    pub write_deadline_ms: u64,

    /// Server-initiated ping cadence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Close the connection when no pong arrived within this window.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    /// Bounded outbound queue per client; overflow drops + forces a resync.
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,

    /// Optional shared handshake key. When set, clients must present it.
    #[serde(default)]
    pub shared_key: Option<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_message_bytes: default_max_message_bytes(),
            write_deadline_ms: default_write_deadline_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            client_queue_size: default_client_queue_size(),
            shared_key: None,
        }
    }
}

/// Per-client-type refresh cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_tui_ms")]
    pub tui_ms: u64,
    #[serde(default = "default_web_ms")]
    pub web_ms: u64,
    #[serde(default = "default_service_ms")]
    pub service_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tui_ms: default_tui_ms(),
            web_ms: default_web_ms(),
            service_ms: default_service_ms(),
        }
    }
}

impl RefreshConfig {
    pub fn interval_for(&self, kind: ClientKind) -> Duration {
        let ms = match kind {
            ClientKind::Tui => self.tui_ms,
            ClientKind::Web => self.web_ms,
            ClientKind::Service => self.service_ms,
        };
        Duration::from_millis(ms)
    }

    /// Fastest configured cadence. The eviction sweeper runs at this rate so
    /// a confirmed removal lands within one tick of the fastest client.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.tui_ms.min(self.web_ms).min(self.service_ms))
    }
}

/// Supervisor backoff shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub cap_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: default_reconnect_base_ms(),
            cap_ms: default_reconnect_cap_ms(),
        }
    }
}

/// Upstream endpoint descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Redis-compatible bus carrying topic-per-symbol quote channels.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Pattern subscribed on the bus.
    #[serde(default = "default_market_data_pattern")]
    pub market_data_pattern: String,

    /// Order-execution event stream.
    #[serde(default = "default_orders_url")]
    pub orders_url: String,

    /// Account monitor position/account stream.
    #[serde(default = "default_account_url")]
    pub account_url: String,

    /// Strategy engine base URL, polled for status.
    #[serde(default = "default_strategy_url")]
    pub strategy_url: String,

    #[serde(default = "default_strategy_poll_ms")]
    pub strategy_poll_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            market_data_pattern: default_market_data_pattern(),
            orders_url: default_orders_url(),
            account_url: default_account_url(),
            strategy_url: default_strategy_url(),
            strategy_poll_ms: default_strategy_poll_ms(),
        }
    }
}

/// History facade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_url")]
    pub url: String,

    /// Cap on a single query range, in seconds.
    #[serde(default = "default_history_max_range_s")]
    pub max_range_s: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            url: default_history_url(),
            max_range_s: default_history_max_range_s(),
        }
    }
}

// =============================================================================
// HubConfig
// =============================================================================

/// Top-level hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// HTTP/WS bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub ws: WsConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Quotes older than this are annotated stale in outgoing messages.
    #[serde(default = "default_quote_staleness_ms")]
    pub quote_staleness_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// When a delta's serialized size exceeds this fraction of a fresh
    /// snapshot, the scheduler sends the snapshot instead.
    #[serde(default = "default_snapshot_override_ratio")]
    pub snapshot_override_ratio: f64,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Bounded fan-in channel between adapters and the state writer.
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,

    /// How long the writer may keep draining after shutdown begins.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            ws: WsConfig::default(),
            refresh: RefreshConfig::default(),
            quote_staleness_ms: default_quote_staleness_ms(),
            reconnect: ReconnectConfig::default(),
            snapshot_override_ratio: default_snapshot_override_ratio(),
            upstream: UpstreamConfig::default(),
            history: HistoryConfig::default(),
            event_channel_size: default_event_channel_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hub config from {}", path.display()))?;

        info!(path = %path.display(), bind = %config.bind_addr, "hub config loaded");
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_REDIS_URL") {
            self.upstream.redis_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_ORDERS_URL") {
            self.upstream.orders_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_ACCOUNT_URL") {
            self.upstream.account_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_STRATEGY_URL") {
            self.upstream.strategy_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_HISTORY_URL") {
            self.history.url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_WS_SHARED_KEY") {
            if !v.is_empty() {
                self.ws.shared_key = Some(v);
            }
        }
    }

    /// Validate startup invariants. Any failure refuses startup.
    pub fn validate(&self) -> Result<(), HubError> {
        if !self.ws.path.starts_with('/') {
            return Err(HubError::Config(format!(
                "ws.path must start with '/', got {:?}",
                self.ws.path
            )));
        }
        if self.ws.client_queue_size < 2 {
            return Err(HubError::Config(format!(
                "ws.client_queue_size must be at least 2, got {}",
                self.ws.client_queue_size
            )));
        }
        if self.ws.write_deadline_ms == 0 {
            return Err(HubError::Config(
                "ws.write_deadline_ms must be positive".to_string(),
            ));
        }
        if self.ws.ping_interval_ms == 0 || self.ws.pong_timeout_ms == 0 {
            return Err(HubError::Config(
                "ws heartbeat intervals must be positive".to_string(),
            ));
        }
        if self.refresh.tui_ms == 0 || self.refresh.web_ms == 0 || self.refresh.service_ms == 0 {
            return Err(HubError::Config(
                "refresh intervals must be positive".to_string(),
            ));
        }
        if !(self.snapshot_override_ratio > 0.0 && self.snapshot_override_ratio <= 1.0) {
            return Err(HubError::Config(format!(
                "snapshot_override_ratio must be in (0, 1], got {}",
                self.snapshot_override_ratio
            )));
        }
        if self.reconnect.base_ms == 0 || self.reconnect.cap_ms < self.reconnect.base_ms {
            return Err(HubError::Config(format!(
                "reconnect backoff must satisfy 0 < base_ms <= cap_ms, got base={} cap={}",
                self.reconnect.base_ms, self.reconnect.cap_ms
            )));
        }
        if self.history.max_range_s == 0 {
            return Err(HubError::Config(
                "history.max_range_s must be positive".to_string(),
            ));
        }
        if self.event_channel_size == 0 {
            return Err(HubError::Config(
                "event_channel_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.ws.write_deadline_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.ws.pong_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.ws.path, "/ws");
        assert_eq!(cfg.ws.max_message_bytes, 1024 * 1024);
        assert_eq!(cfg.ws.client_queue_size, 16);
        assert_eq!(cfg.refresh.tui_ms, 100);
        assert_eq!(cfg.refresh.web_ms, 250);
        assert_eq!(cfg.refresh.service_ms, 1_000);
        assert_eq!(cfg.quote_staleness_ms, 5_000);
        assert_eq!(cfg.reconnect.base_ms, 1_000);
        assert_eq!(cfg.reconnect.cap_ms, 30_000);
        assert!((cfg.snapshot_override_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.history.max_range_s, 86_400);
        assert!(cfg.ws.shared_key.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: HubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ws.path, "/ws");
        assert_eq!(cfg.refresh.web_ms, 250);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "ws": { "client_queue_size": 32 }, "refresh": { "tui_ms": 50 } }"#;
        let cfg: HubConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ws.client_queue_size, 32);
        assert_eq!(cfg.ws.path, "/ws");
        assert_eq!(cfg.refresh.tui_ms, 50);
        assert_eq!(cfg.refresh.web_ms, 250);
    }

    #[test]
    fn refresh_interval_maps_client_kind() {
        let cfg = HubConfig::default();
        assert_eq!(
            cfg.refresh.interval_for(ClientKind::Tui),
            Duration::from_millis(100)
        );
        assert_eq!(
            cfg.refresh.interval_for(ClientKind::Web),
            Duration::from_millis(250)
        );
        assert_eq!(
            cfg.refresh.interval_for(ClientKind::Service),
            Duration::from_millis(1_000)
        );
        assert_eq!(cfg.refresh.min_interval(), Duration::from_millis(100));
    }

    #[test]
    fn validate_rejects_tiny_queue() {
        let mut cfg = HubConfig::default();
        cfg.ws.client_queue_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_ratio() {
        let mut cfg = HubConfig::default();
        cfg.snapshot_override_ratio = 0.0;
        assert!(cfg.validate().is_err());
        cfg.snapshot_override_ratio = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = HubConfig::default();
        cfg.reconnect.base_ms = 5_000;
        cfg.reconnect.cap_ms = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_ws_path() {
        let mut cfg = HubConfig::default();
        cfg.ws.path = "ws".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = HubConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.ws.client_queue_size, cfg2.ws.client_queue_size);
        assert_eq!(cfg.history.max_range_s, cfg2.history.max_range_s);
    }
}
