// =============================================================================
// Source Adapters — upstream fan-in
// =============================================================================
//
// One adapter per upstream feed. Each adapter is a run-to-completion async fn
// in the same shape: connect, loop over messages, normalize each into an
// `Event` on the hub's bounded channel, and return when the transport drops.
// The supervisor owns reconnection; adapters never retry internally.
//
// Adapters are tagged variants dispatched at the supervisor boundary, not a
// trait hierarchy — the set of upstreams is closed and known at build time.
// =============================================================================

pub mod account;
pub mod market_data;
pub mod orders;
pub mod strategy;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::UpstreamConfig;
use crate::event::Event;
use crate::metrics;
use crate::types::{AdapterHealth, AdapterKind};

pub use account::AccountFeedAdapter;
pub use market_data::MarketDataAdapter;
pub use orders::OrderFeedAdapter;
pub use strategy::StrategyPollAdapter;

/// Book ladder depth retained per side.
pub const BOOK_DEPTH: usize = 10;

/// How one adapter run ended, as seen by the supervisor.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transient transport failure; the supervisor reconnects with backoff.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// Persistent auth/config failure; the supervisor stops retrying and the
    /// process surfaces degraded readiness.
    #[error("fatal adapter error: {0}")]
    Fatal(String),
}

// =============================================================================
// AdapterHandle
// =============================================================================

/// Shared health/counter handle for one adapter. The adapter marks messages
/// and malformed payloads; the supervisor owns status transitions around
/// connects; everyone else only reads.
pub struct AdapterHandle {
    kind: AdapterKind,
    status: RwLock<AdapterHealth>,
    messages: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
}

impl AdapterHandle {
    pub fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            status: RwLock::new(AdapterHealth::Reconnecting),
            messages: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn status(&self) -> AdapterHealth {
        *self.status.read()
    }

    pub fn set_status(&self, status: AdapterHealth) {
        *self.status.write() = status;
    }

    /// A successfully normalized upstream message. Marks the adapter Ok.
    pub fn mark_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        let mut status = self.status.write();
        if *status != AdapterHealth::Ok {
            *status = AdapterHealth::Ok;
        }
    }

    /// A malformed upstream message: discarded, counted, never fatal.
    pub fn mark_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        metrics::upstream_malformed(self.kind.as_str());
    }

    pub fn mark_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::adapter_reconnect(self.kind.as_str());
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

// =============================================================================
// SourceAdapter
// =============================================================================

/// The closed set of upstream adapters.
pub enum SourceAdapter {
    MarketData(MarketDataAdapter),
    Orders(OrderFeedAdapter),
    Account(AccountFeedAdapter),
    Strategy(StrategyPollAdapter),
}

impl SourceAdapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::MarketData(_) => AdapterKind::MarketData,
            Self::Orders(_) => AdapterKind::Orders,
            Self::Account(_) => AdapterKind::Account,
            Self::Strategy(_) => AdapterKind::Strategy,
        }
    }

    /// Run one connection lifetime. Returns `Ok` on a clean stream end and
    /// `Err(Transport)` on a dropped transport; both mean "reconnect".
    pub async fn run(
        &self,
        tx: &mpsc::Sender<Event>,
        handle: &AdapterHandle,
    ) -> Result<(), AdapterError> {
        match self {
            Self::MarketData(a) => a.run(tx, handle).await,
            Self::Orders(a) => a.run(tx, handle).await,
            Self::Account(a) => a.run(tx, handle).await,
            Self::Strategy(a) => a.run(tx, handle).await,
        }
    }

    /// The full adapter set for a given upstream configuration.
    pub fn all_from_config(upstream: &UpstreamConfig) -> Vec<SourceAdapter> {
        vec![
            Self::MarketData(MarketDataAdapter {
                redis_url: upstream.redis_url.clone(),
                pattern: upstream.market_data_pattern.clone(),
            }),
            Self::Orders(OrderFeedAdapter {
                url: upstream.orders_url.clone(),
            }),
            Self::Account(AccountFeedAdapter {
                url: upstream.account_url.clone(),
            }),
            Self::Strategy(StrategyPollAdapter {
                base_url: upstream.strategy_url.clone(),
                poll_ms: upstream.strategy_poll_ms,
            }),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
