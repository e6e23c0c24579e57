// =============================================================================
// Projections — point-in-time views of the trading world
// =============================================================================
//
// The state store owns one `World`; every read hands out a `Projection`: the
// sequence at which the read occurred plus the entity maps restricted to a
// client's subscriptions and symbol filter. Entities are held behind `Arc`,
// so cloning a projection copies pointers, not entities — the per-client
// `last-sent` copy is cheap and structurally shared.
//
// All maps are `BTreeMap` so iteration order (and therefore differ output
// and serialized key order) is deterministic.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::event::{AssetBalance, BookLevel};
use crate::types::{Channel, OrderStatus, OrderType, PositionSide, Side, StrategyState};

// =============================================================================
// Entities
// =============================================================================

/// Live quote for one symbol. Created on first observation, mutated by the
/// market-data adapter, never destroyed during the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub volume_24h: Decimal,
    pub updated_at: DateTime<Utc>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// Set at projection time when `updated_at` is older than the staleness
    /// threshold. Stale quotes are annotated, not removed.
    pub stale: bool,
}

/// An order in the active view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub strategy_id: Option<String>,
    pub time_in_force: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Open position for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    /// A zero-quantity position is flat and semantically empty.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Strategy engine status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub state: StrategyState,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub last_signal_summary: Option<String>,
}

/// Singleton account snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountState {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_margin_used: Decimal,
    pub balances: Vec<AssetBalance>,
}

// =============================================================================
// ViewFilter
// =============================================================================

/// What a client wants to see: a channel subscription set and an optional
/// symbol restriction for the symbol-keyed channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewFilter {
    pub channels: BTreeSet<Channel>,
    pub symbols: Option<BTreeSet<String>>,
}

impl Default for ViewFilter {
    /// All channels, no symbol restriction.
    fn default() -> Self {
        Self {
            channels: Channel::ALL.into_iter().collect(),
            symbols: None,
        }
    }
}

impl ViewFilter {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            symbols: None,
        }
    }

    pub fn with_symbols(mut self, symbols: impl IntoIterator<Item = String>) -> Self {
        let set: BTreeSet<String> = symbols.into_iter().collect();
        self.symbols = if set.is_empty() { None } else { Some(set) };
        self
    }

    pub fn allows(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// Whether a symbol passes the filter. No filter means everything passes.
    pub fn symbol_ok(&self, symbol: &str) -> bool {
        match &self.symbols {
            Some(set) => set.contains(symbol),
            None => true,
        }
    }

    /// Apply a `subscribe` control message: add channels, replace the symbol
    /// filter when symbols were given.
    pub fn subscribe(&mut self, channels: &[Channel], symbols: &[String]) {
        self.channels.extend(channels.iter().copied());
        if !symbols.is_empty() {
            self.symbols = Some(symbols.iter().cloned().collect());
        }
    }

    /// Apply an `unsubscribe` control message.
    pub fn unsubscribe(&mut self, channels: &[Channel]) {
        for ch in channels {
            self.channels.remove(ch);
        }
    }
}

// =============================================================================
// Projection
// =============================================================================

/// A consistent view of the world at `sequence`, restricted to a filter.
///
/// Serializes as the `data` payload of a snapshot frame:
/// `{market_data: {...}, orders: {...}, positions: {...}, strategies: {...},
/// account: {...}}`. Channels outside the filter serialize as empty maps so
/// the client-side schema is stable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Projection {
    #[serde(skip)]
    pub sequence: u64,
    pub market_data: BTreeMap<String, Arc<MarketQuote>>,
    pub orders: BTreeMap<String, Arc<Order>>,
    pub positions: BTreeMap<String, Arc<Position>>,
    pub strategies: BTreeMap<String, Arc<Strategy>>,
    pub account: Option<Arc<AccountState>>,
}

impl Projection {
    /// True when no entity survives the filter. An empty projection is still
    /// a valid snapshot payload.
    pub fn is_empty(&self) -> bool {
        self.market_data.is_empty()
            && self.orders.is_empty()
            && self.positions.is_empty()
            && self.strategies.is_empty()
            && self.account.is_none()
    }
}

// =============================================================================
// Tests
// =============================================================================
