// =============================================================================
// Normalized upstream events
// =============================================================================
//
// Every source adapter converts its on-wire representation into one of these
// variants before pushing it onto the hub's bounded event channel. The state
// writer is the only consumer.
//
// Normalization guarantees:
//   - money / price / quantity are `rust_decimal::Decimal`, never floats
//   - timestamps are UTC with millisecond resolution
//   - decimals arrive normalized (no trailing zeros) so value equality is
//     representation-independent downstream
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, PositionSide, Side, StrategyState};

/// One price level of the order book ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// A normalized event from any upstream, tagged by domain.
#[derive(Debug, Clone)]
pub enum Event {
    Quote(QuoteUpdate),
    Order(OrderUpdate),
    Position(PositionUpdate),
    Strategy(StrategyUpdate),
    Account(AccountUpdate),
}

impl Event {
    pub fn domain(&self) -> &'static str {
        match self {
            Self::Quote(_) => "market_data",
            Self::Order(_) => "orders",
            Self::Position(_) => "positions",
            Self::Strategy(_) => "strategies",
            Self::Account(_) => "account",
        }
    }
}

/// Market quote update for one symbol.
#[derive(Debug, Clone)]
pub struct QuoteUpdate {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub volume_24h: Decimal,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Order event from the execution service. Carries the full order state as
/// of the event, so upserts are self-contained.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
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
    pub ts: DateTime<Utc>,
}

/// Position update from the account monitor.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

/// Strategy status update from the strategy engine.
#[derive(Debug, Clone)]
pub struct StrategyUpdate {
    pub id: String,
    pub name: String,
    pub state: StrategyState,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub last_signal_summary: Option<String>,
}

/// Per-asset balance within the account snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

/// Full account snapshot. The account entity is a singleton; each update
/// replaces the previous one wholesale.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_margin_used: Decimal,
    pub balances: Vec<AssetBalance>,
}
