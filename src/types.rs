// =============================================================================
// Shared types used across the Meridian hub
// =============================================================================

use serde::{Deserialize, Serialize};

/// Fan-out channel a client may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MarketData,
    Orders,
    Positions,
    Strategies,
    Account,
}

impl Channel {
    /// All channels in their fixed wire order. The differ and the snapshot
    /// payload both iterate in this order.
    pub const ALL: [Channel; 5] = [
        Channel::MarketData,
        Channel::Orders,
        Channel::Positions,
        Channel::Strategies,
        Channel::Account,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Positions => "positions",
            Self::Strategies => "strategies",
            Self::Account => "account",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Client flavor declared at handshake. Determines the default refresh
/// cadence for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Tui,
    Web,
    Service,
}

impl ClientKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tui" => Some(Self::Tui),
            "web" => Some(Self::Web),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tui => write!(f, "tui"),
            Self::Web => write!(f, "web"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Serialization format negotiated at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact-binary")]
    CompactBinary,
}

impl WireFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "compact-binary" => Some(Self::CompactBinary),
            _ => None,
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::CompactBinary => write!(f, "compact-binary"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    PostOnly,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses leave the active order view one apply after the
    /// transition and land in the recent-fills ring.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Direction of an open position. Zero quantity is `Flat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Strategy engine run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyState {
    Running,
    Stopped,
    Error,
}

/// Which upstream an adapter consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    MarketData,
    Orders,
    Account,
    Strategy,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Account => "account",
            Self::Strategy => "strategy",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of a single source adapter as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterHealth {
    Ok,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for AdapterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
