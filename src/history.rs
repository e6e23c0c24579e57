// =============================================================================
// History Query Facade
// =============================================================================
//
// Thin read-through client over the platform's time-series service. The hub
// never persists; it only validates and forwards bounded range queries.
// =============================================================================

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::HubError;

/// Per-query deadline.
const QUERY_DEADLINE: Duration = Duration::from_secs(15);

/// Entities the time-series store keeps series for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEntity {
    Quotes,
    Orders,
    Positions,
    Account,
}

impl HistoryEntity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quotes" | "market_data" => Some(Self::Quotes),
            "orders" => Some(Self::Orders),
            "positions" => Some(Self::Positions),
            "account" => Some(Self::Account),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quotes => "quotes",
            Self::Orders => "orders",
            Self::Positions => "positions",
            Self::Account => "account",
        }
    }
}

/// Validate a `[from, to]` range (unix seconds) against the configured cap.
pub fn validate_range(from_s: i64, to_s: i64, max_range_s: u64) -> Result<(), HubError> {
    if to_s <= from_s {
        return Err(HubError::History(format!(
            "empty or inverted range: from={from_s} to={to_s}"
        )));
    }
    let span = (to_s - from_s) as u64;
    if span > max_range_s {
        return Err(HubError::History(format!(
            "range of {span}s exceeds the {max_range_s}s cap"
        )));
    }
    Ok(())
}

pub struct HistoryClient {
    base_url: String,
    http: Client,
    max_range_s: u64,
}

impl HistoryClient {
    pub fn new(base_url: String, max_range_s: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
            max_range_s,
        }
    }

    /// Fetch one bounded series from the time-series store.
    pub async fn history(
        &self,
        entity: HistoryEntity,
        from_s: i64,
        to_s: i64,
        resolution: &str,
    ) -> Result<serde_json::Value, HubError> {
        validate_range(from_s, to_s, self.max_range_s)?;

        let url = format!("{}/api/v1/series", self.base_url);
        debug!(entity = entity.as_str(), from_s, to_s, resolution, "history query");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("entity", entity.as_str()),
                ("from", &from_s.to_string()),
                ("to", &to_s.to_string()),
                ("resolution", resolution),
            ])
            .timeout(QUERY_DEADLINE)
            .send()
            .await
            .map_err(|e| HubError::History(format!("time-series request failed: {e}")))?;

        let response = response
            .error_for_status()
            .map_err(|e| HubError::History(format!("time-series store rejected query: {e}")))?;

        response
            .json()
            .await
            .map_err(|e| HubError::History(format!("bad time-series response: {e}")))
    }
}

// =============================================================================
// Tests
// =============================================================================
