// =============================================================================
// Strategy adapter — status poller
// =============================================================================
//
// The strategy engine exposes its status over HTTP; the hub polls it on a
// fixed cadence and emits one `Event::Strategy` per strategy row. A failed
// request ends the run so the supervisor applies backoff; an auth rejection
// is fatal and parks the adapter in `failed`.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

use super::{AdapterError, AdapterHandle};
use crate::event::{Event, StrategyUpdate};
use crate::types::StrategyState;

/// Per-request deadline for the poll call.
const POLL_DEADLINE: Duration = Duration::from_secs(10);

pub struct StrategyPollAdapter {
    pub base_url: String,
    pub poll_ms: u64,
}

impl StrategyPollAdapter {
    pub async fn run(
        &self,
        tx: &mpsc::Sender<Event>,
        handle: &AdapterHandle,
    ) -> Result<(), AdapterError> {
        let http = reqwest::Client::new();
        let url = format!("{}/api/v1/strategies", self.base_url.trim_end_matches('/'));
        info!(url = %url, poll_ms = self.poll_ms, "strategy poller started");

        let mut ticker = interval(Duration::from_millis(self.poll_ms));
        loop {
            ticker.tick().await;

            let response = http
                .get(&url)
                .timeout(POLL_DEADLINE)
                .send()
                .await
                .context("strategy status request failed")?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(AdapterError::Fatal(format!(
                    "strategy engine rejected credentials ({status})"
                )));
            }
            if !status.is_success() {
                return Err(
                    anyhow::anyhow!("strategy engine returned {status}").into()
                );
            }

            let body = response
                .text()
                .await
                .context("failed to read strategy status body")?;

            match parse_strategy_rows(&body) {
                Ok(rows) => {
                    for row in rows {
                        handle.mark_message();
                        if tx.send(Event::Strategy(row)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "malformed strategy status body — skipped");
                    handle.mark_malformed();
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StrategyWire {
    id: String,
    name: String,
    state: StrategyState,
    #[serde(default)]
    last_signal_time: Option<i64>,
    #[serde(default)]
    last_signal_summary: Option<String>,
}

fn parse_strategy_rows(body: &str) -> Result<Vec<StrategyUpdate>> {
    let rows: Vec<StrategyWire> =
        serde_json::from_str(body).context("failed to parse strategy status JSON")?;

    rows.into_iter()
        .map(|row| {
            let last_signal_time = match row.last_signal_time {
                Some(ms) => Some(
                    DateTime::<Utc>::from_timestamp_millis(ms)
                        .context("strategy signal timestamp out of range")?,
                ),
                None => None,
            };
            Ok(StrategyUpdate {
                id: row.id,
                name: row.name,
                state: row.state,
                last_signal_time,
                last_signal_summary: row.last_signal_summary,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
