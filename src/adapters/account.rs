// =============================================================================
// Account-feed adapter — position and account stream
// =============================================================================
//
// One stream from the account monitor carries both per-symbol position
// updates and whole-account snapshots, tagged by `type`. Positions upsert;
// account snapshots replace the singleton wholesale.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::{AdapterError, AdapterHandle};
use crate::event::{AccountUpdate, AssetBalance, Event, PositionUpdate};
use crate::types::PositionSide;

pub struct AccountFeedAdapter {
    pub url: String,
}

impl AccountFeedAdapter {
    pub async fn run(
        &self,
        tx: &mpsc::Sender<Event>,
        handle: &AdapterHandle,
    ) -> Result<(), AdapterError> {
        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to account stream")?;

        info!(url = %self.url, "account stream connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_account_message(&text) {
                            Ok(event) => {
                                handle.mark_message();
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed account message — skipped");
                                handle.mark_malformed();
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "account stream read error");
                    return Err(anyhow::Error::from(e)
                        .context("account stream read error")
                        .into());
                }
                None => {
                    warn!("account stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AccountWire {
    Position {
        symbol: String,
        side: PositionSide,
        quantity: Decimal,
        #[serde(default)]
        avg_entry_price: Decimal,
        #[serde(default)]
        mark_price: Decimal,
        #[serde(default)]
        unrealized_pnl: Decimal,
        #[serde(default)]
        realized_pnl: Decimal,
    },
    Account {
        total_equity: Decimal,
        available_balance: Decimal,
        #[serde(default)]
        total_unrealized_pnl: Decimal,
        #[serde(default)]
        total_margin_used: Decimal,
        #[serde(default)]
        balances: Vec<AssetBalance>,
    },
}

fn parse_account_message(text: &str) -> Result<Event> {
    let wire: AccountWire =
        serde_json::from_str(text).context("failed to parse account JSON")?;

    Ok(match wire {
        AccountWire::Position {
            symbol,
            side,
            quantity,
            avg_entry_price,
            mark_price,
            unrealized_pnl,
            realized_pnl,
        } => Event::Position(PositionUpdate {
            symbol,
            side,
            quantity,
            avg_entry_price,
            mark_price,
            unrealized_pnl,
            realized_pnl,
        }),
        AccountWire::Account {
            total_equity,
            available_balance,
            total_unrealized_pnl,
            total_margin_used,
            balances,
        } => Event::Account(AccountUpdate {
            total_equity,
            available_balance,
            total_unrealized_pnl,
            total_margin_used,
            balances,
        }),
    })
}

// =============================================================================
// Tests
// =============================================================================
