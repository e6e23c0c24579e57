// =============================================================================
// Order-feed adapter — execution event stream
// =============================================================================
//
// Consumes the order-execution service's streaming endpoint and normalizes
// each event into `Event::Order`. Every event carries the full order state,
// so the store can upsert without joins.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::{AdapterError, AdapterHandle};
use crate::event::{Event, OrderUpdate};
use crate::types::{OrderStatus, OrderType, Side};

pub struct OrderFeedAdapter {
    pub url: String,
}

impl OrderFeedAdapter {
    pub async fn run(
        &self,
        tx: &mpsc::Sender<Event>,
        handle: &AdapterHandle,
    ) -> Result<(), AdapterError> {
        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to order event stream")?;

        info!(url = %self.url, "order event stream connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_order_event(&text) {
                            Ok(update) => {
                                handle.mark_message();
                                if tx.send(Event::Order(update)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed order event — skipped");
                                handle.mark_malformed();
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "order event stream read error");
                    return Err(anyhow::Error::from(e)
                        .context("order event stream read error")
                        .into());
                }
                None => {
                    warn!("order event stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderWire {
    order_id: String,
    symbol: String,
    side: Side,
    #[serde(rename = "type")]
    order_type: OrderType,
    quantity: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    filled_qty: Decimal,
    #[serde(default)]
    avg_price: Option<Decimal>,
    status: OrderStatus,
    #[serde(default)]
    strategy_id: Option<String>,
    #[serde(default)]
    time_in_force: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

fn parse_order_event(text: &str) -> Result<OrderUpdate> {
    let wire: OrderWire = serde_json::from_str(text).context("failed to parse order JSON")?;

    let ts = match wire.timestamp {
        Some(ms) => {
            DateTime::<Utc>::from_timestamp_millis(ms).context("order timestamp out of range")?
        }
        None => Utc::now(),
    };

    Ok(OrderUpdate {
        order_id: wire.order_id,
        symbol: wire.symbol,
        side: wire.side,
        order_type: wire.order_type,
        quantity: wire.quantity,
        price: wire.price,
        filled_qty: wire.filled_qty,
        avg_fill_price: wire.avg_price,
        status: wire.status,
        strategy_id: wire.strategy_id,
        time_in_force: wire.time_in_force,
        ts,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_new_order_event() {
        let text = r#"{
            "order_id": "O1", "symbol": "BTCUSDT",
            "side": "buy", "type": "limit",
            "quantity": 1, "price": 50000,
            "status": "new", "strategy_id": "momentum-1",
            "time_in_force": "GTC", "timestamp": 1722500000000
        }"#;
        let o = parse_order_event(text).unwrap();
        assert_eq!(o.order_id, "O1");
        assert_eq!(o.side, Side::Buy);
        assert_eq!(o.order_type, OrderType::Limit);
        assert_eq!(o.quantity, dec!(1));
        assert_eq!(o.filled_qty, dec!(0));
        assert_eq!(o.status, OrderStatus::New);
        assert_eq!(o.strategy_id.as_deref(), Some("momentum-1"));
    }

    #[test]
    fn parses_fill_event_with_decimal_quantities() {
        let text = r#"{
            "order_id": "O1", "symbol": "BTCUSDT",
            "side": "sell", "type": "market",
            "quantity": "0.40", "filled_qty": "0.40",
            "avg_price": "50010.25", "status": "filled"
        }"#;
        let o = parse_order_event(text).unwrap();
        assert_eq!(o.filled_qty, dec!(0.40));
        assert_eq!(o.avg_fill_price, Some(dec!(50010.25)));
        assert!(o.status.is_terminal());
    }

    #[test]
    fn rejects_unknown_status() {
        let text = r#"{
            "order_id": "O1", "symbol": "BTCUSDT",
            "side": "buy", "type": "limit",
            "quantity": 1, "status": "resting"
        }"#;
        assert!(parse_order_event(text).is_err());
    }

    #[test]
    fn rejects_missing_order_id() {
        let text = r#"{"symbol": "BTCUSDT", "side": "buy", "type": "limit",
                       "quantity": 1, "status": "new"}"#;
        assert!(parse_order_event(text).is_err());
    }
}
