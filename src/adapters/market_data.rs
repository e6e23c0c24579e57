// =============================================================================
// Market-data adapter — Redis pub/sub quote bus
// =============================================================================
//
// Subscribes to the topic-per-symbol channels on the platform's
// Redis-compatible bus and normalizes quote messages into `Event::Quote`.
//
// Expected payload shape:
// ```json
// {
//   "symbol": "BTCUSDT", "timestamp": 1722500000000,
//   "last": 50000, "bid": 49999, "ask": 50001,
//   "bid_size": 1.5, "ask_size": 2.0, "volume": 1234.5,
//   "bids": [[49999, 1.5], [49998, 3.0]],
//   "asks": [[50001, 2.0]]
// }
// ```
// Unknown fields are discarded; malformed payloads are logged and skipped.
// =============================================================================

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{AdapterError, AdapterHandle, BOOK_DEPTH};
use crate::event::{BookLevel, Event, QuoteUpdate};

pub struct MarketDataAdapter {
    pub redis_url: String,
    pub pattern: String,
}

impl MarketDataAdapter {
    pub async fn run(
        &self,
        tx: &mpsc::Sender<Event>,
        handle: &AdapterHandle,
    ) -> Result<(), AdapterError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| AdapterError::Fatal(format!("invalid redis url: {e}")))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("failed to connect to market-data bus")?;
        pubsub
            .psubscribe(&self.pattern)
            .await
            .context("failed to subscribe to quote channels")?;

        info!(url = %self.redis_url, pattern = %self.pattern, "market-data bus connected");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "non-text quote payload — skipped");
                    handle.mark_malformed();
                    continue;
                }
            };

            match parse_quote(&payload) {
                Ok(update) => {
                    handle.mark_message();
                    if tx.send(Event::Quote(update)).await.is_err() {
                        // Hub is shutting down.
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "malformed quote message — skipped");
                    handle.mark_malformed();
                }
            }
        }

        warn!(pattern = %self.pattern, "market-data bus stream ended");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QuoteWire {
    symbol: String,
    timestamp: i64,
    last: Decimal,
    bid: Decimal,
    ask: Decimal,
    bid_size: Decimal,
    ask_size: Decimal,
    volume: Decimal,
    #[serde(default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    asks: Vec<(Decimal, Decimal)>,
}

fn parse_quote(text: &str) -> anyhow::Result<QuoteUpdate> {
    let wire: QuoteWire = serde_json::from_str(text).context("failed to parse quote JSON")?;

    let ts = DateTime::<Utc>::from_timestamp_millis(wire.timestamp)
        .context("quote timestamp out of range")?;

    let ladder = |levels: Vec<(Decimal, Decimal)>| {
        levels
            .into_iter()
            .take(BOOK_DEPTH)
            .map(|(price, size)| BookLevel { price, size })
            .collect()
    };

    Ok(QuoteUpdate {
        symbol: wire.symbol,
        ts,
        last: wire.last,
        bid: wire.bid,
        ask: wire.ask,
        bid_size: wire.bid_size,
        ask_size: wire.ask_size,
        volume_24h: wire.volume,
        bids: ladder(wire.bids),
        asks: ladder(wire.asks),
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
    fn parses_full_quote_message() {
        let text = r#"{
            "symbol": "BTCUSDT", "timestamp": 1722500000000,
            "last": 50000, "bid": 49999, "ask": 50001,
            "bid_size": 1.5, "ask_size": 2.0, "volume": 1234.5,
            "bids": [[49999, 1.5], [49998, 3.0]],
            "asks": [[50001, 2.0]]
        }"#;
        let q = parse_quote(text).unwrap();
        assert_eq!(q.symbol, "BTCUSDT");
        assert_eq!(q.last, dec!(50000));
        assert_eq!(q.bid_size, dec!(1.5));
        assert_eq!(q.bids.len(), 2);
        assert_eq!(q.bids[0].price, dec!(49999));
        assert_eq!(q.ts.timestamp_millis(), 1722500000000);
    }

    #[test]
    fn string_prices_parse_exactly() {
        let text = r#"{
            "symbol": "ETHUSDT", "timestamp": 1722500000000,
            "last": "3000.10", "bid": "2999.95", "ask": "3000.25",
            "bid_size": "4", "ask_size": "7", "volume": "98765.4321"
        }"#;
        let q = parse_quote(text).unwrap();
        assert_eq!(q.last, dec!(3000.10));
        assert_eq!(q.volume_24h, dec!(98765.4321));
        assert!(q.bids.is_empty());
    }

    #[test]
    fn unknown_fields_are_discarded() {
        let text = r#"{
            "symbol": "BTCUSDT", "timestamp": 1722500000000,
            "last": 1, "bid": 1, "ask": 1,
            "bid_size": 1, "ask_size": 1, "volume": 1,
            "exchange_specific": {"foo": true}
        }"#;
        assert!(parse_quote(text).is_ok());
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(parse_quote("not json").is_err());
        assert!(parse_quote(r#"{"symbol": "BTCUSDT"}"#).is_err());
    }

    #[test]
    fn ladders_truncate_to_book_depth() {
        let levels: Vec<String> = (0..25)
            .map(|i| format!("[{}, 1]", 50000 - i))
            .collect();
        let text = format!(
            r#"{{"symbol": "BTCUSDT", "timestamp": 1722500000000,
                "last": 1, "bid": 1, "ask": 1,
                "bid_size": 1, "ask_size": 1, "volume": 1,
                "bids": [{}], "asks": []}}"#,
            levels.join(",")
        );
        let q = parse_quote(&text).unwrap();
        assert_eq!(q.bids.len(), BOOK_DEPTH);
    }
}
