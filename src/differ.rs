// =============================================================================
// Differ — ordered field-level changes between two projections
// =============================================================================
//
// `diff(old, new)` walks the five collections in their fixed wire order and
// each collection's keys in natural (BTreeMap) order, so the same pair of
// projections always yields the same ordered output.
//
// Change records:
//   set    {op: "set",    path: [collection, key] or [collection, key, field], value}
//   delete {op: "delete", path: [collection, key]}
//
// A key present only in `new` produces one full-entity set; a key present
// only in `old` produces one delete; a key in both is compared field by
// field. Decimal values compare by normalized value, so trailing zeros never
// produce a change.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

use crate::projection::{AccountState, MarketQuote, Order, Position, Projection, Strategy};
use crate::types::Channel;

/// Singleton key used for account-channel paths.
const ACCOUNT_KEY: &str = "account";

// =============================================================================
// Change records
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    Set(Value),
    Delete,
}

/// Structured path: collection, entity key, optional field name.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePath {
    pub collection: Channel,
    pub key: String,
    pub field: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: ChangePath,
    pub op: ChangeOp,
}

impl Change {
    fn set(collection: Channel, key: &str, field: Option<&'static str>, value: Value) -> Self {
        Self {
            path: ChangePath {
                collection,
                key: key.to_string(),
                field,
            },
            op: ChangeOp::Set(value),
        }
    }

    fn delete(collection: Channel, key: &str) -> Self {
        Self {
            path: ChangePath {
                collection,
                key: key.to_string(),
                field: None,
            },
            op: ChangeOp::Delete,
        }
    }

    fn path_segments(&self) -> Vec<&str> {
        let mut segments = vec![self.path.collection.as_str(), self.path.key.as_str()];
        if let Some(field) = self.path.field {
            segments.push(field);
        }
        segments
    }
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Explicit entry counts keep the encoding valid for MessagePack,
        // which needs map lengths up front.
        match &self.op {
            ChangeOp::Set(value) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("op", "set")?;
                map.serialize_entry("path", &self.path_segments())?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            ChangeOp::Delete => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("op", "delete")?;
                map.serialize_entry("path", &self.path_segments())?;
                map.end()
            }
        }
    }
}

// =============================================================================
// Field tables
// =============================================================================

fn val<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn val_dec(d: &Decimal) -> Value {
    Value::String(d.normalize().to_string())
}

fn val_dec_opt(d: &Option<Decimal>) -> Value {
    match d {
        Some(d) => val_dec(d),
        None => Value::Null,
    }
}

fn val_ts(ts: &DateTime<Utc>) -> Value {
    val(ts)
}

fn quote_fields(q: &MarketQuote) -> Vec<(&'static str, Value)> {
    vec![
        ("last", val_dec(&q.last)),
        ("bid", val_dec(&q.bid)),
        ("ask", val_dec(&q.ask)),
        ("bid_size", val_dec(&q.bid_size)),
        ("ask_size", val_dec(&q.ask_size)),
        ("volume_24h", val_dec(&q.volume_24h)),
        ("updated_at", val_ts(&q.updated_at)),
        ("bids", val(&q.bids)),
        ("asks", val(&q.asks)),
        ("stale", Value::Bool(q.stale)),
    ]
}

fn order_fields(o: &Order) -> Vec<(&'static str, Value)> {
    vec![
        ("symbol", Value::String(o.symbol.clone())),
        ("side", val(&o.side)),
        ("order_type", val(&o.order_type)),
        ("quantity", val_dec(&o.quantity)),
        ("price", val_dec_opt(&o.price)),
        ("filled_qty", val_dec(&o.filled_qty)),
        ("avg_fill_price", val_dec_opt(&o.avg_fill_price)),
        ("status", val(&o.status)),
        ("strategy_id", val(&o.strategy_id)),
        ("time_in_force", val(&o.time_in_force)),
        ("created_at", val_ts(&o.created_at)),
        ("updated_at", val_ts(&o.updated_at)),
    ]
}

fn position_fields(p: &Position) -> Vec<(&'static str, Value)> {
    vec![
        ("side", val(&p.side)),
        ("quantity", val_dec(&p.quantity)),
        ("avg_entry_price", val_dec(&p.avg_entry_price)),
        ("mark_price", val_dec(&p.mark_price)),
        ("unrealized_pnl", val_dec(&p.unrealized_pnl)),
        ("realized_pnl", val_dec(&p.realized_pnl)),
    ]
}

fn strategy_fields(s: &Strategy) -> Vec<(&'static str, Value)> {
    vec![
        ("name", Value::String(s.name.clone())),
        ("state", val(&s.state)),
        ("last_signal_time", val(&s.last_signal_time)),
        ("last_signal_summary", val(&s.last_signal_summary)),
    ]
}

fn account_fields(a: &AccountState) -> Vec<(&'static str, Value)> {
    vec![
        ("total_equity", val_dec(&a.total_equity)),
        ("available_balance", val_dec(&a.available_balance)),
        ("total_unrealized_pnl", val_dec(&a.total_unrealized_pnl)),
        ("total_margin_used", val_dec(&a.total_margin_used)),
        ("balances", val(&a.balances)),
    ]
}

// =============================================================================
// Diff
// =============================================================================

/// Ordered list of changes taking `old` to `new`.
pub fn diff(old: &Projection, new: &Projection) -> Vec<Change> {
    let mut changes = Vec::new();

    diff_collection(
        &mut changes,
        Channel::MarketData,
        &old.market_data,
        &new.market_data,
        quote_fields,
    );
    diff_collection(
        &mut changes,
        Channel::Orders,
        &old.orders,
        &new.orders,
        order_fields,
    );
    diff_collection(
        &mut changes,
        Channel::Positions,
        &old.positions,
        &new.positions,
        position_fields,
    );
    diff_collection(
        &mut changes,
        Channel::Strategies,
        &old.strategies,
        &new.strategies,
        strategy_fields,
    );
    diff_singleton(
        &mut changes,
        Channel::Account,
        old.account.as_deref(),
        new.account.as_deref(),
        account_fields,
    );

    changes
}

fn diff_collection<T: Serialize>(
    changes: &mut Vec<Change>,
    collection: Channel,
    old: &BTreeMap<String, Arc<T>>,
    new: &BTreeMap<String, Arc<T>>,
    fields: fn(&T) -> Vec<(&'static str, Value)>,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        match (old.get(key), new.get(key)) {
            (Some(before), Some(after)) => {
                // Pointer equality means the entity was not replaced.
                if Arc::ptr_eq(before, after) {
                    continue;
                }
                diff_fields(changes, collection, key, &fields(before), &fields(after));
            }
            (Some(_), None) => changes.push(Change::delete(collection, key)),
            (None, Some(after)) => {
                changes.push(Change::set(collection, key, None, val(after.as_ref())));
            }
            (None, None) => unreachable!("key came from one of the two maps"),
        }
    }
}

fn diff_singleton<T: Serialize>(
    changes: &mut Vec<Change>,
    collection: Channel,
    old: Option<&T>,
    new: Option<&T>,
    fields: fn(&T) -> Vec<(&'static str, Value)>,
) {
    match (old, new) {
        (Some(before), Some(after)) => {
            diff_fields(
                changes,
                collection,
                ACCOUNT_KEY,
                &fields(before),
                &fields(after),
            );
        }
        (Some(_), None) => changes.push(Change::delete(collection, ACCOUNT_KEY)),
        (None, Some(after)) => {
            changes.push(Change::set(collection, ACCOUNT_KEY, None, val(after)));
        }
        (None, None) => {}
    }
}

fn diff_fields(
    changes: &mut Vec<Change>,
    collection: Channel,
    key: &str,
    before: &[(&'static str, Value)],
    after: &[(&'static str, Value)],
) {
    debug_assert_eq!(before.len(), after.len());
    for ((name, old_value), (_, new_value)) in before.iter().zip(after.iter()) {
        if old_value != new_value {
            changes.push(Change::set(collection, key, Some(name), new_value.clone()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
