// =============================================================================
// State Store — the single authoritative view of the trading world
// =============================================================================
//
// All event mutation goes through `apply`, which is called from exactly one
// writer task draining the hub's event channel. Every applied event bumps the
// global sequence counter and emits a non-blocking tick on a watch channel.
// The one lifecycle mutation outside `apply` is `evict_confirmed`, driven by
// the session sweeper once every orders-subscribed client has observed a
// terminal order; it serializes on the same lock and the same sequence.
//
// Readers take consistent point-in-time projections: entity maps hold
// `Arc<entity>`, so a snapshot clones pointers under a short read lock and
// shares structure with the live world and with every other snapshot.
//
// Thread safety:
//   - parking_lot::RwLock around the world; writes only from the writer task.
//   - AtomicU64 mirror of the sequence for lock-free cadence checks.
//   - tokio::sync::watch for "state changed" ticks; send never blocks.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::event::{AccountUpdate, Event, OrderUpdate, PositionUpdate, QuoteUpdate, StrategyUpdate};
use crate::metrics;
use crate::projection::{
    AccountState, MarketQuote, Order, Position, Projection, Strategy, ViewFilter,
};
use crate::types::Channel;

/// Terminal orders evicted from the active view are retained here.
const RECENT_FILLS_CAP: usize = 100;

// =============================================================================
// World
// =============================================================================

/// A terminal order awaiting eviction, remembering the sequence at which its
/// terminal status was applied. It stays in the active view until every
/// client subscribed to the orders channel has observed at least that
/// sequence, so no subscriber can skip straight from a live status to the
/// deletion.
struct PendingEviction {
    order_id: String,
    terminal_seq: u64,
}

#[derive(Default)]
struct World {
    sequence: u64,
    market_data: std::collections::BTreeMap<String, Arc<MarketQuote>>,
    orders: std::collections::BTreeMap<String, Arc<Order>>,
    positions: std::collections::BTreeMap<String, Arc<Position>>,
    strategies: std::collections::BTreeMap<String, Arc<Strategy>>,
    account: Option<Arc<AccountState>>,
    /// Terminal orders not yet confirmed as observed by every subscriber.
    pending_evictions: Vec<PendingEviction>,
    /// Most-recent-first ring of evicted terminal orders.
    recent_fills: VecDeque<Arc<Order>>,
}

// =============================================================================
// StateStore
// =============================================================================

pub struct StateStore {
    inner: RwLock<World>,
    /// Lock-free mirror of `World::sequence` for cheap cadence checks.
    sequence: AtomicU64,
    tick_tx: watch::Sender<u64>,
    staleness: ChronoDuration,
}

impl StateStore {
    pub fn new(staleness_ms: u64) -> Self {
        let (tick_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(World::default()),
            sequence: AtomicU64::new(0),
            tick_tx,
            staleness: ChronoDuration::milliseconds(staleness_ms as i64),
        }
    }

    /// Current global sequence without taking the lock.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// A stream of sequence values, one per applied event. Slow subscribers
    /// only ever observe the newest value; the writer never waits on them.
    pub fn subscribe_ticks(&self) -> watch::Receiver<u64> {
        self.tick_tx.subscribe()
    }

    // ── Apply ───────────────────────────────────────────────────────────

    /// Apply one event atomically and return the new sequence.
    ///
    /// Identical-content re-applies still bump the sequence; downstream
    /// deltas come out empty but ticks still fire. Later-arriving events win
    /// by arrival order — the store never reorders.
    pub fn apply(&self, event: Event) -> u64 {
        let mut w = self.inner.write();
        let next_seq = w.sequence + 1;

        match event {
            Event::Quote(q) => Self::upsert_quote(&mut w, q),
            Event::Order(o) => Self::upsert_order(&mut w, o, next_seq),
            Event::Position(p) => Self::upsert_position(&mut w, p),
            Event::Strategy(s) => Self::upsert_strategy(&mut w, s),
            Event::Account(a) => Self::replace_account(&mut w, a),
        }

        w.sequence = next_seq;
        self.sequence.store(next_seq, Ordering::SeqCst);
        drop(w);

        let _ = self.tick_tx.send(next_seq);
        next_seq
    }

    fn upsert_quote(w: &mut World, q: QuoteUpdate) {
        let quote = MarketQuote {
            symbol: q.symbol.clone(),
            last: q.last.normalize(),
            bid: q.bid.normalize(),
            ask: q.ask.normalize(),
            bid_size: q.bid_size.normalize(),
            ask_size: q.ask_size.normalize(),
            volume_24h: q.volume_24h.normalize(),
            updated_at: q.ts,
            bids: q.bids,
            asks: q.asks,
            stale: false,
        };
        w.market_data.insert(q.symbol, Arc::new(quote));
    }

    fn upsert_order(w: &mut World, o: OrderUpdate, seq: u64) {
        let created_at = w
            .orders
            .get(&o.order_id)
            .map(|existing| existing.created_at)
            .unwrap_or(o.ts);

        let terminal = o.status.is_terminal();
        let id = o.order_id.clone();
        let order = Order {
            order_id: o.order_id,
            symbol: o.symbol,
            side: o.side,
            order_type: o.order_type,
            quantity: o.quantity.normalize(),
            price: o.price.map(|p| p.normalize()),
            filled_qty: o.filled_qty.normalize(),
            avg_fill_price: o.avg_fill_price.map(|p| p.normalize()),
            status: o.status,
            strategy_id: o.strategy_id,
            time_in_force: o.time_in_force,
            created_at,
            updated_at: o.ts,
        };
        w.orders.insert(id.clone(), Arc::new(order));

        if terminal {
            // A repeated terminal event refreshes the marker so observation
            // is confirmed against the latest terminal apply.
            w.pending_evictions.retain(|pending| pending.order_id != id);
            w.pending_evictions.push(PendingEviction {
                order_id: id,
                terminal_seq: seq,
            });
        } else {
            // A non-terminal update that arrived after a terminal one wins by
            // arrival order, so the order stays in the active view.
            w.pending_evictions.retain(|pending| pending.order_id != id);
        }
    }

    fn upsert_position(w: &mut World, p: PositionUpdate) {
        if p.quantity.is_zero() {
            // Flat positions are semantically empty; they leave the view.
            w.positions.remove(&p.symbol);
            return;
        }
        let position = Position {
            symbol: p.symbol.clone(),
            side: p.side,
            quantity: p.quantity.normalize(),
            avg_entry_price: p.avg_entry_price.normalize(),
            mark_price: p.mark_price.normalize(),
            unrealized_pnl: p.unrealized_pnl.normalize(),
            realized_pnl: p.realized_pnl.normalize(),
        };
        w.positions.insert(p.symbol, Arc::new(position));
    }

    fn upsert_strategy(w: &mut World, s: StrategyUpdate) {
        let strategy = Strategy {
            id: s.id.clone(),
            name: s.name,
            state: s.state,
            last_signal_time: s.last_signal_time,
            last_signal_summary: s.last_signal_summary,
        };
        w.strategies.insert(s.id, Arc::new(strategy));
    }

    fn replace_account(w: &mut World, a: AccountUpdate) {
        w.account = Some(Arc::new(AccountState {
            total_equity: a.total_equity.normalize(),
            available_balance: a.available_balance.normalize(),
            total_unrealized_pnl: a.total_unrealized_pnl.normalize(),
            total_margin_used: a.total_margin_used.normalize(),
            balances: a.balances,
        }));
    }

    // ── Confirmed eviction ──────────────────────────────────────────────

    /// Evict terminal orders whose terminal status every gating client has
    /// observed, and return how many were evicted.
    ///
    /// `observed_floor` is the minimum observed sequence across clients
    /// subscribed to the orders channel; `None` means no such client is
    /// connected and nothing gates eviction. An order marked terminal at
    /// sequence T leaves the active view only once the floor reaches T, so
    /// every subscriber's diff shows the terminal status before the delete.
    ///
    /// Eviction is a state mutation in its own right: each sweep that
    /// removes anything bumps the sequence once and ticks subscribers so
    /// the next scheduler pass diffs the removal.
    pub fn evict_confirmed(&self, observed_floor: Option<u64>) -> usize {
        let mut w = self.inner.write();
        if w.pending_evictions.is_empty() {
            return 0;
        }

        let floor = observed_floor.unwrap_or(u64::MAX);
        let pending = std::mem::take(&mut w.pending_evictions);
        let (ready, waiting): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|entry| entry.terminal_seq <= floor);
        w.pending_evictions = waiting;

        if ready.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        for entry in &ready {
            if let Some(order) = w.orders.remove(&entry.order_id) {
                debug!(order_id = %entry.order_id, status = %order.status, "terminal order evicted");
                w.recent_fills.push_front(order);
                while w.recent_fills.len() > RECENT_FILLS_CAP {
                    w.recent_fills.pop_back();
                }
                evicted += 1;
            }
        }

        if evicted == 0 {
            return 0;
        }

        w.sequence += 1;
        let seq = w.sequence;
        self.sequence.store(seq, Ordering::SeqCst);
        drop(w);

        let _ = self.tick_tx.send(seq);
        evicted
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Consistent point-in-time projection restricted to `filter`.
    ///
    /// Quotes whose last update is older than the staleness threshold come
    /// out annotated `stale: true` via a copy-on-write replacement; the
    /// stored entity is untouched.
    pub fn snapshot(&self, filter: &ViewFilter) -> Projection {
        let now = Utc::now();
        let w = self.inner.read();

        let mut p = Projection {
            sequence: w.sequence,
            ..Projection::default()
        };

        if filter.allows(Channel::MarketData) {
            for (symbol, quote) in &w.market_data {
                if !filter.symbol_ok(symbol) {
                    continue;
                }
                let quote = if !quote.stale && self.is_stale(quote.updated_at, now) {
                    Arc::new(MarketQuote {
                        stale: true,
                        ..(**quote).clone()
                    })
                } else {
                    quote.clone()
                };
                p.market_data.insert(symbol.clone(), quote);
            }
        }

        if filter.allows(Channel::Orders) {
            for (id, order) in &w.orders {
                if filter.symbol_ok(&order.symbol) {
                    p.orders.insert(id.clone(), order.clone());
                }
            }
        }

        if filter.allows(Channel::Positions) {
            for (symbol, position) in &w.positions {
                if filter.symbol_ok(symbol) {
                    p.positions.insert(symbol.clone(), position.clone());
                }
            }
        }

        if filter.allows(Channel::Strategies) {
            for (id, strategy) in &w.strategies {
                p.strategies.insert(id.clone(), strategy.clone());
            }
        }

        if filter.allows(Channel::Account) {
            p.account = w.account.clone();
        }

        p
    }

    fn is_stale(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(updated_at) > self.staleness
    }

    // ── Auxiliary reads ─────────────────────────────────────────────────

    /// Most-recent-first slice of the recent-fills ring.
    pub fn recent_fills(&self, limit: usize) -> Vec<Arc<Order>> {
        let w = self.inner.read();
        w.recent_fills.iter().take(limit).cloned().collect()
    }

    /// Full JSON dump of the world for the diagnostics endpoint.
    pub fn debug_dump(&self) -> serde_json::Value {
        let projection = self.snapshot(&ViewFilter::default());
        let fills = self.recent_fills(RECENT_FILLS_CAP);
        serde_json::json!({
            "sequence": projection.sequence,
            "state": projection,
            "recent_fills": fills,
        })
    }
}

// =============================================================================
// Writer task
// =============================================================================

/// Drain the event channel into the store. This is the process's single
/// writer; it exits when every adapter sender is gone, which is how shutdown
/// drains buffered events before the grace deadline cuts it off.
pub async fn run_writer(store: Arc<StateStore>, mut rx: mpsc::Receiver<Event>) {
    info!("state writer started");
    while let Some(event) = rx.recv().await {
        let domain = event.domain();
        let seq = store.apply(event);
        metrics::event_applied(domain);
        tracing::trace!(sequence = seq, domain, "event applied");
    }
    info!("event channel closed — state writer exiting");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, OrderType, PositionSide, Side};
    use rust_decimal_macros::dec;

    fn quote_event(symbol: &str, last: rust_decimal::Decimal) -> Event {
        Event::Quote(QuoteUpdate {
            symbol: symbol.to_string(),
            ts: Utc::now(),
            last,
            bid: last - dec!(1),
            ask: last + dec!(1),
            bid_size: dec!(1),
            ask_size: dec!(1),
            volume_24h: dec!(100),
            bids: vec![],
            asks: vec![],
        })
    }

    fn order_event(id: &str, status: OrderStatus, filled: rust_decimal::Decimal) -> Event {
        Event::Order(OrderUpdate {
            order_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            price: Some(dec!(50000)),
            filled_qty: filled,
            avg_fill_price: None,
            status,
            strategy_id: None,
            time_in_force: Some("GTC".to_string()),
            ts: Utc::now(),
        })
    }

    #[test]
    fn apply_bumps_sequence_strictly() {
        let store = StateStore::new(5_000);
        let s1 = store.apply(quote_event("BTCUSDT", dec!(50000)));
        let s2 = store.apply(quote_event("BTCUSDT", dec!(50010)));
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(store.sequence(), 2);
    }

    #[test]
    fn identical_reapply_bumps_sequence_but_not_content() {
        let store = StateStore::new(5_000);
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        let before = store.snapshot(&ViewFilter::default());
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        let after = store.snapshot(&ViewFilter::default());
        assert_eq!(after.sequence, before.sequence + 1);
        assert_eq!(
            before.market_data["BTCUSDT"].last,
            after.market_data["BTCUSDT"].last
        );
    }

    #[test]
    fn snapshot_respects_channel_and_symbol_filter() {
        let store = StateStore::new(5_000);
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        store.apply(quote_event("ETHUSDT", dec!(3000)));
        store.apply(order_event("O1", OrderStatus::New, dec!(0)));

        let filter = ViewFilter::new([Channel::MarketData])
            .with_symbols(vec!["ETHUSDT".to_string()]);
        let p = store.snapshot(&filter);
        assert_eq!(p.market_data.len(), 1);
        assert!(p.market_data.contains_key("ETHUSDT"));
        assert!(p.orders.is_empty());
        assert!(p.account.is_none());
    }

    #[test]
    fn terminal_order_outlives_unrelated_applies_until_confirmed() {
        let store = StateStore::new(5_000);
        store.apply(order_event("O1", OrderStatus::New, dec!(0)));
        let terminal_seq = store.apply(order_event("O1", OrderStatus::Filled, dec!(1)));

        // A burst of unrelated applies must not dislodge the terminal order
        // while a subscriber has yet to observe it.
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        store.apply(quote_event("BTCUSDT", dec!(50010)));
        store.apply(quote_event("ETHUSDT", dec!(3000)));

        let p = store.snapshot(&ViewFilter::default());
        assert_eq!(p.orders["O1"].status, OrderStatus::Filled);

        // A client still behind the terminal sequence gates eviction.
        assert_eq!(store.evict_confirmed(Some(terminal_seq - 1)), 0);
        assert_eq!(
            store.snapshot(&ViewFilter::default()).orders["O1"].status,
            OrderStatus::Filled
        );

        // Once every subscriber has observed the terminal apply, it goes.
        assert_eq!(store.evict_confirmed(Some(terminal_seq)), 1);
        assert!(store.snapshot(&ViewFilter::default()).orders.is_empty());

        let fills = store.recent_fills(10);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, "O1");
        assert_eq!(fills[0].status, OrderStatus::Filled);
    }

    #[test]
    fn eviction_without_subscribers_is_unguarded() {
        let store = StateStore::new(5_000);
        store.apply(order_event("O1", OrderStatus::Canceled, dec!(0)));

        // No orders-subscribed client connected: nothing gates eviction.
        assert_eq!(store.evict_confirmed(None), 1);
        assert!(store.snapshot(&ViewFilter::default()).orders.is_empty());
        assert_eq!(store.recent_fills(10)[0].status, OrderStatus::Canceled);
    }

    #[test]
    fn eviction_bumps_sequence_and_diffs_as_delete() {
        let store = StateStore::new(5_000);
        store.apply(order_event("O1", OrderStatus::Filled, dec!(1)));

        let before = store.snapshot(&ViewFilter::default());
        assert_eq!(store.evict_confirmed(None), 1);
        let after = store.snapshot(&ViewFilter::default());

        assert_eq!(after.sequence, before.sequence + 1);
        let changes = crate::differ::diff(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path.collection, Channel::Orders);
        assert_eq!(changes[0].path.key, "O1");
        assert!(matches!(changes[0].op, crate::differ::ChangeOp::Delete));
    }

    #[test]
    fn idle_sweep_does_not_bump_sequence() {
        let store = StateStore::new(5_000);
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        let seq = store.sequence();
        assert_eq!(store.evict_confirmed(None), 0);
        assert_eq!(store.sequence(), seq);
    }

    #[test]
    fn late_non_terminal_update_wins_by_arrival_order() {
        let store = StateStore::new(5_000);
        store.apply(order_event("O1", OrderStatus::Filled, dec!(1)));
        store.apply(order_event("O1", OrderStatus::PartiallyFilled, dec!(0.4)));

        // The eviction marker was cancelled; even an unguarded sweep leaves
        // the order active.
        assert_eq!(store.evict_confirmed(None), 0);
        let p = store.snapshot(&ViewFilter::default());
        assert_eq!(p.orders["O1"].status, OrderStatus::PartiallyFilled);
        assert!(store.recent_fills(10).is_empty());
    }

    #[test]
    fn stale_quotes_are_annotated_not_removed() {
        let store = StateStore::new(5_000);
        let mut update = match quote_event("BTCUSDT", dec!(50000)) {
            Event::Quote(q) => q,
            _ => unreachable!(),
        };
        update.ts = Utc::now() - ChronoDuration::seconds(30);
        store.apply(Event::Quote(update));

        let p = store.snapshot(&ViewFilter::default());
        let quote = &p.market_data["BTCUSDT"];
        assert!(quote.stale);
        assert_eq!(quote.last, dec!(50000));
    }

    #[test]
    fn fresh_quote_is_not_stale() {
        let store = StateStore::new(5_000);
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        let p = store.snapshot(&ViewFilter::default());
        assert!(!p.market_data["BTCUSDT"].stale);
    }

    #[test]
    fn flat_position_leaves_the_view() {
        let store = StateStore::new(5_000);
        store.apply(Event::Position(PositionUpdate {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            avg_entry_price: dec!(48000),
            mark_price: dec!(50000),
            unrealized_pnl: dec!(1000),
            realized_pnl: dec!(0),
        }));
        assert_eq!(store.snapshot(&ViewFilter::default()).positions.len(), 1);

        store.apply(Event::Position(PositionUpdate {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Flat,
            quantity: dec!(0),
            avg_entry_price: dec!(0),
            mark_price: dec!(50000),
            unrealized_pnl: dec!(0),
            realized_pnl: dec!(150),
        }));
        assert!(store.snapshot(&ViewFilter::default()).positions.is_empty());
    }

    #[test]
    fn account_replace_is_wholesale() {
        let store = StateStore::new(5_000);
        store.apply(Event::Account(AccountUpdate {
            total_equity: dec!(10000),
            available_balance: dec!(8000),
            total_unrealized_pnl: dec!(0),
            total_margin_used: dec!(2000),
            balances: vec![],
        }));
        store.apply(Event::Account(AccountUpdate {
            total_equity: dec!(10500),
            available_balance: dec!(8500),
            total_unrealized_pnl: dec!(500),
            total_margin_used: dec!(2000),
            balances: vec![],
        }));
        let p = store.snapshot(&ViewFilter::default());
        assert_eq!(p.account.as_ref().unwrap().total_equity, dec!(10500));
    }

    #[test]
    fn decimals_are_normalized_on_ingest() {
        let store = StateStore::new(5_000);
        store.apply(quote_event("BTCUSDT", dec!(50000.00)));
        let p = store.snapshot(&ViewFilter::default());
        let json = serde_json::to_value(&p.market_data["BTCUSDT"]).unwrap();
        assert_eq!(json["last"], "50000");
    }

    #[test]
    fn order_created_at_is_preserved_across_updates() {
        let store = StateStore::new(5_000);
        store.apply(order_event("O1", OrderStatus::New, dec!(0)));
        let created = store.snapshot(&ViewFilter::default()).orders["O1"].created_at;
        store.apply(order_event("O1", OrderStatus::PartiallyFilled, dec!(0.4)));
        let p = store.snapshot(&ViewFilter::default());
        assert_eq!(p.orders["O1"].created_at, created);
        assert!(p.orders["O1"].updated_at >= created);
    }

    #[tokio::test]
    async fn ticks_carry_the_latest_sequence() {
        let store = StateStore::new(5_000);
        let mut ticks = store.subscribe_ticks();
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        store.apply(quote_event("BTCUSDT", dec!(50010)));
        ticks.changed().await.unwrap();
        assert_eq!(*ticks.borrow(), 2);
    }
}
