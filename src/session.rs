// =============================================================================
// Client Registry & Scheduler
// =============================================================================
//
// One `ClientSession` per WebSocket connection, owned by the registry for the
// connection's lifetime. Each session runs its own scheduler task at the
// cadence chosen by client type at handshake:
//
//   1. Take a store snapshot under the session's filter.
//   2. No last-sent projection (or resync flagged) → snapshot frame.
//   3. Otherwise diff against last-sent: empty → nothing; oversized → fresh
//      snapshot; else delta frame.
//
// Outbound frames go through a bounded queue to the socket writer. A full
// queue drops the frame and flags the session for resync — the client
// recovers by skipping missed deltas, never by replay — so the scheduler is
// never blocked by a slow socket.
//
// Session fields are mutated only by the session's own scheduler and IO
// loops; other tasks (registry overview, health endpoint) only read.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::protocol::ServerMessage;
use crate::differ::{diff, Change};
use crate::metrics;
use crate::projection::{Projection, ViewFilter};
use crate::state_store::StateStore;
use crate::types::{Channel, ClientKind, WireFormat};

// =============================================================================
// ClientSession
// =============================================================================

pub struct ClientSession {
    pub id: Uuid,
    pub user_tag: Option<String>,
    pub kind: ClientKind,
    pub format: WireFormat,
    pub connected_at: Instant,
    filter: RwLock<ViewFilter>,
    /// Next outbound frame must be a snapshot (queue overflow or
    /// subscription change).
    resync_required: AtomicBool,
    /// Highest store sequence this session's scheduler has either delivered
    /// or confirmed it had nothing to deliver for. Terminal-order eviction
    /// waits for every orders-subscribed session to pass the terminal
    /// sequence.
    observed_seq: AtomicU64,
    last_pong: RwLock<Instant>,
}

impl ClientSession {
    pub fn new(kind: ClientKind, format: WireFormat, user_tag: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_tag,
            kind,
            format,
            connected_at: Instant::now(),
            filter: RwLock::new(ViewFilter::default()),
            resync_required: AtomicBool::new(false),
            observed_seq: AtomicU64::new(0),
            last_pong: RwLock::new(Instant::now()),
        }
    }

    pub fn filter(&self) -> ViewFilter {
        self.filter.read().clone()
    }

    /// Apply a subscribe control message. Any subscription change forces the
    /// next outbound frame to be a snapshot under the new filter.
    pub fn subscribe(&self, channels: &[Channel], symbols: &[String]) {
        self.filter.write().subscribe(channels, symbols);
        self.force_resync();
    }

    pub fn unsubscribe(&self, channels: &[Channel]) {
        self.filter.write().unsubscribe(channels);
        self.force_resync();
    }

    pub fn force_resync(&self) {
        self.resync_required.store(true, Ordering::SeqCst);
    }

    /// Consume the resync flag. The caller re-arms it if the snapshot it
    /// owes could not be enqueued.
    pub fn take_resync(&self) -> bool {
        self.resync_required.swap(false, Ordering::SeqCst)
    }

    /// Record that this session's view is accounted for up to `seq`: either
    /// a frame at that sequence was enqueued, or the tick found nothing to
    /// send (the filtered view already matched).
    pub fn mark_observed(&self, seq: u64) {
        self.observed_seq.fetch_max(seq, Ordering::SeqCst);
    }

    pub fn observed_sequence(&self) -> u64 {
        self.observed_seq.load(Ordering::SeqCst)
    }

    pub fn touch_pong(&self) {
        *self.last_pong.write() = Instant::now();
    }

    pub fn pong_age(&self) -> Duration {
        self.last_pong.read().elapsed()
    }
}

// =============================================================================
// ClientRegistry
// =============================================================================

/// Summary row for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_tag: Option<String>,
    pub kind: ClientKind,
    pub format: WireFormat,
    pub connected_secs: u64,
}

/// Tracks every connected client.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.write();
        sessions.insert(session.id, session);
        metrics::clients_connected(sessions.len());
    }

    pub fn remove(&self, id: Uuid) {
        let mut sessions = self.sessions.write();
        if sessions.remove(&id).is_some() {
            metrics::clients_connected(sessions.len());
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn overview(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                user_tag: s.user_tag.clone(),
                kind: s.kind,
                format: s.format,
                connected_secs: s.connected_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Minimum observed sequence across sessions subscribed to `channel`.
    /// `None` when no connected session subscribes to it.
    pub fn min_observed(&self, channel: Channel) -> Option<u64> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.filter.read().allows(channel))
            .map(|s| s.observed_sequence())
            .min()
    }
}

// =============================================================================
// Tick planning
// =============================================================================

#[derive(Debug)]
pub enum TickPlan {
    Snapshot(Projection),
    Delta(Projection, Vec<Change>),
}

/// Decide what one scheduler tick owes the client, if anything.
///
/// The override ratio compares serialized sizes: when a delta would not be
/// meaningfully smaller than a fresh snapshot, the snapshot wins.
pub fn plan_tick(
    last_sent: Option<&Projection>,
    current: Projection,
    resync: bool,
    override_ratio: f64,
) -> Option<TickPlan> {
    let last = match last_sent {
        None => return Some(TickPlan::Snapshot(current)),
        Some(_) if resync => return Some(TickPlan::Snapshot(current)),
        Some(last) => last,
    };

    let changes = diff(last, &current);
    if changes.is_empty() {
        return None;
    }

    let delta_len = serialized_len(&changes);
    let snapshot_len = serialized_len(&current);
    if (delta_len as f64) > override_ratio * (snapshot_len as f64) {
        Some(TickPlan::Snapshot(current))
    } else {
        Some(TickPlan::Delta(current, changes))
    }
}

fn serialized_len<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Outcome of offering a frame to the session's bounded queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    Sent,
    Dropped,
    Disconnected,
}

/// Non-blocking enqueue with the slow-consumer policy applied: a full queue
/// drops the frame and re-arms the resync flag.
pub fn try_enqueue(
    session: &ClientSession,
    tx: &mpsc::Sender<ServerMessage>,
    msg: ServerMessage,
) -> Enqueue {
    match tx.try_send(msg) {
        Ok(()) => Enqueue::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => {
            session.force_resync();
            metrics::frame_dropped();
            metrics::resync();
            Enqueue::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Disconnected,
    }
}

// =============================================================================
// Scheduler loop
// =============================================================================

/// Per-client cadence loop. Runs until the outbound queue closes or the
/// connection task aborts it.
pub async fn run_scheduler(
    session: Arc<ClientSession>,
    store: Arc<StateStore>,
    tx: mpsc::Sender<ServerMessage>,
    refresh: Duration,
    override_ratio: f64,
) {
    let mut ticker = interval(refresh);
    // A stalled tick must not be made up with a burst; cadence is a floor.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_sent: Option<Projection> = None;
    let mut last_seen_seq: u64 = u64::MAX;

    loop {
        ticker.tick().await;

        let resync = session.take_resync();
        if !resync && last_sent.is_some() && store.sequence() == last_seen_seq {
            continue;
        }

        let started = Instant::now();
        let filter = session.filter();
        let current = store.snapshot(&filter);
        let current_seq = current.sequence;
        last_seen_seq = current_seq;

        let Some(plan) = plan_tick(last_sent.as_ref(), current, resync, override_ratio) else {
            // Nothing to send: the filtered view already matches this
            // sequence, which counts as having observed it.
            session.mark_observed(current_seq);
            continue;
        };

        let (msg, projection) = match plan {
            TickPlan::Snapshot(projection) => (
                ServerMessage::Snapshot {
                    sequence: projection.sequence,
                    data: projection.clone(),
                },
                projection,
            ),
            TickPlan::Delta(projection, changes) => (
                ServerMessage::Delta {
                    sequence: projection.sequence,
                    data: changes,
                },
                projection,
            ),
        };

        let kind = msg.kind();
        match try_enqueue(&session, &tx, msg) {
            Enqueue::Sent => {
                session.mark_observed(projection.sequence);
                last_sent = Some(projection);
                metrics::frame_sent(kind);
                metrics::tick_latency(started.elapsed().as_secs_f64());
            }
            Enqueue::Dropped => {
                // last_sent stays put; the owed snapshot goes out once the
                // queue has room again.
                warn!(client = %session.id, "outbound queue full — frame dropped, resync pending");
            }
            Enqueue::Disconnected => {
                debug!(client = %session.id, "outbound queue closed — scheduler exiting");
                break;
            }
        }
    }
}

// =============================================================================
// Eviction sweeper
// =============================================================================

/// Periodic sweep evicting terminal orders once every orders-subscribed
/// client has observed their terminal sequence. Runs at the fastest client
/// cadence, so for each client the delete lands on the tick after the one
/// that showed the terminal status.
pub async fn run_eviction_sweeper(
    store: Arc<StateStore>,
    registry: Arc<ClientRegistry>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let floor = registry.min_observed(Channel::Orders);
        let evicted = store.evict_confirmed(floor);
        if evicted > 0 {
            debug!(evicted, "terminal orders evicted after client confirmation");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, OrderUpdate, QuoteUpdate};
    use crate::types::{OrderStatus, OrderType, Side};
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn fixed_ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn order_event(id: &str, status: OrderStatus) -> Event {
        Event::Order(OrderUpdate {
            order_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            price: Some(dec!(50000)),
            filled_qty: dec!(0),
            avg_fill_price: None,
            status,
            strategy_id: None,
            time_in_force: None,
            ts: fixed_ts(),
        })
    }

    fn quote_event(symbol: &str, last: rust_decimal::Decimal) -> Event {
        Event::Quote(QuoteUpdate {
            symbol: symbol.to_string(),
            ts: fixed_ts(),
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

    /// Several symbols, so a one-quote delta is far smaller than a snapshot.
    fn store_with_quotes() -> Arc<StateStore> {
        let store = Arc::new(StateStore::new(60_000));
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        store.apply(quote_event("ETHUSDT", dec!(3000)));
        store.apply(quote_event("SOLUSDT", dec!(150)));
        store
    }

    fn session() -> ClientSession {
        ClientSession::new(ClientKind::Web, WireFormat::Json, None)
    }

    #[test]
    fn first_tick_plans_snapshot() {
        let store = store_with_quotes();
        let current = store.snapshot(&ViewFilter::default());
        match plan_tick(None, current, false, 0.5) {
            Some(TickPlan::Snapshot(p)) => assert_eq!(p.sequence, 3),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_state_plans_nothing() {
        let store = store_with_quotes();
        let first = store.snapshot(&ViewFilter::default());
        // Identical re-apply: sequence advances, content does not.
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        let second = store.snapshot(&ViewFilter::default());
        assert_eq!(second.sequence, first.sequence + 1);
        assert!(plan_tick(Some(&first), second, false, 0.5).is_none());
    }

    #[test]
    fn small_change_plans_delta() {
        let store = store_with_quotes();
        let first = store.snapshot(&ViewFilter::default());
        store.apply(quote_event("BTCUSDT", dec!(50010)));
        let second = store.snapshot(&ViewFilter::default());
        match plan_tick(Some(&first), second, false, 0.5) {
            Some(TickPlan::Delta(p, changes)) => {
                assert_eq!(p.sequence, 4);
                // last, bid and ask move together; nothing else does.
                assert_eq!(changes.len(), 3);
                assert!(changes.iter().any(|c| c.path.field == Some("last")));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn resync_plans_snapshot_even_without_changes() {
        let store = store_with_quotes();
        let first = store.snapshot(&ViewFilter::default());
        let second = store.snapshot(&ViewFilter::default());
        match plan_tick(Some(&first), second, true, 0.5) {
            Some(TickPlan::Snapshot(_)) => {}
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn oversized_delta_becomes_snapshot() {
        let store = store_with_quotes();
        let first = store.snapshot(&ViewFilter::default());
        store.apply(quote_event("BTCUSDT", dec!(51234.5)));
        let second = store.snapshot(&ViewFilter::default());
        // A tiny ratio makes any non-empty delta "too large".
        match plan_tick(Some(&first), second, false, 0.0001) {
            Some(TickPlan::Snapshot(_)) => {}
            other => panic!("expected snapshot override, got {other:?}"),
        }
    }

    #[test]
    fn subscription_change_arms_resync() {
        let s = session();
        assert!(!s.take_resync());
        s.subscribe(&[Channel::Orders], &[]);
        assert!(s.take_resync());
        assert!(!s.take_resync());

        s.unsubscribe(&[Channel::Orders]);
        assert!(s.take_resync());
    }

    #[test]
    fn filter_updates_apply_to_session() {
        let s = session();
        s.subscribe(&[Channel::MarketData], &["ETHUSDT".to_string()]);
        let f = s.filter();
        assert!(f.symbol_ok("ETHUSDT"));
        assert!(!f.symbol_ok("BTCUSDT"));
    }

    #[test]
    fn registry_tracks_sessions() {
        let registry = ClientRegistry::new();
        let s = Arc::new(session());
        let id = s.id;
        registry.register(s);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.overview().len(), 1);
        registry.remove(id);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn slow_client_gates_eviction_across_unrelated_applies() {
        let store = StateStore::new(60_000);
        let registry = ClientRegistry::new();
        let s = Arc::new(session());
        registry.register(s.clone());

        store.apply(order_event("O1", OrderStatus::New));
        let terminal_seq = store.apply(order_event("O1", OrderStatus::Filled));

        // Unrelated market data keeps applying while the client is between
        // ticks; the terminal order must survive every sweep.
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        store.apply(quote_event("BTCUSDT", dec!(50010)));
        assert_eq!(
            store.evict_confirmed(registry.min_observed(Channel::Orders)),
            0
        );

        // Observing a pre-terminal sequence is not enough.
        s.mark_observed(terminal_seq - 1);
        assert_eq!(
            store.evict_confirmed(registry.min_observed(Channel::Orders)),
            0
        );
        assert_eq!(
            store.snapshot(&ViewFilter::default()).orders["O1"].status,
            OrderStatus::Filled
        );

        // Once the client's tick covered the terminal sequence, it goes.
        s.mark_observed(terminal_seq);
        assert_eq!(
            store.evict_confirmed(registry.min_observed(Channel::Orders)),
            1
        );
        assert!(store.snapshot(&ViewFilter::default()).orders.is_empty());
    }

    #[test]
    fn clients_not_subscribed_to_orders_do_not_gate_eviction() {
        let store = StateStore::new(60_000);
        let registry = ClientRegistry::new();
        let s = Arc::new(session());
        s.unsubscribe(&[Channel::Orders]);
        registry.register(s);

        store.apply(order_event("O1", OrderStatus::Canceled));
        assert_eq!(registry.min_observed(Channel::Orders), None);
        assert_eq!(
            store.evict_confirmed(registry.min_observed(Channel::Orders)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_marks_observed_sequence() {
        let store = store_with_quotes();
        let s = Arc::new(session());
        let (tx, mut rx) = mpsc::channel(16);

        let handle = tokio::spawn(run_scheduler(
            s.clone(),
            store.clone(),
            tx,
            Duration::from_millis(250),
            0.5,
        ));

        // First snapshot delivered at sequence 3.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence(), 3);
        assert_eq!(s.observed_sequence(), 3);

        // An identical re-apply produces no frame, but the tick still
        // accounts for the new sequence.
        store.apply(quote_event("BTCUSDT", dec!(50000)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(s.observed_sequence(), 4);
        assert!(rx.try_recv().is_err());

        handle.abort();
    }

    #[test]
    fn full_queue_drops_and_arms_resync() {
        let s = session();
        let (tx, mut rx) = mpsc::channel(2);

        let msg = || ServerMessage::Pong { sequence: 1 };
        assert_eq!(try_enqueue(&s, &tx, msg()), Enqueue::Sent);
        assert_eq!(try_enqueue(&s, &tx, msg()), Enqueue::Sent);
        assert_eq!(try_enqueue(&s, &tx, msg()), Enqueue::Dropped);
        assert!(s.take_resync());

        // Once the queue has room again the next frame goes through.
        rx.try_recv().unwrap();
        assert_eq!(try_enqueue(&s, &tx, msg()), Enqueue::Sent);
    }

    #[test]
    fn closed_queue_reports_disconnect() {
        let s = session();
        let (tx, rx) = mpsc::channel(2);
        drop(rx);
        assert_eq!(
            try_enqueue(&s, &tx, ServerMessage::Pong { sequence: 1 }),
            Enqueue::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_sends_snapshot_then_delta_with_increasing_sequence() {
        let store = store_with_quotes();
        let s = Arc::new(session());
        let (tx, mut rx) = mpsc::channel(16);

        let handle = tokio::spawn(run_scheduler(
            s.clone(),
            store.clone(),
            tx,
            Duration::from_millis(250),
            0.5,
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "snapshot");
        assert_eq!(first.sequence(), 3);

        store.apply(quote_event("BTCUSDT", dec!(50010)));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind(), "delta");
        assert!(second.sequence() > first.sequence());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_recovers_slow_consumer_with_snapshot() {
        let store = store_with_quotes();
        let s = Arc::new(session());
        let (tx, mut rx) = mpsc::channel(2);

        let handle = tokio::spawn(run_scheduler(
            s.clone(),
            store.clone(),
            tx,
            Duration::from_millis(100),
            0.5,
        ));

        // Initial snapshot fills slot one; don't read yet.
        // Burst of changes while the "socket" is blocked.
        for i in 0..20u32 {
            store.apply(quote_event("BTCUSDT", dec!(50000) + rust_decimal::Decimal::from(i)));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Drain whatever queued during the burst, then read the recovery
        // frame: it must be a snapshot, not a chain of deltas.
        let mut drained = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            drained.push(msg);
        }
        assert!(!drained.is_empty());

        store.apply(quote_event("BTCUSDT", dec!(60000)));
        let recovery = rx.recv().await.unwrap();
        assert_eq!(recovery.kind(), "snapshot");

        handle.abort();
    }
}
