// =============================================================================
// Reconnection Supervisor
// =============================================================================
//
// Owns the lifetime of every source adapter. Each adapter runs inside a
// supervised loop: run to completion, then reconnect after an exponential
// backoff (base 1 s, doubling, capped at 30 s by default). The backoff resets
// to base once the connection delivered at least one successful message. A
// fatal auth/config error parks the adapter in `failed` with no retry — the
// process surfaces that through degraded readiness.
//
// Readiness = every adapter `ok`. Liveness is just the process loop being
// responsive; the HTTP health route answering is the signal.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::adapters::{AdapterError, AdapterHandle, SourceAdapter};
use crate::config::ReconnectConfig;
use crate::event::Event;
use crate::types::AdapterHealth;

// =============================================================================
// Backoff
// =============================================================================

/// Bounded exponential backoff: yields base, 2·base, 4·base, … capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            cap_ms: config.cap_ms,
            current_ms: config.base_ms,
        }
    }

    /// The delay to sleep before the next attempt. Advances the internal
    /// state for the attempt after that.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms);
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.cap_ms);
        delay
    }

    /// Back to base after a successful post-connect message.
    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Per-adapter status row for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub status: AdapterHealth,
    pub messages: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

pub struct Supervisor {
    handles: Vec<Arc<AdapterHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawn one supervised task per adapter. The supervisor owns the tasks
    /// until `shutdown`.
    pub fn start(
        adapters: Vec<SourceAdapter>,
        tx: mpsc::Sender<Event>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let mut handles = Vec::with_capacity(adapters.len());
        let mut tasks = Vec::with_capacity(adapters.len());

        for adapter in adapters {
            let handle = Arc::new(AdapterHandle::new(adapter.kind()));
            handles.push(handle.clone());
            tasks.push(tokio::spawn(run_supervised(
                adapter,
                tx.clone(),
                handle,
                reconnect.clone(),
            )));
        }

        Self {
            handles,
            tasks: Mutex::new(tasks),
        }
    }

    /// Readiness: every adapter is `ok`.
    pub fn ready(&self) -> bool {
        self.handles
            .iter()
            .all(|h| h.status() == AdapterHealth::Ok)
    }

    pub fn health(&self) -> BTreeMap<String, AdapterStatus> {
        self.handles
            .iter()
            .map(|h| {
                (
                    h.kind().to_string(),
                    AdapterStatus {
                        status: h.status(),
                        messages: h.messages(),
                        malformed: h.malformed(),
                        reconnects: h.reconnects(),
                    },
                )
            })
            .collect()
    }

    /// Abort every adapter task. Dropping their event senders lets the
    /// writer drain and exit.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_supervised(
    adapter: SourceAdapter,
    tx: mpsc::Sender<Event>,
    handle: Arc<AdapterHandle>,
    reconnect: ReconnectConfig,
) {
    let kind = adapter.kind();
    let mut backoff = Backoff::new(&reconnect);
    let mut attempt: u32 = 0;

    loop {
        let messages_before = handle.messages();
        let outcome = adapter.run(&tx, &handle).await;

        if tx.is_closed() {
            // Shutdown in progress; nothing left to feed.
            return;
        }

        match outcome {
            Err(AdapterError::Fatal(reason)) => {
                handle.set_status(AdapterHealth::Failed);
                error!(adapter = %kind, %reason, "adapter failed permanently — not retrying");
                return;
            }
            Err(AdapterError::Transport(e)) => {
                warn!(adapter = %kind, error = %e, "adapter transport error");
            }
            Ok(()) => {}
        }

        // A connection that delivered at least one message resets the shape.
        if handle.messages() > messages_before {
            backoff.reset();
            attempt = 0;
        }

        attempt += 1;
        handle.set_status(AdapterHealth::Reconnecting);
        handle.mark_reconnect();

        let delay = backoff.next_delay();
        warn!(
            adapter = %kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "adapter disconnected — reconnecting after backoff"
        );
        sleep(delay).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
