// =============================================================================
// Hub — shared process state
// =============================================================================
//
// Ties the components together for the HTTP/WS surface. Built once in main
// and passed as `Arc<Hub>` into every axum handler; components keep their
// own interior state and the hub only wires them.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::HubConfig;
use crate::history::HistoryClient;
use crate::session::ClientRegistry;
use crate::state_store::StateStore;
use crate::supervisor::Supervisor;

pub struct Hub {
    pub config: HubConfig,
    pub store: Arc<StateStore>,
    pub registry: Arc<ClientRegistry>,
    pub supervisor: Supervisor,
    pub history: HistoryClient,
    pub metrics: PrometheusHandle,
    pub start_time: Instant,
}

impl Hub {
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
