// =============================================================================
// Hub error taxonomy
// =============================================================================
//
// One variant per failure class the hub distinguishes at a boundary.
// Per-client errors never cross clients; adapter errors never cross adapters.
// Adapter plumbing keeps anyhow contexts internally and surfaces here only at
// the supervisor seam.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Startup-time configuration problem. The process refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient upstream transport failure; the supervisor reconnects.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Malformed message from an upstream; discarded, connection kept.
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    /// A client misbehaved (bad handshake, bad control frame, oversized
    /// message). Closes only that client.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// History facade rejected or failed a range query.
    #[error("history query error: {0}")]
    History(String),
}
