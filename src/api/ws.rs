// =============================================================================
// WebSocket Gateway — per-client fan-out
// =============================================================================
//
// Clients connect to the configured upgrade path with handshake query
// parameters `type` (tui|web|service), `format` (json|compact-binary) and an
// optional `key`. On success the connection gets:
//   - a registered `ClientSession`,
//   - a scheduler task pushing snapshot/delta frames into a bounded queue,
//   - this connection loop, which drains the queue onto the socket under a
//     per-write deadline, answers control messages, pings every
//     `ping_interval` and closes when no pong arrives within `pong_timeout`.
//
// Disconnect aborts the scheduler promptly and removes the session. Nothing
// here ever affects another client.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::auth::validate_key;
use crate::api::protocol::{
    parse_client_message, parse_handshake, ClientMessage, Handshake, HandshakeQuery,
    ServerMessage, ERR_BAD_CONTROL, ERR_OVERSIZED,
};
use crate::hub::Hub;
use crate::session::{run_scheduler, ClientSession};
use crate::types::WireFormat;

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    Query(query): Query<HandshakeQuery>,
) -> impl IntoResponse {
    if !validate_key(hub.config.ws.shared_key.as_deref(), query.key.as_deref()) {
        warn!("WebSocket rejected: invalid or missing handshake key");
        return (StatusCode::FORBIDDEN, "invalid or missing key").into_response();
    }

    let handshake = match parse_handshake(&query) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "WebSocket rejected: bad handshake");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    info!(kind = %handshake.kind, format = %handshake.format, "WebSocket accepted — upgrading");
    ws.max_message_size(hub.config.ws.max_message_bytes)
        .on_upgrade(move |socket| handle_connection(socket, hub, handshake))
        .into_response()
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(socket: WebSocket, hub: Arc<Hub>, handshake: Handshake) {
    let session = Arc::new(ClientSession::new(
        handshake.kind,
        handshake.format,
        handshake.user_tag,
    ));
    hub.registry.register(session.clone());
    info!(client = %session.id, kind = %session.kind, format = %session.format, "client connected");

    let (frames_tx, mut frames_rx) =
        mpsc::channel::<ServerMessage>(hub.config.ws.client_queue_size);
    let scheduler = tokio::spawn(run_scheduler(
        session.clone(),
        hub.store.clone(),
        frames_tx,
        hub.config.refresh.interval_for(session.kind),
        hub.config.snapshot_override_ratio,
    ));

    let (mut sender, mut receiver) = socket.split();

    let mut ping_timer = interval(hub.config.ping_interval());
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; a ping on connect is harmless.

    let write_deadline = hub.config.write_deadline();

    loop {
        tokio::select! {
            // ── Outbound: scheduler frames ──────────────────────────────
            frame = frames_rx.recv() => {
                match frame {
                    Some(msg) => {
                        if !send_frame(&mut sender, &session, msg, write_deadline).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Heartbeat ───────────────────────────────────────────────
            _ = ping_timer.tick() => {
                if session.pong_age() > hub.config.pong_timeout() {
                    warn!(client = %session.id, "pong timeout — closing connection");
                    break;
                }
                match timeout(write_deadline, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client = %session.id, error = %e, "ping send failed — closing");
                        break;
                    }
                    Err(_) => {
                        warn!(client = %session.id, "ping write deadline expired — closing");
                        break;
                    }
                }
            }

            // ── Inbound: control messages ───────────────────────────────
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        if !handle_inbound(&hub, &session, &mut sender, msg, write_deadline).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(client = %session.id, error = %e, "WebSocket receive error — closing");
                        break;
                    }
                    None => {
                        info!(client = %session.id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    scheduler.abort();
    hub.registry.remove(session.id);
    info!(client = %session.id, "client disconnected — session removed");
}

// =============================================================================
// Helpers
// =============================================================================

type WsSender = SplitSink<WebSocket, Message>;

/// Encode and write one frame under the write deadline. Returns `false` when
/// the connection should close.
async fn send_frame(
    sender: &mut WsSender,
    session: &ClientSession,
    msg: ServerMessage,
    deadline: std::time::Duration,
) -> bool {
    let frame = match msg.encode(session.format) {
        Ok(frame) => frame,
        Err(e) => {
            // An encode failure is not a transport failure; skip the frame.
            warn!(client = %session.id, error = %e, "frame encode failed — skipped");
            return true;
        }
    };

    match timeout(deadline, sender.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(client = %session.id, error = %e, "frame send failed — closing");
            false
        }
        Err(_) => {
            warn!(client = %session.id, "write deadline expired — closing");
            false
        }
    }
}

/// Process one inbound WebSocket message. Returns `false` to close.
async fn handle_inbound(
    hub: &Arc<Hub>,
    session: &Arc<ClientSession>,
    sender: &mut WsSender,
    msg: Message,
    deadline: std::time::Duration,
) -> bool {
    let (payload, format) = match &msg {
        Message::Text(text) => (text.as_bytes(), WireFormat::Json),
        Message::Binary(bytes) => (bytes.as_slice(), WireFormat::CompactBinary),
        Message::Ping(data) => {
            let pong = Message::Pong(data.clone());
            return matches!(timeout(deadline, sender.send(pong)).await, Ok(Ok(())));
        }
        Message::Pong(_) => {
            session.touch_pong();
            return true;
        }
        Message::Close(_) => {
            info!(client = %session.id, "close frame received");
            return false;
        }
    };

    if payload.len() > hub.config.ws.max_message_bytes {
        let err = ServerMessage::error(
            hub.store.sequence(),
            ERR_OVERSIZED,
            "inbound message too large",
        );
        let _ = send_frame(sender, session, err, deadline).await;
        return false;
    }

    let control = match parse_client_message(format, payload) {
        Ok(control) => control,
        Err(e) => {
            warn!(client = %session.id, error = %e, "bad control frame — closing");
            let err =
                ServerMessage::error(hub.store.sequence(), ERR_BAD_CONTROL, e.to_string());
            let _ = send_frame(sender, session, err, deadline).await;
            return false;
        }
    };

    match control {
        ClientMessage::Subscribe { channels, symbols } => {
            debug!(client = %session.id, ?channels, ?symbols, "subscribe");
            session.subscribe(&channels, &symbols);
            let ack = ServerMessage::ack(hub.store.sequence(), "subscribe");
            send_frame(sender, session, ack, deadline).await
        }
        ClientMessage::Unsubscribe { channels } => {
            debug!(client = %session.id, ?channels, "unsubscribe");
            session.unsubscribe(&channels);
            let ack = ServerMessage::ack(hub.store.sequence(), "unsubscribe");
            send_frame(sender, session, ack, deadline).await
        }
        ClientMessage::Ping => {
            let pong = ServerMessage::Pong {
                sequence: hub.store.sequence(),
            };
            send_frame(sender, session, pong, deadline).await
        }
        ClientMessage::Pong => {
            session.touch_pong();
            true
        }
    }
}
