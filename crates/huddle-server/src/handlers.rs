//! Connection handlers for the Huddle server.
//!
//! This module wires the transport to the core: one handler task per live
//! WebSocket connection, each decoding client events and dispatching them
//! into the shared registry, relay, and call coordinator. REST routes cover
//! the directory and mailbox lookups clients use to (re)build their view.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{
    CallConfig, CallCoordinator, CoreError, MemoryStore, MessageRelay, MessageStore,
    PresenceBroadcaster, Registry, UserDirectory,
};
use huddle_protocol::events::error_code;
use huddle_protocol::{codec, ClientEvent, ServerEvent, UserId, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Connection/identity registry.
    pub registry: Arc<Registry>,
    /// Presence announcer.
    pub presence: PresenceBroadcaster,
    /// Chat message relay.
    pub relay: MessageRelay,
    /// Call session coordinator.
    pub calls: Arc<CallCoordinator>,
    /// Backing store, also serving as the user directory.
    pub store: Arc<MemoryStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemoryStore::new());

        for user in &config.directory.seed {
            store.add_user(user.id, user.username.clone());
        }

        let presence = PresenceBroadcaster::new(Arc::clone(&registry));
        let relay = MessageRelay::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::clone(&store) as Arc<dyn UserDirectory>,
        );
        let calls = Arc::new(CallCoordinator::new(
            Arc::clone(&registry),
            CallConfig {
                ring_timeout: config.call.ring_timeout(),
            },
        ));

        Self {
            registry,
            presence,
            relay,
            calls,
            store,
            config,
        }
    }
}

/// Build the axum router for the given state.
#[must_use]
pub fn app(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.websocket_path.clone();

    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/users", get(list_users_handler))
        .route("/api/messages/:user_id", get(history_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let websocket_path = config.websocket_path.clone();
    let state = Arc::new(AppState::new(config));

    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Directory listing handler.
async fn list_users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_users().await {
        Ok(users) => Json(users).into_response(),
        Err(e) => {
            error!(error = %e, "Directory lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mailbox history handler. Sits behind the external auth layer, which is
/// expected to have verified that the caller owns `user_id`.
async fn history_handler(
    Path(user_id): Path<UserId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.relay.history(user_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            error!(user = user_id, error = %e, "History lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    if state.registry.connection_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached, refusing new connection");
        metrics::record_error("connection_limit");
        return;
    }

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Register the outbound queue before anything can be delivered
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry.register(&connection_id, outbound_tx);

    // Send Welcome event
    let welcome = ServerEvent::welcome(
        &connection_id,
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if let Ok(data) = codec::encode(&welcome) {
        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
            error!(connection = %connection_id, "Failed to send Welcome event");
            state.registry.unbind(&connection_id);
            return;
        }
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Event loop
    loop {
        tokio::select! {
            biased;

            // Deliver events queued for this connection
            Some(event) = outbound_rx.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_message(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Outbound encode error");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(connection = %connection_id, size = data.len(), "Inbound frame over size limit");
                            metrics::record_error("frame_size");
                            break;
                        }

                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        // Try to decode events
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    metrics::record_message(data.len(), "inbound");
                                    dispatch_event(event, &connection_id, &state).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Malformed event");
                                    metrics::record_error("protocol");
                                    state.registry.send_to_connection(
                                        &connection_id,
                                        ServerEvent::error(error_code::MALFORMED_EVENT, e.to_string()),
                                    );
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cleanup_connection(&connection_id, &state);
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Tear down a closed connection.
///
/// The forced call teardown is announced before the presence change, so by
/// the time peers observe the new snapshot their sessions with this user are
/// already gone.
fn cleanup_connection(connection_id: &str, state: &Arc<AppState>) {
    let Some(outcome) = state.registry.unbind(connection_id) else {
        return;
    };

    if outcome.went_offline {
        let ended = state.calls.handle_disconnect(outcome.user);
        if ended > 0 {
            metrics::set_active_calls(state.calls.session_count());
        }
        state.presence.announce_offline(outcome.user);
    }
}

/// Dispatch a decoded client event to the owning component.
///
/// Pure plumbing: resolves the sender identity where needed, invokes the
/// core operation, and reports rejections back to the sender.
async fn dispatch_event(event: ClientEvent, connection_id: &str, state: &Arc<AppState>) {
    match event {
        ClientEvent::Identify { user_id } => {
            handle_identify(user_id, connection_id, state);
        }

        ClientEvent::MessageSend {
            receiver_id,
            content,
        } => {
            if let Err(e) = state
                .relay
                .send_message(connection_id, receiver_id, content)
                .await
            {
                report_error(state, connection_id, &e, "message_send");
            }
        }

        ClientEvent::MarkRead { peer_id } => {
            if let Err(e) = state.relay.mark_read(connection_id, peer_id).await {
                report_error(state, connection_id, &e, "mark_read");
            }
        }

        ClientEvent::CallRequest { callee_id } => {
            let Some(user_id) = require_identity(connection_id, state, "call_request") else {
                return;
            };
            match state.calls.request(user_id, callee_id) {
                Ok(_) => {
                    metrics::record_call_started();
                    metrics::set_active_calls(state.calls.session_count());
                }
                Err(e) => report_error(state, connection_id, &e, "call_request"),
            }
        }

        ClientEvent::CallAccept { caller_id } => {
            let Some(user_id) = require_identity(connection_id, state, "call_accept") else {
                return;
            };
            if let Err(e) = state.calls.accept(user_id, caller_id) {
                report_error(state, connection_id, &e, "call_accept");
            }
        }

        ClientEvent::CallReject { caller_id } => {
            let Some(user_id) = require_identity(connection_id, state, "call_reject") else {
                return;
            };
            match state.calls.reject(user_id, caller_id) {
                Ok(()) => metrics::set_active_calls(state.calls.session_count()),
                Err(e) => report_error(state, connection_id, &e, "call_reject"),
            }
        }

        ClientEvent::CallOffer { peer_id, sdp } => {
            let Some(user_id) = require_identity(connection_id, state, "call_offer") else {
                return;
            };
            if let Err(e) = state.calls.offer(user_id, peer_id, sdp) {
                report_error(state, connection_id, &e, "call_offer");
            }
        }

        ClientEvent::CallAnswer { peer_id, sdp } => {
            let Some(user_id) = require_identity(connection_id, state, "call_answer") else {
                return;
            };
            if let Err(e) = state.calls.answer(user_id, peer_id, sdp) {
                report_error(state, connection_id, &e, "call_answer");
            }
        }

        ClientEvent::CallIceCandidate { peer_id, candidate } => {
            let Some(user_id) = require_identity(connection_id, state, "call_ice_candidate")
            else {
                return;
            };
            // Candidate rejections are routine races; drop without an error
            // frame so a late trickle does not spam the client.
            if let Err(e) = state.calls.candidate(user_id, peer_id, candidate) {
                debug!(connection = %connection_id, error = %e, "Candidate dropped");
                metrics::record_error("call_ice_candidate");
            }
        }

        ClientEvent::CallEnd { peer_id } => {
            let Some(user_id) = require_identity(connection_id, state, "call_end") else {
                return;
            };
            match state.calls.end(user_id, peer_id) {
                Ok(()) => metrics::set_active_calls(state.calls.session_count()),
                Err(e) => report_error(state, connection_id, &e, "call_end"),
            }
        }

        ClientEvent::Ping { timestamp } => {
            state
                .registry
                .send_to_connection(connection_id, ServerEvent::Pong { timestamp });
        }
    }
}

/// Bind a verified identity to the connection and publish presence.
fn handle_identify(user_id: UserId, connection_id: &str, state: &Arc<AppState>) {
    // The external auth layer vouched for this identity; mirror it into the
    // directory so it can be a message or call target later.
    state.store.ensure_user(user_id, format!("user-{user_id}"));

    match state.registry.bind(connection_id, user_id) {
        Ok(outcome) => {
            if let Some(released) = outcome.released {
                if released.went_offline {
                    state.calls.handle_disconnect(released.user);
                    state.presence.announce_offline(released.user);
                }
            }
            if outcome.came_online {
                state.presence.announce_online(user_id);
            }
            // The identifying connection always gets a fresh snapshot, even
            // when another device already had the user online.
            state.presence.sync_connection(connection_id);
        }
        Err(e) => report_error(state, connection_id, &e, "identify"),
    }
}

/// Resolve the identity bound to a connection, reporting `AuthRequired`
/// when there is none.
fn require_identity(
    connection_id: &str,
    state: &Arc<AppState>,
    context: &'static str,
) -> Option<UserId> {
    let identity = state.registry.identity_of(connection_id);
    if identity.is_none() {
        report_error(state, connection_id, &CoreError::AuthRequired, context);
    }
    identity
}

/// Report a rejected event back to its sender.
///
/// Stale signals have no wire code and are only logged; everything else
/// becomes an error frame on the sender's connection.
fn report_error(state: &AppState, connection_id: &str, error: &CoreError, context: &'static str) {
    metrics::record_error(context);

    match error.wire_code() {
        Some(code) => {
            warn!(connection = %connection_id, context, error = %error, "Event rejected");
            state
                .registry
                .send_to_connection(connection_id, ServerEvent::error(code, error.to_string()));
        }
        None => {
            debug!(connection = %connection_id, context, "Stale signal dropped");
        }
    }
}
