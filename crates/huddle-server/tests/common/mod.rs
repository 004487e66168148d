use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, ClientEvent, Message as WireMessage, ServerEvent, UserId};
use huddle_server::config::Config;
use huddle_server::handlers::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Start a server on an ephemeral port with the given directory seed.
///
/// Returns the bound address and the shared state, so tests can assert on
/// the store and session table directly.
pub async fn start_server(seed: &[(UserId, &str)]) -> (SocketAddr, Arc<AppState>) {
    let mut config = Config::default();
    config.metrics.enabled = false;

    let state = Arc::new(AppState::new(config));
    for (id, username) in seed {
        state.store.add_user(*id, *username);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(Arc::clone(&state));

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, state)
}

/// A WebSocket client speaking the Huddle protocol.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl TestClient {
    /// Connect and consume the welcome handshake.
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connect failed");
        let mut client = Self { ws };

        match client.recv().await {
            ServerEvent::Welcome { .. } => {}
            other => panic!("expected welcome, got {other:?}"),
        }
        client
    }

    /// Connect and bind to a user identity.
    pub async fn identify(addr: &SocketAddr, user_id: UserId) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&ClientEvent::Identify { user_id }).await;
        client
    }

    /// Send a client event.
    pub async fn send(&mut self, event: &ClientEvent) {
        let data = codec::encode(event).unwrap();
        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .expect("websocket send failed");
    }

    /// Receive the next server event, skipping transport control frames.
    pub async fn recv(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed")
                .expect("websocket error");

            if let Message::Binary(data) = msg {
                return codec::decode::<ServerEvent>(&data).unwrap();
            }
        }
    }

    /// Read events until one matches the predicate.
    pub async fn recv_matching(&mut self, want: fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.recv().await;
            if want(&event) {
                return event;
            }
        }
    }

    /// Read events until a presence snapshot equal to `expected` arrives.
    pub async fn wait_for_snapshot(&mut self, expected: &[UserId]) {
        loop {
            if let ServerEvent::PresenceSnapshot { online } = self.recv().await {
                if online == expected {
                    return;
                }
            }
        }
    }

    /// Read events until a message delivery arrives.
    pub async fn recv_message(&mut self) -> WireMessage {
        loop {
            if let ServerEvent::MessageNew { message } = self.recv().await {
                return message;
            }
        }
    }

    /// Assert that no event arrives within a short window.
    pub async fn expect_silence(&mut self) {
        let waited = tokio::time::timeout(Duration::from_millis(300), self.ws.next()).await;
        assert!(waited.is_err(), "expected no event, got {waited:?}");
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Minimal HTTP GET against the server's REST routes.
pub async fn http_get(addr: &SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}
