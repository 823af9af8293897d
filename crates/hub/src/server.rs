//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades HTTP GET `/ws` to WebSocket and hands
//! every connection to the hub as a new [`Peer`](crate::Peer).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatrelay_protocol::constants::{DEFAULT_PORT, WS_PATH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::hub::HubHandle;
use crate::peer::{PeerConfig, spawn_peer};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Settings applied to every accepted connection.
    pub peer: PeerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            peer: PeerConfig::default(),
        }
    }
}

/// The relay WebSocket server.
pub struct RelayServer {
    config: ServerConfig,
    hub: HubHandle,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    /// Creates a server feeding connections to `hub`.
    ///
    /// Cancelling `cancel` (or calling [`shutdown`](Self::shutdown)) stops
    /// the accept loop and closes every connection it spawned.
    pub fn new(config: ServerConfig, hub: HubHandle, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            cancel,
            local_addr: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay server listening on ws://{local_addr}{WS_PATH}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and starts its peer.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.peer.max_message_size);
        ws_config.max_frame_size = Some(self.config.peer.max_message_size);

        let ws_stream =
            accept_hdr_async_with_config(stream, check_path, Some(ws_config)).await?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%peer_addr, conn_id, "WebSocket connection established");

        spawn_peer(
            ws_stream,
            conn_id,
            peer_addr.to_string(),
            self.hub.clone(),
            &self.config.peer,
            &self.cancel,
        );
        Ok(())
    }
}

/// Handshake callback: only the WebSocket endpoint may be upgraded.
#[allow(clippy::result_large_err)]
fn check_path(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == WS_PATH {
        return Ok(resp);
    }
    tracing::debug!(path = %req.uri().path(), "rejecting upgrade for unknown path");
    let mut err = ErrorResponse::new(Some("not found".into()));
    *err.status_mut() = StatusCode::NOT_FOUND;
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use chatrelay_protocol::constants::{MessageType, SubType};
    use chatrelay_protocol::envelope::{Body, Envelope};
    use chatrelay_protocol::messages::{LoginResponse, UserPresence};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use super::*;
    use crate::hub::{Hub, HubConfig};

    const WAIT: Duration = Duration::from_secs(2);

    struct Relay {
        server: Arc<RelayServer>,
        hub: HubHandle,
        cancel: CancellationToken,
    }

    impl Relay {
        async fn start() -> Self {
            let cancel = CancellationToken::new();
            let (hub, handle) = Hub::new(HubConfig::default());
            tokio::spawn(hub.run(cancel.clone()));

            let config = ServerConfig {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                peer: PeerConfig::default(),
            };
            let server = RelayServer::new(config, handle.clone(), cancel.clone());
            let server2 = Arc::clone(&server);
            tokio::spawn(async move {
                server2.run().await.unwrap();
            });

            // Wait for the server to bind.
            while server.port().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            Self {
                server,
                hub: handle,
                cancel,
            }
        }

        async fn url(&self) -> String {
            format!("ws://127.0.0.1:{}{WS_PATH}", self.server.port().await)
        }

        async fn client(&self) -> Client {
            let (ws, _) = tokio_tungstenite::connect_async(self.url().await)
                .await
                .unwrap();
            Client {
                ws,
                pending: VecDeque::new(),
            }
        }
    }

    struct Client {
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        pending: VecDeque<Envelope>,
    }

    impl Client {
        async fn send(&mut self, value: serde_json::Value) {
            self.ws
                .send(WsMessage::Text(value.to_string().into()))
                .await
                .unwrap();
        }

        /// Next envelope, or `None` if nothing arrives within `window`.
        async fn try_recv(&mut self, window: Duration) -> Option<Envelope> {
            loop {
                if let Some(env) = self.pending.pop_front() {
                    return Some(env);
                }
                match timeout(window, self.ws.next()).await {
                    Ok(Some(Ok(WsMessage::Text(text)))) => {
                        // The server batches queued envelopes, one per line.
                        for line in text.as_str().lines() {
                            self.pending.push_back(Envelope::decode(line.as_bytes()).unwrap());
                        }
                    }
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
                }
            }
        }

        async fn recv_kind(&mut self, msg_type: MessageType, sub_type: SubType) -> Envelope {
            loop {
                let env = self
                    .try_recv(WAIT)
                    .await
                    .expect("timed out waiting for envelope");
                if env.msg_type == msg_type && env.sub_type == sub_type {
                    return env;
                }
            }
        }

        async fn drain(&mut self, window: Duration) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Some(env) = self.try_recv(window).await {
                out.push(env);
            }
            out
        }

        async fn login(&mut self, nickname: &str) -> LoginResponse {
            self.send(json!({
                "type": "auth",
                "sub_type": "login",
                "timestamp": 0,
                "payload": {"nickname": nickname}
            }))
            .await;
            self.recv_kind(MessageType::Auth, SubType::LoginResponse)
                .await
                .parse_payload()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let relay = Relay::start().await;
        assert!(relay.server.port().await > 0);
        assert!(relay.server.local_addr().await.is_some());
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn server_rejects_other_paths() {
        let relay = Relay::start().await;
        let url = format!("ws://127.0.0.1:{}/elsewhere", relay.server.port().await);
        assert!(tokio_tungstenite::connect_async(url).await.is_err());
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn connection_is_registered_and_released() {
        let relay = Relay::start().await;
        let mut client = relay.client().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.hub.connection_count().await, 1);

        client.ws.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.hub.connection_count().await, 0);
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let relay = Relay::start().await;
        let mut client = relay.client().await;

        client
            .ws
            .send(WsMessage::Text("not valid json {{{".into()))
            .await
            .unwrap();
        client
            .send(json!({"type": "heartbeat", "sub_type": "ping", "payload": {}}))
            .await;
        let pong = client.recv_kind(MessageType::Heartbeat, SubType::Pong).await;
        assert_eq!(pong.msg_type, MessageType::Heartbeat);
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn lone_login_sees_no_online_broadcast() {
        let relay = Relay::start().await;
        let mut alice = relay.client().await;

        let resp = alice.login("alice").await;
        assert!(resp.success);
        assert_eq!(resp.nickname.as_deref(), Some("alice"));
        assert!(resp.user_id.is_some());

        let rest = alice.drain(Duration::from_millis(200)).await;
        assert!(rest.iter().all(|e| e.sub_type != SubType::UserOnline));
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn text_message_reaches_only_recipient() {
        let relay = Relay::start().await;
        let mut alice = relay.client().await;
        let mut bob = relay.client().await;
        let alice_id = alice.login("alice").await.user_id.unwrap();
        let bob_id = bob.login("bob").await.user_id.unwrap();
        alice.drain(Duration::from_millis(200)).await;
        bob.drain(Duration::from_millis(200)).await;

        alice
            .send(json!({
                "type": "message",
                "sub_type": "text",
                "from": "someone-else",
                "to": [bob_id],
                "timestamp": 0,
                "payload": {"text": "hi"}
            }))
            .await;

        let got = bob.recv_kind(MessageType::Message, SubType::Text).await;
        assert_eq!(got.from, alice_id);
        assert_eq!(got.to, vec![bob_id.clone()]);
        assert_eq!(got.payload["text"], "hi");

        let bob_rest = bob.drain(Duration::from_millis(200)).await;
        assert!(bob_rest.iter().all(|e| e.msg_type != MessageType::Message));
        let alice_rest = alice.drain(Duration::from_millis(200)).await;
        assert!(alice_rest.iter().all(|e| e.msg_type != MessageType::Message));
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn duplicate_nickname_is_rejected() {
        let relay = Relay::start().await;
        let mut alice = relay.client().await;
        let mut carol = relay.client().await;
        let alice_id = alice.login("alice").await.user_id.unwrap();

        let resp = carol.login("alice").await;
        assert!(!resp.success);

        let users = relay.hub.online_users().await;
        let named_alice: Vec<_> = users.iter().filter(|u| u.nickname == "alice").collect();
        assert_eq!(named_alice.len(), 1);
        assert_eq!(named_alice[0].user_id, alice_id);
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn disconnect_announces_offline_and_new_roster() {
        let relay = Relay::start().await;
        let mut alice = relay.client().await;
        let mut bob = relay.client().await;
        let alice_id = alice.login("alice").await.user_id.unwrap();
        bob.login("bob").await;
        bob.drain(Duration::from_millis(200)).await;

        alice.ws.close(None).await.unwrap();
        drop(alice);

        let offline = bob
            .recv_kind(MessageType::System, SubType::UserOffline)
            .await;
        let presence: UserPresence = offline.parse_payload().unwrap();
        assert_eq!(presence.user_id, alice_id);

        let list = bob.recv_kind(MessageType::UserList, SubType::None).await;
        match list.body().unwrap() {
            Body::UserList(payload) => {
                assert_eq!(payload.users.len(), 1);
                assert_eq!(payload.users[0].nickname, "bob");
            }
            other => panic!("unexpected body: {other:?}"),
        }
        relay.server.shutdown();
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let relay = Relay::start().await;
        let mut alice = relay.client().await;
        alice.login("alice").await;

        relay.cancel.cancel();

        let closed = timeout(WAIT, async {
            loop {
                match alice.ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "client should observe the connection closing");
    }
}
