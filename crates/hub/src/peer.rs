//! Peer connection management: read/write pumps, ping/pong, send buffering.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chatrelay_protocol::constants::{
    MessageType, SEND_BUFFER_SIZE, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_READ_WAIT,
    WS_WRITE_WAIT,
};
use chatrelay_protocol::envelope::Envelope;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::hub::HubHandle;

/// Process-local connection number assigned on accept.
pub type ConnId = u64;

/// Per-connection timing and buffer settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Capacity of the outbound queue.
    pub send_buffer_size: usize,
    /// Inactivity deadline applied to every read.
    pub read_timeout: Duration,
    /// Deadline for a single frame write.
    pub write_timeout: Duration,
    /// Interval between transport-level pings.
    pub ping_period: Duration,
    /// Inbound text frames larger than this are skipped.
    pub max_message_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: SEND_BUFFER_SIZE,
            read_timeout: WS_READ_WAIT,
            write_timeout: WS_WRITE_WAIT,
            ping_period: WS_PING_PERIOD,
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

/// Identity assigned to a peer on successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub nickname: String,
    /// Milliseconds since the Unix epoch.
    pub login_time: i64,
}

/// Error returned when an envelope cannot be queued for a peer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send buffer full")]
    Full,

    #[error("connection closed")]
    Closed,
}

/// Hub-side adapter for one client connection.
///
/// The outbound queue is only ever drained by this peer's write pump; any
/// task may enqueue. The identity is written at most once, by the hub's
/// control loop.
pub struct Peer {
    conn_id: ConnId,
    remote_addr: String,
    identity: OnceLock<Identity>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    last_heartbeat: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Peer {
    /// Creates a peer and the receiving end of its outbound queue.
    ///
    /// `cancel` closes the underlying transport when triggered.
    pub fn new(
        conn_id: ConnId,
        remote_addr: impl Into<String>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let peer = Arc::new(Self {
            conn_id,
            remote_addr: remote_addr.into(),
            identity: OnceLock::new(),
            tx: Mutex::new(Some(tx)),
            last_heartbeat: Mutex::new(Instant::now()),
            cancel,
        });
        (peer, rx)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Returns the login identity, or `None` while unauthenticated.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity().map(|i| i.user_id.as_str())
    }

    pub fn nickname(&self) -> Option<&str> {
        self.identity().map(|i| i.nickname.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.get().is_some()
    }

    /// Records the login identity. Returns `false` if one was already set.
    pub(crate) fn authenticate(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// Time of the last heartbeat envelope read from this peer.
    pub fn last_heartbeat(&self) -> Instant {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch_heartbeat(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Queues an envelope for delivery.
    ///
    /// `auth` envelopes wait for room in the queue; everything else is
    /// dropped (and logged) when the queue is full. Failures are never
    /// reported to the caller.
    pub async fn send(&self, envelope: &Envelope) {
        let data = match envelope.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(conn_id = self.conn_id, "failed to encode envelope: {e}");
                return;
            }
        };

        trace!(
            conn_id = self.conn_id,
            msg_type = ?envelope.msg_type,
            sub_type = %envelope.sub_type,
            "queueing envelope"
        );

        if envelope.msg_type == MessageType::Auth {
            let Some(tx) = self.sender() else {
                debug!(conn_id = self.conn_id, "peer closed, dropping auth envelope");
                return;
            };
            if tx.send(data).await.is_err() {
                debug!(conn_id = self.conn_id, "write pump gone, dropping auth envelope");
            }
        } else {
            let _ = self.enqueue(data);
        }
    }

    /// Non-blocking enqueue of an already serialized envelope.
    pub(crate) fn enqueue(&self, data: String) -> Result<(), SendError> {
        let Some(tx) = self.sender() else {
            return Err(SendError::Closed);
        };
        tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(
                    conn_id = self.conn_id,
                    user_id = self.user_id().unwrap_or_default(),
                    "send buffer full, dropping message"
                );
                SendError::Full
            }
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Closes the outbound queue. The write pump flushes what is already
    /// queued, sends a close frame and exits.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Returns `true` once the outbound queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }

    /// Tears down the transport; both pumps exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Wraps an accepted WebSocket in a [`Peer`] and starts its pumps.
///
/// The peer is registered with the hub before the first read, and
/// unregistered once the read pump exits for any reason. The outbound
/// queue is then closed so the write pump ends the session with a close
/// frame.
pub fn spawn_peer<S>(
    ws_stream: S,
    conn_id: ConnId,
    remote_addr: impl Into<String>,
    hub: HubHandle,
    config: &PeerConfig,
    server_cancel: &CancellationToken,
) -> Arc<Peer>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let cancel = server_cancel.child_token();
    let (peer, rx) = Peer::new(conn_id, remote_addr, config.send_buffer_size, cancel);
    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, Arc::clone(&peer), config.clone()));

    let read_peer = Arc::clone(&peer);
    let read_config = config.clone();
    tokio::spawn(async move {
        hub.register(Arc::clone(&read_peer)).await;
        read_pump(ws_stream, &read_peer, &hub, &read_config).await;
        hub.unregister(Arc::clone(&read_peer)).await;
        // The write pump flushes, sends a close frame and cancels the peer.
        read_peer.close();
        info!(
            conn_id = read_peer.conn_id(),
            peer_addr = %read_peer.remote_addr(),
            nickname = read_peer.nickname().unwrap_or_default(),
            "peer disconnected"
        );
    });

    peer
}

/// Write pump: drains the outbound queue and sends WS pings.
///
/// Messages already waiting when a write starts are joined into the same
/// text frame, one envelope per line.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<String>,
    peer: Arc<Peer>,
    config: PeerConfig,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let mut ping_interval = tokio::time::interval(config.ping_period);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = peer.cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(first) => {
                        let frame = drain_batch(first, &mut rx, config.send_buffer_size);
                        let ws_msg = WsMessage::Text(frame.into());
                        if let Err(e) = send_with_deadline(&mut sink, ws_msg, config.write_timeout).await {
                            warn!(conn_id = peer.conn_id(), "write pump send error: {e}");
                            break;
                        }
                    }
                    None => {
                        debug!(conn_id = peer.conn_id(), "outbound queue closed, sending close frame");
                        let _ = send_with_deadline(&mut sink, WsMessage::Close(None), config.write_timeout).await;
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                let ping = WsMessage::Ping(Vec::new().into());
                if let Err(e) = send_with_deadline(&mut sink, ping, config.write_timeout).await {
                    warn!(conn_id = peer.conn_id(), "write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
    peer.shutdown();
}

/// Appends every message already waiting in the queue to `first`.
fn drain_batch(first: String, rx: &mut mpsc::Receiver<String>, limit: usize) -> String {
    let mut frame = first;
    for _ in 1..limit {
        match rx.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("{0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("write deadline exceeded")]
    Timeout,
}

async fn send_with_deadline<S>(
    sink: &mut S,
    msg: WsMessage,
    deadline: Duration,
) -> Result<(), WriteError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(msg)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(WriteError::Timeout),
    }
}

/// Read pump: reads WS frames, decodes envelopes and hands them to the hub.
async fn read_pump<S>(mut stream: S, peer: &Arc<Peer>, hub: &HubHandle, config: &PeerConfig)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = peer.cancel.cancelled() => break,

            res = tokio::time::timeout(config.read_timeout, stream.next()) => match res {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(conn_id = peer.conn_id(), "read deadline exceeded, closing connection");
                    break;
                }
            },
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if text.len() > config.max_message_size {
                    warn!(
                        conn_id = peer.conn_id(),
                        "message exceeds max size ({} > {}), dropping",
                        text.len(),
                        config.max_message_size
                    );
                    continue;
                }
                handle_text(peer, hub, text.as_str()).await;
            }
            Some(Ok(WsMessage::Pong(_))) => trace!(conn_id = peer.conn_id(), "received pong"),
            // tungstenite queues the pong reply itself.
            Some(Ok(WsMessage::Ping(_))) => trace!(conn_id = peer.conn_id(), "received ping"),
            Some(Ok(WsMessage::Binary(_))) => {
                debug!(conn_id = peer.conn_id(), "ignoring binary frame");
            }
            Some(Ok(WsMessage::Close(_))) => {
                debug!(conn_id = peer.conn_id(), "received close frame");
                break;
            }
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Err(e)) => {
                warn!(conn_id = peer.conn_id(), "read pump error: {e}");
                break;
            }
            None => break,
        }
    }
}

/// Decodes one text frame and publishes it to the hub.
async fn handle_text(peer: &Arc<Peer>, hub: &HubHandle, text: &str) {
    trace!(conn_id = peer.conn_id(), raw = text, "received frame");

    let envelope = match Envelope::decode(text.as_bytes()) {
        Ok(env) => env,
        Err(e) => {
            warn!(conn_id = peer.conn_id(), "failed to decode envelope: {e}");
            return;
        }
    };

    if envelope.msg_type == MessageType::Heartbeat {
        peer.touch_heartbeat();
    }

    hub.dispatch(Arc::clone(peer), envelope).await;
}
