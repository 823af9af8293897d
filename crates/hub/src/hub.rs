//! The hub: registry of connected peers and the control loop that owns it.
//!
//! Every registry mutation and every dispatch decision happens inside
//! [`Hub::run`], one event at a time. Other tasks talk to the hub through a
//! [`HubHandle`], which can enqueue events and take read-only snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatrelay_protocol::constants::{
    EVENT_BUFFER_SIZE, MessageType, ROSTER_BROADCAST_DELAY, ROSTER_RESYNC_DELAY,
};
use chatrelay_protocol::envelope::Envelope;
use chatrelay_protocol::messages::UserInfo;
use futures_util::StreamExt;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::peer::{ConnId, Peer};

/// Hub timing and queue settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Delay before the post-login user-list broadcast.
    pub roster_delay: Duration,
    /// Delay before the extra user-list broadcast that follows an online
    /// notice.
    pub resync_delay: Duration,
    /// Capacity of each inbound event queue.
    pub event_buffer_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            roster_delay: ROSTER_BROADCAST_DELAY,
            resync_delay: ROSTER_RESYNC_DELAY,
            event_buffer_size: EVENT_BUFFER_SIZE,
        }
    }
}

/// An envelope read from a peer, waiting for dispatch.
pub struct Inbound {
    pub peer: Arc<Peer>,
    pub envelope: Envelope,
}

/// Connected peers, indexed by connection, user id and display name.
///
/// An authenticated peer is present in both `by_id` and `by_name`, or in
/// neither.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) connections: HashMap<ConnId, Arc<Peer>>,
    pub(crate) by_id: HashMap<String, Arc<Peer>>,
    pub(crate) by_name: HashMap<String, Arc<Peer>>,
}

impl Registry {
    /// Snapshot of every authenticated peer.
    pub(crate) fn authenticated(&self) -> Vec<Arc<Peer>> {
        self.by_id.values().cloned().collect()
    }

    /// Roster of authenticated users, oldest login first.
    pub(crate) fn users(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .by_id
            .values()
            .filter_map(|p| p.identity())
            .map(|i| UserInfo {
                user_id: i.user_id.clone(),
                nickname: i.nickname.clone(),
                login_time: i.login_time,
            })
            .collect();
        users.sort_by(|a, b| {
            a.login_time
                .cmp(&b.login_time)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }

    /// Removes `peer` from every index it occupies.
    ///
    /// Returns `(was_connected, was_authenticated)`.
    fn remove(&mut self, peer: &Arc<Peer>) -> (bool, bool) {
        let connected = self.connections.remove(&peer.conn_id()).is_some();

        let Some(identity) = peer.identity() else {
            return (connected, false);
        };
        let owns_id = self
            .by_id
            .get(&identity.user_id)
            .is_some_and(|p| Arc::ptr_eq(p, peer));
        if !owns_id {
            return (connected, false);
        }
        self.by_id.remove(&identity.user_id);
        if self
            .by_name
            .get(&identity.nickname)
            .is_some_and(|p| Arc::ptr_eq(p, peer))
        {
            self.by_name.remove(&identity.nickname);
        }
        (connected, true)
    }
}

/// Work the control loop schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheduled {
    BroadcastUserList,
}

/// The hub control loop. Create with [`Hub::new`], then drive with
/// [`Hub::run`].
pub struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) registry: Arc<RwLock<Registry>>,
    pub(crate) register_rx: mpsc::Receiver<Arc<Peer>>,
    pub(crate) unregister_rx: mpsc::Receiver<Arc<Peer>>,
    pub(crate) inbound_rx: mpsc::Receiver<Inbound>,
    pub(crate) timers: DelayQueue<Scheduled>,
}

impl Hub {
    /// Creates the hub and a handle for feeding it events.
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let capacity = config.event_buffer_size.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let registry = Arc::new(RwLock::new(Registry::default()));

        let hub = Self {
            config,
            registry: Arc::clone(&registry),
            register_rx,
            unregister_rx,
            inbound_rx,
            timers: DelayQueue::new(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            inbound_tx,
            registry,
        };
        (hub, handle)
    }

    /// Runs the control loop until `cancel` fires, or until every
    /// [`HubHandle`] is gone and no scheduled work remains.
    ///
    /// Sources are polled in a fixed order (register, inbound, unregister)
    /// so a peer's own earlier events are handled before its unregister.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("hub control loop started");

        let mut register_open = true;
        let mut inbound_open = true;
        let mut unregister_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                peer = self.register_rx.recv(), if register_open => match peer {
                    Some(peer) => self.on_register(peer).await,
                    None => register_open = false,
                },

                inbound = self.inbound_rx.recv(), if inbound_open => match inbound {
                    Some(inbound) => self.process_message(inbound).await,
                    None => inbound_open = false,
                },

                peer = self.unregister_rx.recv(), if unregister_open => match peer {
                    Some(peer) => self.on_unregister(peer).await,
                    None => unregister_open = false,
                },

                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_timer(expired.into_inner()).await;
                }
            }

            if !(register_open || inbound_open || unregister_open) && self.timers.is_empty() {
                debug!("every hub handle dropped");
                break;
            }
        }

        info!("hub control loop stopped");
    }

    async fn on_register(&mut self, peer: Arc<Peer>) {
        debug!(
            conn_id = peer.conn_id(),
            peer_addr = %peer.remote_addr(),
            "peer connected"
        );
        self.registry
            .write()
            .await
            .connections
            .insert(peer.conn_id(), peer);
    }

    async fn on_unregister(&mut self, peer: Arc<Peer>) {
        let (connected, authenticated) = self.registry.write().await.remove(&peer);
        peer.close();

        if !connected && !authenticated {
            debug!(
                conn_id = peer.conn_id(),
                "unregister for unknown peer ignored"
            );
            return;
        }

        if authenticated {
            info!(
                conn_id = peer.conn_id(),
                user_id = peer.user_id().unwrap_or_default(),
                nickname = peer.nickname().unwrap_or_default(),
                "user went offline"
            );
            self.broadcast_user_offline(&peer).await;
            self.broadcast_user_list().await;
        }
    }

    /// Dispatches one inbound envelope by kind.
    async fn process_message(&mut self, inbound: Inbound) {
        let Inbound { peer, envelope } = inbound;

        match envelope.msg_type {
            MessageType::Auth => self.handle_auth(&peer, envelope).await,
            MessageType::Message | MessageType::File | MessageType::System => {
                self.handle_forward(&peer, envelope).await;
            }
            MessageType::Heartbeat => self.handle_heartbeat(&peer, &envelope).await,
            MessageType::UserList | MessageType::Unknown => {
                warn!(
                    conn_id = peer.conn_id(),
                    msg_type = ?envelope.msg_type,
                    "unhandled message type"
                );
            }
        }
    }

    async fn on_timer(&mut self, task: Scheduled) {
        match task {
            Scheduled::BroadcastUserList => {
                self.broadcast_user_list().await;
            }
        }
    }

    /// Queues `task` to run on the control loop after `delay`.
    pub(crate) fn schedule(&mut self, task: Scheduled, delay: Duration) {
        self.timers.insert(task, delay);
    }
}

/// Cloneable handle to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Arc<Peer>>,
    unregister_tx: mpsc::Sender<Arc<Peer>>,
    inbound_tx: mpsc::Sender<Inbound>,
    registry: Arc<RwLock<Registry>>,
}

impl HubHandle {
    /// Announces a newly accepted connection.
    pub async fn register(&self, peer: Arc<Peer>) {
        if self.register_tx.send(peer).await.is_err() {
            debug!("hub stopped, register dropped");
        }
    }

    /// Announces that a connection has gone away.
    pub async fn unregister(&self, peer: Arc<Peer>) {
        if self.unregister_tx.send(peer).await.is_err() {
            debug!("hub stopped, unregister dropped");
        }
    }

    /// Hands an inbound envelope to the control loop.
    ///
    /// Waits for queue space rather than dropping the envelope.
    pub async fn dispatch(&self, peer: Arc<Peer>, envelope: Envelope) {
        if self
            .inbound_tx
            .send(Inbound { peer, envelope })
            .await
            .is_err()
        {
            debug!("hub stopped, inbound envelope dropped");
        }
    }

    /// Number of authenticated users.
    pub async fn online_count(&self) -> usize {
        self.registry.read().await.by_id.len()
    }

    /// Number of live connections, authenticated or not.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Roster of authenticated users, oldest login first.
    pub async fn online_users(&self) -> Vec<UserInfo> {
        self.registry.read().await.users()
    }
}
