//! Protocol handlers run by the hub control loop.
//!
//! These execute one at a time inside [`Hub::run`], so reading the
//! registry and then writing it is race-free without further locking.

use std::sync::Arc;

use chatrelay_protocol::constants::{ErrorCode, MessageType, SubType};
use chatrelay_protocol::envelope::{Envelope, now_millis};
use chatrelay_protocol::messages::{ErrorPayload, LoginRequest, LoginResponse};
use tracing::{debug, info, warn};

use crate::hub::{Hub, Scheduled};
use crate::peer::{Identity, Peer};

impl Hub {
    pub(crate) async fn handle_auth(&mut self, peer: &Arc<Peer>, envelope: Envelope) {
        if envelope.sub_type != SubType::Login {
            debug!(
                conn_id = peer.conn_id(),
                sub_type = %envelope.sub_type,
                "ignoring auth envelope"
            );
            return;
        }

        let nickname = match envelope.parse_payload::<LoginRequest>() {
            Ok(req) if !req.nickname.is_empty() => req.nickname,
            _ => {
                send_error(peer, ErrorCode::InvalidMessage, "nickname must not be empty").await;
                return;
            }
        };
        self.handle_login(peer, nickname).await;
    }

    async fn handle_login(&mut self, peer: &Arc<Peer>, nickname: String) {
        if peer.is_authenticated() {
            send_error(peer, ErrorCode::InvalidMessage, "already logged in").await;
            return;
        }

        if self.registry.read().await.by_name.contains_key(&nickname) {
            debug!(conn_id = peer.conn_id(), %nickname, "nickname taken");
            let response = LoginResponse::rejected("nickname already in use");
            send_payload(peer, MessageType::Auth, SubType::LoginResponse, &response).await;
            return;
        }

        let identity = Identity {
            user_id: uuid::Uuid::new_v4().to_string(),
            nickname,
            login_time: now_millis(),
        };
        let (user_id, nickname) = (identity.user_id.clone(), identity.nickname.clone());
        if !peer.authenticate(identity) {
            return;
        }

        {
            let mut registry = self.registry.write().await;
            registry.by_id.insert(user_id.clone(), Arc::clone(peer));
            registry.by_name.insert(nickname.clone(), Arc::clone(peer));
        }
        info!(
            conn_id = peer.conn_id(),
            peer_addr = %peer.remote_addr(),
            %user_id,
            %nickname,
            "user logged in"
        );

        let response = LoginResponse::accepted(user_id, nickname);
        send_payload(peer, MessageType::Auth, SubType::LoginResponse, &response).await;

        let reached = self.broadcast_user_online(peer).await;
        self.schedule(Scheduled::BroadcastUserList, self.config.roster_delay);
        if reached > 0 {
            self.schedule(Scheduled::BroadcastUserList, self.config.resync_delay);
        }
    }

    pub(crate) async fn handle_forward(&self, sender: &Arc<Peer>, mut envelope: Envelope) {
        let Some(sender_id) = sender.user_id() else {
            send_error(sender, ErrorCode::NotAuthenticated, "not authenticated").await;
            return;
        };

        // Never trust a client-declared sender.
        envelope.from = sender_id.to_owned();

        if envelope.to.is_empty() {
            send_error(sender, ErrorCode::InvalidRecipient, "recipient list is empty").await;
            return;
        }

        let data = match envelope.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(conn_id = sender.conn_id(), "failed to encode forwarded envelope: {e}");
                return;
            }
        };

        let targets: Vec<(&str, Option<Arc<Peer>>)> = {
            let registry = self.registry.read().await;
            envelope
                .to
                .iter()
                .filter(|id| id.as_str() != sender_id)
                .map(|id| (id.as_str(), registry.by_id.get(id).cloned()))
                .collect()
        };

        let mut delivered = 0;
        for (target_id, target) in &targets {
            match target {
                Some(peer) => {
                    if peer.enqueue(data.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                None => debug!(target_id, "recipient not found"),
            }
        }

        debug!(
            from = sender_id,
            msg_type = ?envelope.msg_type,
            sub_type = %envelope.sub_type,
            delivered,
            requested = envelope.to.len(),
            "forwarded envelope"
        );
    }

    pub(crate) async fn handle_heartbeat(&self, peer: &Arc<Peer>, envelope: &Envelope) {
        if envelope.sub_type == SubType::Ping {
            peer.send(&Envelope::new(MessageType::Heartbeat, SubType::Pong))
                .await;
        }
    }
}

async fn send_payload<T: serde::Serialize>(
    peer: &Peer,
    msg_type: MessageType,
    sub_type: SubType,
    payload: &T,
) {
    match Envelope::with_payload(msg_type, sub_type, payload) {
        Ok(env) => peer.send(&env).await,
        Err(e) => warn!(conn_id = peer.conn_id(), "failed to build envelope: {e}"),
    }
}

/// Sends a `system/error` envelope to `peer`.
async fn send_error(peer: &Peer, code: ErrorCode, message: &str) {
    debug!(conn_id = peer.conn_id(), ?code, message, "rejecting client request");
    let payload = ErrorPayload {
        code,
        message: message.to_owned(),
    };
    send_payload(peer, MessageType::System, SubType::Error, &payload).await;
}
