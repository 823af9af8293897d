//! Roster and presence broadcasts.
//!
//! Each helper snapshots its targets under the registry read lock, releases
//! it, serializes once and then enqueues without blocking.

use std::sync::Arc;

use chatrelay_protocol::constants::{MessageType, SubType};
use chatrelay_protocol::envelope::Envelope;
use chatrelay_protocol::messages::{UserListPayload, UserPresence};
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::peer::Peer;

impl Hub {
    /// Sends the full roster to every authenticated peer.
    pub(crate) async fn broadcast_user_list(&self) -> usize {
        let (targets, users) = {
            let registry = self.registry.read().await;
            (registry.authenticated(), registry.users())
        };

        let payload = UserListPayload { users };
        let Some(data) = encode(MessageType::UserList, SubType::None, &payload) else {
            return 0;
        };
        let sent = fan_out(&targets, &data, None);
        debug!(
            users = payload.users.len(),
            sent,
            targets = targets.len(),
            "broadcast user list"
        );
        sent
    }

    /// Tells every other authenticated peer that `subject` came online.
    ///
    /// Returns how many peers the notice was queued for.
    pub(crate) async fn broadcast_user_online(&self, subject: &Arc<Peer>) -> usize {
        self.broadcast_presence(subject, SubType::UserOnline).await
    }

    /// Tells every other authenticated peer that `subject` went offline.
    /// Skipped if `subject` never logged in.
    pub(crate) async fn broadcast_user_offline(&self, subject: &Arc<Peer>) -> usize {
        self.broadcast_presence(subject, SubType::UserOffline).await
    }

    async fn broadcast_presence(&self, subject: &Arc<Peer>, sub_type: SubType) -> usize {
        let Some(identity) = subject.identity() else {
            return 0;
        };

        let targets = self.registry.read().await.authenticated();

        let payload = UserPresence {
            user_id: identity.user_id.clone(),
            nickname: identity.nickname.clone(),
        };
        let Some(data) = encode(MessageType::System, sub_type.clone(), &payload) else {
            return 0;
        };
        let sent = fan_out(&targets, &data, Some(subject));
        debug!(
            user_id = %identity.user_id,
            nickname = %identity.nickname,
            %sub_type,
            sent,
            "broadcast presence"
        );
        sent
    }
}

fn encode<T: serde::Serialize>(
    msg_type: MessageType,
    sub_type: SubType,
    payload: &T,
) -> Option<String> {
    match Envelope::with_payload(msg_type, sub_type, payload).and_then(|env| env.encode()) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("failed to encode broadcast: {e}");
            None
        }
    }
}

/// Queues `data` for every target except `skip`; returns the number queued.
fn fan_out(targets: &[Arc<Peer>], data: &str, skip: Option<&Arc<Peer>>) -> usize {
    targets
        .iter()
        .filter(|p| skip.is_none_or(|s| !Arc::ptr_eq(p, s)))
        .filter(|p| p.enqueue(data.to_owned()).is_ok())
        .count()
}
