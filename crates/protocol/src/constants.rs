use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inactivity deadline applied to every read.
///
/// Any inbound frame (including the pong answering our own ping) refreshes
/// it. A peer that stays silent longer than this is considered dead.
pub const WS_READ_WAIT: Duration = Duration::from_secs(120);

/// Time allowed to write one (possibly batched) frame.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// How often the write pump sends a transport-level ping.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// Maximum inbound message size in bytes (16 MB, room for file chunks).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Path the WebSocket endpoint is served on.
pub const WS_PATH: &str = "/ws";

/// Default TCP port of the relay server.
pub const DEFAULT_PORT: u16 = 9090;

/// Capacity of each peer's outbound queue.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Capacity of the hub's inbound event queues.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Delay before the full user list is rebroadcast after a login, so the new
/// client sees its login response first.
pub const ROSTER_BROADCAST_DELAY: Duration = Duration::from_millis(50);

/// Extra user-list rebroadcast after an online notice reached other peers.
pub const ROSTER_RESYNC_DELAY: Duration = Duration::from_millis(100);

/// Envelope kind (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "system")]
    System,
    #[serde(rename = "userlist")]
    UserList,
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// Forward compatibility: unknown kinds deserialize here and are
    /// rejected by the dispatcher, not by the decoder.
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for kinds relayed verbatim between users.
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Message | Self::File | Self::System)
    }
}

/// Envelope sub-kind (`sub_type` on the wire).
///
/// Relayed kinds may carry any sub-kind, so unrecognised values are kept
/// verbatim in [`SubType::Other`] and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubType {
    /// No sub-kind (omitted on the wire).
    #[default]
    None,
    Login,
    LoginResponse,
    Text,
    Image,
    FileMeta,
    FileChunk,
    FileComplete,
    UserOnline,
    UserOffline,
    Error,
    Ping,
    Pong,
    Other(String),
}

impl SubType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "",
            Self::Login => "login",
            Self::LoginResponse => "login_response",
            Self::Text => "text",
            Self::Image => "image",
            Self::FileMeta => "file_meta",
            Self::FileChunk => "file_chunk",
            Self::FileComplete => "file_complete",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Other(s) => s,
        }
    }

    pub fn is_none(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl From<&str> for SubType {
    fn from(s: &str) -> Self {
        match s {
            "" => Self::None,
            "login" => Self::Login,
            "login_response" => Self::LoginResponse,
            "text" => Self::Text,
            "image" => Self::Image,
            "file_meta" => Self::FileMeta,
            "file_chunk" => Self::FileChunk,
            "file_complete" => Self::FileComplete,
            "user_online" => Self::UserOnline,
            "user_offline" => Self::UserOffline,
            "error" => Self::Error,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for SubType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<SubType> for String {
    fn from(sub: SubType) -> Self {
        match sub {
            SubType::Other(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in `system/error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    NotAuthenticated,
    UserNotFound,
    NicknameExists,
    FileTooLarge,
    InvalidRecipient,
}
