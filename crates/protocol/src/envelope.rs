use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ProtocolError;
use crate::constants::{MessageType, SubType};
use crate::messages::{ErrorPayload, LoginRequest, LoginResponse, UserListPayload, UserPresence};

/// Free-form payload object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Envelope for all WebSocket communication.
///
/// The payload is kept as an open JSON object so relayed content passes
/// through untouched; [`Envelope::body`] gives the typed view for the
/// kinds the server itself understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "SubType::is_none"
    )]
    pub sub_type: SubType,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub from: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub group_id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,
}

/// Typed view of an envelope payload, keyed by `(type, sub_type)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Body<'a> {
    Login(LoginRequest),
    LoginResponse(LoginResponse),
    UserOnline(UserPresence),
    UserOffline(UserPresence),
    Error(ErrorPayload),
    UserList(UserListPayload),
    Ping,
    Pong,
    /// User content relayed as-is (`message`, `file`, other `system`).
    Relay(&'a Payload),
    Unknown,
}

impl Envelope {
    /// Creates an envelope stamped with the current time and an empty payload.
    pub fn new(msg_type: MessageType, sub_type: SubType) -> Self {
        Self {
            msg_type,
            sub_type,
            from: String::new(),
            to: Vec::new(),
            group_id: String::new(),
            timestamp: now_millis(),
            payload: Payload::new(),
        }
    }

    /// Creates an envelope whose payload is the serialized `payload`.
    ///
    /// Fails if `payload` does not serialize to a JSON object.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        sub_type: SubType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = match serde_json::to_value(payload).map_err(ProtocolError::Encode)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(ProtocolError::PayloadNotObject),
        };
        Ok(Self {
            payload,
            ..Self::new(msg_type, sub_type)
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
            .map_err(ProtocolError::Payload)
    }

    /// Interprets the payload according to the envelope's kind and sub-kind.
    pub fn body(&self) -> Result<Body<'_>, ProtocolError> {
        use MessageType as T;
        use SubType as S;

        Ok(match (self.msg_type, &self.sub_type) {
            (T::Auth, S::Login) => Body::Login(self.parse_payload()?),
            (T::Auth, S::LoginResponse) => Body::LoginResponse(self.parse_payload()?),
            (T::System, S::UserOnline) => Body::UserOnline(self.parse_payload()?),
            (T::System, S::UserOffline) => Body::UserOffline(self.parse_payload()?),
            (T::System, S::Error) => Body::Error(self.parse_payload()?),
            (T::UserList, _) => Body::UserList(self.parse_payload()?),
            (T::Heartbeat, S::Ping) => Body::Ping,
            (T::Heartbeat, S::Pong) => Body::Pong,
            (t, _) if t.is_relayed() => Body::Relay(&self.payload),
            _ => Body::Unknown,
        })
    }

    /// Decodes an envelope from JSON bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }

    /// Encodes the envelope as a JSON string.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Treats an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
