use serde::{Deserialize, Serialize};

use crate::constants::ErrorCode;

// ---------------------------------------------------------------------------
// Client → server payloads
// ---------------------------------------------------------------------------

/// `auth/login`: claims a display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub nickname: String,
}

// ---------------------------------------------------------------------------
// Server → client payloads
// ---------------------------------------------------------------------------

/// `auth/login_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl LoginResponse {
    pub fn accepted(user_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            success: true,
            user_id: Some(user_id.into()),
            nickname: Some(nickname.into()),
            message: "login successful".into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            user_id: None,
            nickname: None,
            message: message.into(),
        }
    }
}

/// One entry of the online roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub nickname: String,
    /// Login time in milliseconds since the Unix epoch.
    pub login_time: i64,
}

/// `userlist`: the full roster of authenticated users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserListPayload {
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

/// `system/user_online` and `system/user_offline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub nickname: String,
}

/// `system/error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}
