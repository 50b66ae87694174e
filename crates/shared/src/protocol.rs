use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::UserId;

/// Login/registration payload. Built when the user submits the form and
/// dropped as soon as the request resolves; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// The authenticated user as the server reports it. Optional fields default
/// when omitted so a minimal `{"id": .., "email": ..}` payload still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(rename = "id")]
    pub user_id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Response to an avatar upload. Carries only an acknowledgement; the updated
/// profile must be refetched separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarUploadResponse {
    pub status: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_user_parses_minimal_payload() {
        let user: SessionUser =
            serde_json::from_str(r#"{"id":1,"email":"a@b.com"}"#).expect("parse");
        assert_eq!(user.user_id, UserId(1));
        assert_eq!(user.email, "a@b.com");
        assert_eq!(user.username, None);
        assert_eq!(user.avatar_url, None);
        assert_eq!(user.created_at, None);
    }

    #[test]
    fn session_user_parses_full_profile() {
        let user: SessionUser = serde_json::from_str(
            r#"{
                "id": 7,
                "email": "carol@example.com",
                "username": "carol",
                "avatar_url": "https://cdn.example.com/avatars/7.png",
                "created_at": "2024-03-01T12:00:00Z"
            }"#,
        )
        .expect("parse");
        assert_eq!(user.username.as_deref(), Some("carol"));
        assert!(user.avatar_url.as_deref().is_some_and(|url| url.ends_with("7.png")));
        assert!(user.created_at.is_some());
    }
}
