//! User model served by the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Builds a new user with a fresh id. Input is trimmed; the email keeps
    /// its case for display but compares case-insensitively elsewhere.
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> String {
        user_cache_key(self.id)
    }
}

pub fn user_cache_key(id: Uuid) -> String {
    format!("user:{id}")
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

impl CreateUserRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.username.trim().is_empty() {
            return Err("username is required".into());
        }
        let email = self.email.trim();
        if email.is_empty() {
            return Err("email is required".into());
        }
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(format!("invalid email address: {email}")),
        }
    }
}
