//! Authentication seam. The server only needs `token -> principal`; where
//! tokens come from is someone else's problem.

pub mod jwt;
pub mod middleware;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Roles allowed to raise notification events over HTTP.
pub const EVENT_PUBLISHER_ROLES: [&str; 2] = ["admin", "service"];

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub agency_id: Option<String>,
    pub role: String,
}

impl Principal {
    pub fn can_publish_events(&self) -> bool {
        EVENT_PUBLISHER_ROLES.contains(&self.role.as_str())
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<Principal, AuthError>;
}

pub use jwt::JwtVerifier;
