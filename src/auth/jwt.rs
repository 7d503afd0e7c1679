use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::{Principal, TokenVerifier};
use crate::error::AuthError;

/// Default lifetime of tokens issued by [`issue_access_token`].
pub const ACCESS_TOKEN_TTL_SECS: i64 = 900;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Tenant the user acts in, if any
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

fn default_role() -> String {
    "member".to_string()
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Principal {
            user_id: claims.sub,
            agency_id: claims.agency_id,
            role: claims.role,
        }
    }
}

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    std::fs::create_dir_all(data_dir)?;
    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an HS256 access token for a principal.
pub fn issue_access_token(
    secret: &[u8],
    principal: &Principal,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: principal.user_id.clone(),
        agency_id: principal.agency_id.clone(),
        role: principal.role.clone(),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate an access token and return its claims.
pub fn validate_access_token(
    secret: &[u8],
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

/// [`TokenVerifier`] for HS256 tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Arc<Vec<u8>>,
}

impl JwtVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret: Arc::new(secret),
        }
    }

    pub fn issue(&self, principal: &Principal, ttl_secs: i64) -> Result<String, jsonwebtoken::errors::Error> {
        issue_access_token(&self.secret, principal, ttl_secs)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify_token(&self, token: &str) -> Result<Principal, AuthError> {
        match validate_access_token(&self.secret, token) {
            Ok(claims) if claims.sub.is_empty() => Err(AuthError::Invalid("empty subject".into())),
            Ok(claims) => Ok(claims.into()),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            user_id: "u1".into(),
            agency_id: Some("ag1".into()),
            role: "member".into(),
        }
    }

    #[tokio::test]
    async fn issued_token_verifies() {
        let verifier = JwtVerifier::new(vec![7u8; 32]);
        let token = verifier.issue(&principal(), ACCESS_TOKEN_TTL_SECS).unwrap();
        assert_eq!(verifier.verify_token(&token).await.unwrap(), principal());
    }

    #[tokio::test]
    async fn expired_token_maps_to_expired() {
        let verifier = JwtVerifier::new(vec![7u8; 32]);
        // Well past the default validation leeway.
        let token = verifier.issue(&principal(), -3600).unwrap();
        assert!(matches!(verifier.verify_token(&token).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let token = issue_access_token(&[1u8; 32], &principal(), 60).unwrap();
        let verifier = JwtVerifier::new(vec![2u8; 32]);
        let err = verifier.verify_token(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
        assert_eq!(err.close_code(), 4002);
    }

    #[test]
    fn secret_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = load_or_generate_jwt_secret(path).unwrap();
        let second = load_or_generate_jwt_secret(path).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }
}
