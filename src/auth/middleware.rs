use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use std::sync::Arc;

use crate::auth::{Principal, TokenVerifier};

/// Token verifier stored in request extensions for the [`Principal`] extractor.
#[derive(Clone)]
pub struct VerifierExt(pub Arc<dyn TokenVerifier>);

/// Extracts the caller from an `Authorization: Bearer` header.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let verifier = parts
            .extensions
            .get::<VerifierExt>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        verifier.0.verify_token(&token).await.map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            StatusCode::UNAUTHORIZED
        })
    }
}
