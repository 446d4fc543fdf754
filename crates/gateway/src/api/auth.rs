//! Bearer-token auth middleware.
//!
//! When the configured token env var is set at startup, every protected
//! route requires `Authorization: Bearer <token>`. Tokens are compared as
//! SHA-256 digests in constant time. No token configured = dev mode.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use hub_domain::error::Error;

use super::error::ApiError;
use crate::state::AppState;

pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref expected_hash) = state.api_token_hash else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) => {
            let hash = Sha256::digest(token.as_bytes());
            if hash.ct_eq(expected_hash.as_slice()).into() {
                next.run(request).await
            } else {
                ApiError(Error::Authentication("invalid bearer token".into())).into_response()
            }
        }
        None => {
            ApiError(Error::Authentication("missing bearer token".into())).into_response()
        }
    }
}
