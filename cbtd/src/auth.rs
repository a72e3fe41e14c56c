//! HTTP basic authentication for ledger routes.

use crate::config::Credential;
use crate::http_api::AppState;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use tracing::debug;

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub operator: bool,
}

/// Decode an `Authorization: Basic ...` header value into (name, key).
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, key) = decoded.split_once(':')?;
    Some((name.to_string(), key.to_string()))
}

pub fn authenticate(credentials: &[Credential], name: &str, key: &str) -> Option<Caller> {
    credentials
        .iter()
        .find(|c| c.name == name && c.key == key)
        .map(|c| Caller {
            name: c.name.clone(),
            operator: c.operator,
        })
}

/// Reject requests without valid credentials.
pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth)
        .and_then(|(name, key)| authenticate(&state.credentials, &name, &key));

    match caller {
        Some(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        None => {
            debug!("Rejected unauthenticated request to {}", request.uri().path());
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"cbt\"")],
            )
                .into_response()
        }
    }
}
