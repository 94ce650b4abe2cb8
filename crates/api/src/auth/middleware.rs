//! Authentication middleware for Axum
//!
//! `require_tool_key` resolves a vendor Bearer key to its tool row by
//! peppered hash and attaches [`AuthTool`] to the request.
//! `require_collaborator_signature` verifies the `X-1Sub-Signature`
//! header over the raw body before any JSON parsing happens.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use onesub_billing::crypto::{self, SIGNATURE_HEADER};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Prefix carried by every issued vendor API key.
pub const API_KEY_PREFIX: &str = "sk-tool-";

/// Largest collaborator body the signature guard will buffer.
const MAX_SIGNED_BODY_BYTES: usize = 256 * 1024;

/// The authenticated vendor tool, inserted into request extensions by
/// [`require_tool_key`].
#[derive(Debug, Clone)]
pub struct AuthTool {
    pub id: Uuid,
    pub name: String,
}

#[derive(FromRow)]
struct ToolRow {
    id: Uuid,
    name: String,
    status: String,
}

/// Extract a Bearer token from the Authorization header.
pub fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}

/// Guard for vendor endpoints: resolves the Bearer API key to a tool row
/// and requires the tool to be active. Paused or delisted tools are
/// rejected the same way as unknown keys.
pub async fn require_tool_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(api_key) = extract_bearer_token(&request) else {
        return ApiError::Unauthorized.into_response();
    };

    if !api_key.starts_with(API_KEY_PREFIX) {
        tracing::warn!("API key with unknown prefix rejected");
        return ApiError::Unauthorized.into_response();
    }

    // Only the peppered hash ever touches the database or the logs.
    let key_hash = crypto::hash_api_key(&state.config.api_key_hmac_secret, &api_key);
    let key_prefix: String = api_key.chars().take(12).collect();

    let tool: Option<ToolRow> =
        match sqlx::query_as("SELECT id, name, status FROM tools WHERE api_key_hash = $1")
            .bind(&key_hash)
            .fetch_optional(&state.pool)
            .await
        {
            Ok(row) => row,
            Err(err) => {
                tracing::error!(error = %err, "tool lookup failed");
                return ApiError::Internal.into_response();
            }
        };

    match tool {
        Some(tool) if tool.status == "active" => {
            tracing::debug!(tool_id = %tool.id, "API key authenticated");
            request.extensions_mut().insert(AuthTool {
                id: tool.id,
                name: tool.name,
            });
            next.run(request).await
        }
        Some(tool) => {
            tracing::warn!(tool_id = %tool.id, status = %tool.status, "inactive tool rejected");
            ApiError::Unauthorized.into_response()
        }
        None => {
            tracing::warn!(key_prefix = %key_prefix, "unknown API key");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Guard for payment-collaborator endpoints: verifies the signature header
/// over the raw request body, then replays the buffered body to the
/// handler. GET requests sign the empty body.
pub async fn require_collaborator_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(signature) = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
    else {
        tracing::warn!("collaborator request without signature header");
        return ApiError::Unauthorized.into_response();
    };

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer signed request body");
            return ApiError::Validation("request body unreadable".to_string()).into_response();
        }
    };

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if let Err(err) =
        crypto::verify_signature(&signature, &state.config.checkout_webhook_secret, &bytes, now)
    {
        tracing::warn!(error = %err, "collaborator signature rejected");
        return ApiError::Unauthorized.into_response();
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}
