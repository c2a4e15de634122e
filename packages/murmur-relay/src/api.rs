//! REST API handlers.
//!
//! HTTP endpoints supplementing the socket: message history fetch, the
//! public-key directory (publish / get / batch get), and profile upsert.
//! Identity on these routes comes from the authentication collaborator's
//! verified session token; the relay trusts the ids it is handed.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::state::RelayState;
use crate::store::{PublicKeyEntry, UserProfile};

// ── Request / Response Types ─────────────────────────────────────────────────

/// POST /api/messages
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub user_id: String,
    pub receiver_id: String,
}

/// POST /api/keys
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishKeyRequest {
    pub user_id: String,
    pub public_key: String,
    /// Unix millis when the key pair was generated; defaults to now.
    #[serde(default)]
    pub key_generated_at: Option<i64>,
}

/// POST /api/keys/batch
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchKeysRequest {
    pub user_ids: Vec<String>,
}

/// Generic API response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                ok: true,
                data: Some(data),
                error: None,
            }),
        )
    }
}

fn error_response<T: Serialize>(
    status: StatusCode,
    msg: &str,
) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        status,
        Json(ApiResponse {
            ok: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST /api/messages — fetch the full history between two users,
/// ascending by timestamp. Encrypted bodies come back as stored; the
/// client decrypts.
pub async fn get_messages(
    State(state): State<RelayState>,
    Json(req): Json<HistoryRequest>,
) -> impl IntoResponse {
    if req.user_id.is_empty() || req.receiver_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "userId and receiverId are required");
    }

    match state.store.conversation(&req.user_id, &req.receiver_id) {
        Ok(messages) => ApiResponse::success(messages),
        Err(e) => {
            tracing::error!(error = %e, "History query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load messages")
        }
    }
}

/// POST /api/keys — publish (or replace) a user's public key.
pub async fn publish_key(
    State(state): State<RelayState>,
    Json(req): Json<PublishKeyRequest>,
) -> impl IntoResponse {
    if req.user_id.is_empty() || req.public_key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "userId and publicKey are required",
        );
    }

    let generated_at = req
        .key_generated_at
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    match state
        .store
        .publish_key(&req.user_id, &req.public_key, generated_at)
    {
        Ok(()) => {
            tracing::info!(user_id = req.user_id.as_str(), "Public key published");
            ApiResponse::success(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to store public key");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store public key")
        }
    }
}

/// GET /api/keys/:user_id — fetch one user's published key.
/// 404 when the user has not published one.
pub async fn get_key(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.store.key(&user_id) {
        Ok(Some(entry)) => ApiResponse::success(entry),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "public key not found for user"),
        Err(e) => {
            tracing::error!(error = %e, "Key lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load public key")
        }
    }
}

/// POST /api/keys/batch — fetch several users' published keys. Users
/// without a published key are omitted from the mapping.
pub async fn get_keys(
    State(state): State<RelayState>,
    Json(req): Json<BatchKeysRequest>,
) -> impl IntoResponse {
    match state.store.keys(&req.user_ids) {
        Ok(keys) => ApiResponse::<HashMap<String, PublicKeyEntry>>::success(keys),
        Err(e) => {
            tracing::error!(error = %e, "Batch key lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load public keys")
        }
    }
}

/// PUT /api/users — create or update a user's public profile fields
/// (used to enrich delivered messages).
pub async fn upsert_profile(
    State(state): State<RelayState>,
    Json(profile): Json<UserProfile>,
) -> impl IntoResponse {
    if profile.user_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "userId is required");
    }

    match state.store.upsert_profile(&profile) {
        Ok(()) => ApiResponse::success(()),
        Err(e) => {
            tracing::error!(error = %e, "Profile upsert failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store profile")
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_formats() {
        let history: HistoryRequest =
            serde_json::from_str(r#"{"userId":"a","receiverId":"b"}"#).unwrap();
        assert_eq!(history.user_id, "a");
        assert_eq!(history.receiver_id, "b");

        let publish: PublishKeyRequest =
            serde_json::from_str(r#"{"userId":"a","publicKey":"k"}"#).unwrap();
        assert_eq!(publish.public_key, "k");
        assert!(publish.key_generated_at.is_none());

        let batch: BatchKeysRequest =
            serde_json::from_str(r#"{"userIds":["a","b"]}"#).unwrap();
        assert_eq!(batch.user_ids.len(), 2);
    }
}
