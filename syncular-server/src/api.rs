//! HTTP push/pull endpoints (spec §6). Authentication is header-based HMAC
//! (`X-Api-Key`/`X-Timestamp`/`X-Signature`), signed over the raw request
//! body, mirroring the teacher's `AuthHeader`-as-JSON-body pattern but
//! moved to headers since the body here is the push/pull payload itself.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use syncular_core::errors::ApiError;
use syncular_core::protocol::{PullRequest, PushRequest};
use syncular_core::snapshot::BlobStore;
use syncular_core::SyncResult;

use crate::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> SyncResult<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| ApiError::unauthorized(format!("missing {name} header")).into())
        .and_then(|v| {
            v.to_str()
                .map_err(|_| ApiError::bad_request(format!("malformed {name} header")).into())
        })
}

async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> SyncResult<uuid::Uuid> {
    let api_key = header_str(headers, "x-api-key")?;
    let timestamp: i64 = header_str(headers, "x-timestamp")?
        .parse()
        .map_err(|_| ApiError::bad_request("x-timestamp must be an integer"))?;
    let signature = header_str(headers, "x-signature")?;
    let body_str = std::str::from_utf8(body)
        .map_err(|_| ApiError::bad_request("request body must be valid UTF-8"))?;

    state
        .auth
        .verify_hmac(api_key, signature, timestamp, body_str)
        .await?
        .ok_or_else(|| ApiError::unauthorized("signature verification failed").into())
}

pub async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let actor_id = authenticate_request(&state, &headers, &body)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let request: PushRequest =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let response = state
        .push_engine
        .apply_push(state.default_partition, actor_id, &request)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(response))
}

pub async fn pull(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let actor_id = authenticate_request(&state, &headers, &body)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let request: PullRequest =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let response = state
        .pull_engine
        .run_pull(state.default_partition, actor_id, &request)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(response))
}

pub async fn snapshot_chunk(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(blob_hash): axum::extract::Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let body = state
        .blob_store
        .get(&blob_hash)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        body,
    ))
}
