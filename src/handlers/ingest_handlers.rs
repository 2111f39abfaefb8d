//! `POST /chunks`: one audio chunk per request.
//!
//! Chunk metadata travels in headers, the raw audio in the body:
//!
//! - `X-Session-ID`: recording id chosen by the client
//! - `X-Chunk-Index`: 0-based sequence number
//! - `X-Chunk-Start-Time`, `X-Chunk-Duration`: whole seconds
//! - `X-Is-Final-Chunk`: `true` on the last chunk (default `false`)

use crate::{
    errors::AppError,
    handlers::auth::Owner,
    services::{
        ingest::{ChunkUpload, IngestReceipt},
        state::AppState,
    },
};
use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use std::str::FromStr;

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const START_TIME_HEADER: &str = "x-chunk-start-time";
pub const DURATION_HEADER: &str = "x-chunk-duration";
pub const FINAL_CHUNK_HEADER: &str = "x-is-final-chunk";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn required<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<T, AppError> {
    let raw = header_str(headers, name)
        .ok_or_else(|| AppError::bad_request(format!("missing header {}", name)))?;
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid header {}: `{}`", name, raw)))
}

/// Build a [`ChunkUpload`] from request headers and body.
pub fn parse_chunk(headers: &HeaderMap, body: Bytes) -> Result<ChunkUpload, AppError> {
    let session_id: String = required(headers, SESSION_ID_HEADER)?;
    let index: u32 = required(headers, CHUNK_INDEX_HEADER)?;
    let start_time_seconds: i64 = required(headers, START_TIME_HEADER)?;
    let duration_seconds: i64 = required(headers, DURATION_HEADER)?;
    let is_final = header_str(headers, FINAL_CHUNK_HEADER)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if start_time_seconds < 0 || duration_seconds < 0 {
        return Err(AppError::bad_request("chunk times must not be negative"));
    }
    if start_time_seconds.checked_add(duration_seconds).is_none() {
        return Err(AppError::bad_request("chunk end time is out of range"));
    }
    if body.is_empty() {
        return Err(AppError::bad_request("no audio data in request body"));
    }

    Ok(ChunkUpload {
        session_id,
        index,
        start_time_seconds,
        duration_seconds,
        is_final,
        body,
    })
}

pub async fn upload_chunk(
    State(state): State<AppState>,
    Owner(owner): Owner,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReceipt>, AppError> {
    let upload = parse_chunk(&headers, body)?;
    let receipt = state.ingest.ingest(&owner, upload).await?;
    Ok(Json(receipt))
}
