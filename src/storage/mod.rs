//! Object store abstraction used for chunk objects and final recordings.
//!
//! The surface mirrors the subset of the S3 API the pipeline needs:
//! whole-object put/get/head/delete, the multipart upload family including
//! server-side part copy, and presigned download URLs.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::{io, time::Duration};
use thiserror::Error;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

/// S3's lower bound for every multipart part except the last.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("multipart upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("part {part_number} is {size} bytes, below the {min} byte minimum")]
    EntityTooSmall {
        part_number: i32,
        size: u64,
        min: u64,
    },
    #[error("invalid part {0}")]
    InvalidPart(i32),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object store error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        StorageError::Backend(msg.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A part listed when completing a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Operations the ingest pipeline issues against blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` as the whole object at `key`, returning its ETag.
    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<String>;

    async fn get_object(&self, key: &str) -> StorageResult<Bytes>;

    /// Size of the object at `key` in bytes.
    async fn head_object(&self, key: &str) -> StorageResult<u64>;

    /// Delete every listed key; missing keys are not an error.
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()>;

    /// Start a multipart upload targeting `key`, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String>;

    /// Append the existing object `source_key` as part `part_number` without
    /// moving its bytes through this process.
    async fn upload_part_copy(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
    ) -> StorageResult<String>;

    async fn upload_part(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Time-limited GET URL for handing an object to an external service.
    async fn generate_presigned_url(&self, key: &str, ttl: Duration) -> StorageResult<String>;
}

/// Lowercase, `[a-z0-9_-]` only, at most 50 characters, never empty.
pub fn sanitize_owner(owner: &str) -> String {
    let safe: String = owner
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
        .take(50)
        .collect();
    if safe.is_empty() { "user".into() } else { safe }
}

/// Key of the standalone object holding one chunk's bytes.
pub fn chunk_key(owner: &str, session_id: &str, index: u32) -> String {
    format!(
        "chunks/{}/{}/chunk_{}.bin",
        sanitize_owner(owner),
        session_id,
        index
    )
}

/// Key of the reassembled recording.
pub fn final_key(owner: &str, session_id: &str) -> String {
    format!(
        "recordings/{}/{}/complete.bin",
        sanitize_owner(owner),
        session_id
    )
}
