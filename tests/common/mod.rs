// Shared fixtures for the HTTP integration tests: an app wired to an
// in-memory database and a disk-backed object store that records every
// call and can be told to fail a specific one.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode},
};
use recording_ingest::{
    app,
    config::{AppConfig, Args, IngestSettings},
    db,
    services::state::AppState,
    storage::{CompletedPart, LocalObjectStore, ObjectStore, StorageError, StorageResult},
};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub key: String,
    pub part_number: Option<i32>,
    pub source: Option<String>,
}

/// Wraps [`LocalObjectStore`], recording calls and injecting failures.
pub struct RecordingStore {
    inner: LocalObjectStore,
    calls: Mutex<Vec<Call>>,
    /// `(op, key substring)` that should fail.
    fail: Mutex<Option<(&'static str, String)>>,
}

impl RecordingStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_on(&self, op: &'static str, key_contains: &str) {
        *self.fail.lock().unwrap() = Some((op, key_contains.to_string()));
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        *self.fail.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(
        &self,
        op: &'static str,
        key: &str,
        part_number: Option<i32>,
        source: Option<&str>,
    ) -> StorageResult<()> {
        self.calls.lock().unwrap().push(Call {
            op,
            key: key.to_string(),
            part_number,
            source: source.map(str::to_string),
        });
        match &*self.fail.lock().unwrap() {
            Some((fail_op, needle))
                if *fail_op == op
                    && (key.contains(needle.as_str())
                        || source.is_some_and(|s| s.contains(needle.as_str()))) =>
            {
                Err(StorageError::backend(format!("injected {op} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<String> {
        self.record("put_object", key, None, None)?;
        self.inner.put_object(key, body).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        self.record("get_object", key, None, None)?;
        self.inner.get_object(key).await
    }

    async fn head_object(&self, key: &str) -> StorageResult<u64> {
        self.record("head_object", key, None, None)?;
        self.inner.head_object(key).await
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.record("delete_objects", key, None, None)?;
        }
        self.inner.delete_objects(keys).await
    }

    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        self.record("create_multipart_upload", key, None, None)?;
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part_copy(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
    ) -> StorageResult<String> {
        self.record("upload_part_copy", dest_key, Some(part_number), Some(source_key))?;
        self.inner
            .upload_part_copy(dest_key, upload_id, part_number, source_key)
            .await
    }

    async fn upload_part(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String> {
        self.record("upload_part", dest_key, Some(part_number), None)?;
        self.inner
            .upload_part(dest_key, upload_id, part_number, body)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.record("complete_multipart_upload", key, None, None)?;
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.record("abort_multipart_upload", key, None, None)?;
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn generate_presigned_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.record("generate_presigned_url", key, None, None)?;
        self.inner.generate_presigned_url(key, ttl).await
    }
}

pub struct TestApp {
    pub dir: TempDir,
    pub cfg: AppConfig,
    pub state: AppState,
    pub router: Router,
    pub store: Arc<RecordingStore>,
    pub token: String,
}

/// Default pipeline settings with S3's real limits.
pub fn settings() -> IngestSettings {
    IngestSettings::default()
}

pub async fn spawn_app(ingest: IngestSettings) -> Result<TestApp> {
    let dir = TempDir::new()?;
    let (mut cfg, _) = AppConfig::resolve(Args::default(), |_| None)?;
    cfg.ingest = ingest;

    let db = Arc::new(db::memory().await?);
    let store = Arc::new(RecordingStore::new(LocalObjectStore::with_min_part_size(
        dir.path(),
        cfg.ingest.min_part_size_bytes,
    )));
    let state = AppState::new(db, store.clone(), &cfg);
    let token = state.tokens.issue("alice").await?;
    let router = app(state.clone(), cfg.max_chunk_bytes);

    Ok(TestApp {
        dir,
        cfg,
        state,
        router,
        store,
        token,
    })
}

pub struct ChunkReq<'a> {
    pub session_id: &'a str,
    pub index: u32,
    pub size: usize,
    pub is_final: bool,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok((status, body))
    }

    /// Deliver a chunk of `size` bytes filled with a byte derived from its index.
    pub async fn chunk_as(&self, token: &str, req: ChunkReq<'_>) -> Result<(StatusCode, Value)> {
        let fill = b'a' + (req.index % 26) as u8;
        let request = Request::post("/chunks")
            .header("authorization", format!("Bearer {}", token))
            .header("x-session-id", req.session_id)
            .header("x-chunk-index", req.index.to_string())
            .header("x-chunk-start-time", (req.index * 60).to_string())
            .header("x-chunk-duration", "60")
            .header("x-is-final-chunk", if req.is_final { "true" } else { "false" })
            .body(Body::from(vec![fill; req.size]))?;
        self.send(request).await
    }

    pub async fn chunk(
        &self,
        session_id: &str,
        index: u32,
        size: usize,
        is_final: bool,
    ) -> Result<(StatusCode, Value)> {
        self.chunk_as(
            &self.token,
            ChunkReq {
                session_id,
                index,
                size,
                is_final,
            },
        )
        .await
    }

    /// Deliver every size in order, the last one marked final.
    pub async fn upload_all(&self, session_id: &str, sizes: &[usize]) -> Result<(StatusCode, Value)> {
        let mut last = (StatusCode::OK, Value::Null);
        for (index, size) in sizes.iter().enumerate() {
            last = self
                .chunk(session_id, index as u32, *size, index + 1 == sizes.len())
                .await?;
            if !last.0.is_success() {
                break;
            }
        }
        Ok(last)
    }

    pub async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let request = Request::get(path)
            .header("authorization", format!("Bearer {}", self.token))
            .body(Body::empty())?;
        self.send(request).await
    }

    pub async fn post(&self, path: &str, json: Option<Value>) -> Result<(StatusCode, Value)> {
        let builder = Request::post(path).header("authorization", format!("Bearer {}", self.token));
        let request = match json {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json)?))?,
            None => builder.body(Body::empty())?,
        };
        self.send(request).await
    }
}
