//! src/storage/local.rs
//!
//! LocalObjectStore: S3-like object and multipart operations backed by the
//! local filesystem. Object payloads are sharded beneath
//! `base_path/{shard}/{shard}/{key}`; in-progress multipart uploads live in
//! `base_path/.multipart/{upload_id}/` until completed or aborted.
//!
//! Completion enforces the same minimum part size S3 does, so code that
//! works here does not silently rely on behavior S3 would reject.

use super::{CompletedPart, ObjectStore, S3_MIN_PART_SIZE, StorageError, StorageResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const UPLOAD_KEY_FILE: &str = "key";

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Smallest size accepted for any part but the last on completion.
    min_part_size: u64,
}

impl LocalObjectStore {
    /// Create a store rooted at `base_path` enforcing S3's 5 MiB part minimum.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_min_part_size(base_path, S3_MIN_PART_SIZE)
    }

    pub fn with_min_part_size(base_path: impl Into<PathBuf>, min_part_size: u64) -> Self {
        Self {
            base_path: base_path.into(),
            min_part_size,
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.starts_with(MULTIPART_DIR)
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Upload ids are generated here as UUIDs; anything else is unknown.
    fn upload_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::NoSuchUpload(upload_id.to_string()))?;
        Ok(self.base_path.join(MULTIPART_DIR).join(id.to_string()))
    }

    fn part_path(dir: &Path, part_number: i32) -> PathBuf {
        dir.join(format!("part-{:05}", part_number))
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Open the upload directory for `upload_id`, checking it targets `key`.
    async fn open_upload(&self, key: &str, upload_id: &str) -> StorageResult<PathBuf> {
        let dir = self.upload_dir(upload_id)?;
        let recorded = match fs::read_to_string(dir.join(UPLOAD_KEY_FILE)).await {
            Ok(recorded) => recorded,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NoSuchUpload(upload_id.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        if recorded != key {
            return Err(StorageError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(dir)
    }

    /// Write `data` to `path` via a temp file and rename.
    ///
    /// Ensures durable writes (fsync) and cleans up temp files on errors.
    async fn write_atomic(path: &Path, parts: &[Bytes]) -> StorageResult<String> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut digest = md5::Context::new();
        for data in parts {
            digest.consume(data);
            if let Err(err) = file.write_all(data).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        Ok(format!("{:x}", digest.compute()))
    }

    async fn read_object(&self, key: &str) -> StorageResult<Bytes> {
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    fn signature(key: &str, expires: i64) -> String {
        let digest = md5::compute(format!("{}:{}", key, expires));
        general_purpose::URL_SAFE_NO_PAD.encode(digest.0)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<String> {
        self.ensure_key_safe(key)?;
        let etag = Self::write_atomic(&self.object_path(key), &[body]).await?;
        debug!(key, etag = %etag, "stored object");
        Ok(etag)
    }

    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        self.ensure_key_safe(key)?;
        self.read_object(key).await
    }

    async fn head_object(&self, key: &str) -> StorageResult<u64> {
        self.ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.ensure_key_safe(key)?;
            let file_path = self.object_path(key);
            match fs::remove_file(&file_path).await {
                Ok(_) => debug!("removed physical file {}", file_path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("file {} already missing", file_path.display());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
            if let Some(parent) = file_path.parent() {
                self.prune_empty_dirs(parent, &self.base_path).await;
            }
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        self.ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(UPLOAD_KEY_FILE), key).await?;
        debug!(key, upload_id = %upload_id, "created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part_copy(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
    ) -> StorageResult<String> {
        self.ensure_key_safe(source_key)?;
        let dir = self.open_upload(dest_key, upload_id).await?;
        if part_number < 1 {
            return Err(StorageError::InvalidPart(part_number));
        }
        let data = self.read_object(source_key).await?;
        Self::write_atomic(&Self::part_path(&dir, part_number), &[data]).await
    }

    async fn upload_part(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String> {
        let dir = self.open_upload(dest_key, upload_id).await?;
        if part_number < 1 {
            return Err(StorageError::InvalidPart(part_number));
        }
        Self::write_atomic(&Self::part_path(&dir, part_number), &[body]).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let dir = self.open_upload(key, upload_id).await?;
        if parts.is_empty() {
            return Err(StorageError::InvalidPart(0));
        }

        let mut payloads = Vec::with_capacity(parts.len());
        let mut previous = 0;
        for (i, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StorageError::InvalidPart(part.part_number));
            }
            previous = part.part_number;

            let data = match fs::read(Self::part_path(&dir, part.part_number)).await {
                Ok(data) => Bytes::from(data),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::InvalidPart(part.part_number));
                }
                Err(err) => return Err(StorageError::Io(err)),
            };
            if format!("{:x}", md5::compute(&data)) != part.etag.trim_matches('"') {
                return Err(StorageError::InvalidPart(part.part_number));
            }
            let is_last = i + 1 == parts.len();
            if !is_last && (data.len() as u64) < self.min_part_size {
                return Err(StorageError::EntityTooSmall {
                    part_number: part.part_number,
                    size: data.len() as u64,
                    min: self.min_part_size,
                });
            }
            payloads.push(data);
        }

        Self::write_atomic(&self.object_path(key), &payloads).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(key, upload_id, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let dir = self.open_upload(key, upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(key, upload_id, "aborted multipart upload");
        Ok(())
    }

    async fn generate_presigned_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.ensure_key_safe(key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!(
            "file://{}?expires={}&signature={}",
            self.object_path(key).display(),
            expires,
            Self::signature(key, expires)
        ))
    }
}
