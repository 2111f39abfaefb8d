//! S3 backend for the object store trait.

use super::{CompletedPart, ObjectStore, StorageError, StorageResult};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client as S3Client,
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, Delete, ObjectIdentifier},
};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// S3 limits a single DeleteObjects request to 1000 keys.
const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS configuration.
    ///
    /// Path-style addressing is forced so S3-compatible endpoints (MinIO,
    /// LocalStack) work when `endpoint` is given.
    pub async fn connect(
        bucket: impl Into<String>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region));
        }
        let config = config_loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&config).force_path_style(true);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::new(S3Client::from_conf(builder.build()), bucket)
    }
}

fn backend_error<E>(op: &str, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::backend(format!("S3 {} failed: {}", op, DisplayErrorContext(&err)))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<String> {
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend_error("put_object", e))?;
        Ok(resp.e_tag().unwrap_or_default().to_string())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(backend_error("get_object", err)),
        };
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| backend_error("get_object body", e))?;
        Ok(body.into_bytes())
    }

    async fn head_object(&self, key: &str) -> StorageResult<u64> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(u64::try_from(resp.content_length().unwrap_or(0)).unwrap_or(0)),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(backend_error("head_object", err)),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| backend_error("delete_objects", e))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| backend_error("delete_objects", e))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| backend_error("delete_objects", e))?;
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("create_multipart_upload", e))?;
        let upload_id = resp
            .upload_id()
            .ok_or_else(|| StorageError::backend("no upload_id in create_multipart_upload response"))?
            .to_string();
        debug!(bucket = %self.bucket, key, upload_id = %upload_id, "created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part_copy(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
    ) -> StorageResult<String> {
        let resp = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(dest_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .send()
            .await
            .map_err(|e| backend_error("upload_part_copy", e))?;
        resp.copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or_else(|| StorageError::backend("no ETag in upload_part_copy response"))
    }

    async fn upload_part(
        &self,
        dest_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(dest_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend_error("upload_part", e))?;
        resp.e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::backend("no ETag in upload_part response"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let parts = parts
            .iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| backend_error("complete_multipart_upload", e))?;

        debug!(bucket = %self.bucket, key, upload_id, "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => {
                debug!(bucket = %self.bucket, key, upload_id, "aborted multipart upload");
                Ok(())
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_upload()) => {
                Err(StorageError::NoSuchUpload(upload_id.to_string()))
            }
            Err(err) => Err(backend_error("abort_multipart_upload", err)),
        }
    }

    async fn generate_presigned_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        let presigning = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|e| backend_error("presigning config", e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| backend_error("presign get_object", e))?;
        Ok(request.uri().to_string())
    }
}
