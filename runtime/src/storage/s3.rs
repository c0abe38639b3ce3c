//! S3-compatible object store.
//!
//! Small payloads go up with a single `PutObject`; anything larger than one
//! part uses a multipart upload, which S3 only exposes once
//! `CompleteMultipartUpload` succeeds. Failed uploads are aborted.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use mirror_core::config::StorageConfig;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};

use super::ObjectStore;
use crate::archive::ByteStream;

fn s3_error(action: &str, key: &str, err: impl std::fmt::Display) -> MirrorError {
    MirrorError::external("s3", format!("{} {} failed: {}", action, key, err))
}

/// Object store on S3 or an S3-compatible service.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    part_size: usize,
}

impl S3ObjectStore {
    /// Create a store from a pre-configured client.
    pub fn new(client: Client, bucket: impl Into<String>, part_size: usize) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            part_size,
        }
    }

    /// Build a client from configuration and the AWS default credential chain.
    pub async fn from_config(config: &StorageConfig, part_size: usize) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint) = config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Self::new(
            Client::from_conf(s3_config.build()),
            config.bucket.clone(),
            part_size,
        )
    }

    /// Read from `stream` until `part_size` bytes are buffered or the stream ends.
    async fn next_part(&self, stream: &mut ByteStream, key: &str) -> Result<(Vec<u8>, bool)> {
        let mut part = Vec::with_capacity(self.part_size.min(1024 * 1024));
        while part.len() < self.part_size {
            match stream.next().await {
                Some(Ok(chunk)) => part.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(s3_error("Upload", key, format!("source stream: {}", e))),
                None => return Ok((part, true)),
            }
        }
        Ok((part, false))
    }

    async fn put_single(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<u64> {
        let size = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata))
            .body(S3ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("PutObject", key, e))?;
        Ok(size)
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        stream: &mut ByteStream,
        metadata: HashMap<String, String>,
    ) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| s3_error("CreateMultipartUpload", key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| s3_error("CreateMultipartUpload", key, "no upload id returned"))?
            .to_string();

        let result = self.upload_parts(key, &upload_id, first, stream).await;
        match result {
            Ok((parts, size)) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| s3_error("CompleteMultipartUpload", key, e))?;
                Ok(size)
            }
            Err(e) => {
                tracing::warn!(key = %key, upload_id = %upload_id, error = %e, "Aborting multipart upload");
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Vec<u8>,
    ) -> Result<CompletedPart> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(S3ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("UploadPart", key, e))?;
        Ok(CompletedPart::builder()
            .set_e_tag(uploaded.e_tag().map(String::from))
            .part_number(number)
            .build())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        stream: &mut ByteStream,
    ) -> Result<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut size = 0u64;
        let mut part = first;
        let mut number = 1i32;
        let mut finished = false;

        loop {
            size += part.len() as u64;
            parts.push(self.upload_part(key, upload_id, number, part).await?);
            tracing::debug!(key = %key, part = number, total = size, "Uploaded part");
            if finished {
                break;
            }

            let (next, done) = self.next_part(stream, key).await?;
            finished = done;
            if next.is_empty() {
                break;
            }
            part = next;
            number += 1;
        }

        Ok((parts, size))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_stream(
        &self,
        ctx: &OperationContext,
        key: &str,
        mut stream: ByteStream,
        metadata: HashMap<String, String>,
    ) -> Result<u64> {
        ctx.run("s3 upload", async {
            let (first, finished) = self.next_part(&mut stream, key).await?;
            let size = if finished {
                self.put_single(key, first, metadata).await?
            } else {
                self.put_multipart(key, first, &mut stream, metadata).await?
            };
            tracing::info!(bucket = %self.bucket, key = %key, size, "Uploaded object");
            Ok(size)
        })
        .await
    }

    async fn get_stream(&self, ctx: &OperationContext, key: &str) -> Result<ByteStream> {
        let response = ctx
            .run("s3 download", async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                            MirrorError::NotFound(format!("Object {}/{}", self.bucket, key))
                        } else {
                            s3_error("GetObject", key, e)
                        }
                    })
            })
            .await?;

        let body = response.body;
        let stream = futures::stream::unfold(body, |mut body| async move {
            match body.next().await {
                Some(Ok(chunk)) => Some((Ok::<Bytes, io::Error>(chunk), body)),
                Some(Err(e)) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), body)),
                None => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn exists(&self, ctx: &OperationContext, key: &str) -> Result<bool> {
        ctx.run("s3 head", async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                        Ok(false)
                    } else {
                        Err(s3_error("HeadObject", key, e))
                    }
                }
            }
        })
        .await
    }

    async fn delete(&self, ctx: &OperationContext, key: &str) -> Result<()> {
        ctx.run("s3 delete", async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| s3_error("DeleteObject", key, e))?;
            Ok(())
        })
        .await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| MirrorError::ConfigError(format!("Invalid presign TTL: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| s3_error("Presign", key, e))?;
        Ok(request.uri().to_string())
    }
}
