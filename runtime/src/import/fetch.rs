//! Downloading export payloads from a URL.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};

use crate::archive::ByteStream;
use crate::storage::{MemoryObjectStore, ObjectStore};

/// Opens a payload URL as a byte stream.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, ctx: &OperationContext, url: &str) -> Result<ByteStream>;
}

/// Fetches presigned HTTP(S) URLs.
pub struct HttpPayloadFetcher {
    http: reqwest::Client,
}

impl HttpPayloadFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| MirrorError::ConfigError(format!("Failed to build payload client: {}", e)))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, ctx: &OperationContext, url: &str) -> Result<ByteStream> {
        let response = ctx
            .run("payload download", async {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| MirrorError::external("payload", format!("GET {} failed: {}", redact(url), e)))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(MirrorError::external(
                        "payload",
                        format!("GET {} returned {}", redact(url), status),
                    ));
                }
                Ok(response)
            })
            .await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl PayloadFetcher for MemoryObjectStore {
    async fn fetch(&self, ctx: &OperationContext, url: &str) -> Result<ByteStream> {
        let key = self
            .key_from_url(url)
            .ok_or_else(|| MirrorError::InvalidRequest(format!("Unsupported payload URL {}", url)))?;
        self.get_stream(ctx, key).await
    }
}

/// Drop the query string, which carries presigned credentials.
fn redact(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::collect_stream;

    #[test]
    fn test_redact_strips_query() {
        assert_eq!(
            redact("https://s3.local/b/k.tar.gz?X-Amz-Signature=abc"),
            "https://s3.local/b/k.tar.gz"
        );
        assert_eq!(redact("https://s3.local/b/k"), "https://s3.local/b/k");
    }

    #[tokio::test]
    async fn test_memory_store_fetches_own_urls() {
        let store = MemoryObjectStore::new("exports");
        store.insert("a/b.tar.gz", &b"payload"[..]);
        let ctx = OperationContext::unbounded();

        let url = store.presign_get("a/b.tar.gz", Duration::from_secs(60)).await.unwrap();
        let data = collect_stream(store.fetch(&ctx, &url).await.unwrap()).await.unwrap();
        assert_eq!(data, b"payload");

        let err = store.fetch(&ctx, "memory://other/a/b.tar.gz").await.err().unwrap();
        assert!(matches!(err, MirrorError::InvalidRequest(_)));
    }
}
