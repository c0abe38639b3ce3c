//! In-process object store for development and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use parking_lot::RwLock;

use super::ObjectStore;
use crate::archive::{once_stream, ByteStream};

/// URL scheme returned by [`MemoryObjectStore::presign_get`].
pub const MEMORY_URL_SCHEME: &str = "memory://";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: HashMap<String, String>,
}

/// Object store backed by a map.
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Store bytes directly.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                metadata: HashMap::new(),
            },
        );
    }

    /// Read a whole object.
    pub fn get_bytes(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    /// User metadata recorded with an object.
    pub fn object_metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.read().get(key).map(|o| o.metadata.clone())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve a URL produced by [`ObjectStore::presign_get`] back to its key.
    pub fn key_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        let rest = url.strip_prefix(MEMORY_URL_SCHEME)?;
        let (bucket, key) = rest.split_once('/')?;
        (bucket == self.bucket).then_some(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
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
        let data = ctx
            .run("memory upload", async {
                let mut data = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| {
                        MirrorError::external("storage", format!("Upload of {} aborted: {}", key, e))
                    })?;
                    data.extend_from_slice(&chunk);
                }
                Ok(data)
            })
            .await?;

        let size = data.len() as u64;
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                metadata,
            },
        );
        tracing::debug!(bucket = %self.bucket, key = %key, size, "Stored object");
        Ok(size)
    }

    async fn get_stream(&self, ctx: &OperationContext, key: &str) -> Result<ByteStream> {
        ctx.check("memory download")?;
        let data = self
            .get_bytes(key)
            .ok_or_else(|| MirrorError::NotFound(format!("Object {}/{}", self.bucket, key)))?;
        Ok(once_stream(data))
    }

    async fn exists(&self, ctx: &OperationContext, key: &str) -> Result<bool> {
        ctx.check("memory head")?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, ctx: &OperationContext, key: &str) -> Result<()> {
        ctx.check("memory delete")?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, _ttl: Duration) -> Result<String> {
        Ok(format!("{}{}/{}", MEMORY_URL_SCHEME, self.bucket, key))
    }
}
