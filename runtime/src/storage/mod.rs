//! Object storage for export archives and imported blobs.
//!
//! Objects are write-once: an upload becomes visible only after its stream
//! ended cleanly, so an aborted upload never leaves a readable object behind.

mod memory;
mod s3;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mirror_core::context::OperationContext;
use mirror_core::error::Result;

use crate::archive::ByteStream;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// S3-compatible object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket every key of this store lives in.
    fn bucket(&self) -> &str;

    /// Upload `stream` to `key`. Returns the number of bytes stored.
    ///
    /// The object must not become readable unless the stream ends without error.
    async fn put_stream(
        &self,
        ctx: &OperationContext,
        key: &str,
        stream: ByteStream,
        metadata: HashMap<String, String>,
    ) -> Result<u64>;

    /// Stream an object's bytes.
    async fn get_stream(&self, ctx: &OperationContext, key: &str) -> Result<ByteStream>;

    /// Whether an object exists at `key`.
    async fn exists(&self, ctx: &OperationContext, key: &str) -> Result<bool>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, ctx: &OperationContext, key: &str) -> Result<()>;

    /// URL granting time-limited read access to `key`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Key of a compressed image export.
pub fn image_export_key(model_id: &str, image_name: &str, tag: &str) -> String {
    format!(
        "beta/registry/{}/{}/blobs/compressed/{}.tar.gz",
        model_id, image_name, tag
    )
}

/// Key of a model-card/release documents bundle.
pub fn documents_export_key(model_id: &str, export_id: &str) -> String {
    format!("beta/mirror/{}/documents/{}.tar.gz", model_id, export_id)
}

/// Key of a single-file bundle.
pub fn file_export_key(model_id: &str, file_id: &str) -> String {
    format!("beta/mirror/{}/files/{}.tar.gz", model_id, file_id)
}

/// Key of the detached signature stored beside an artifact.
pub fn signature_key(artifact_key: &str) -> String {
    format!("{}.sig", artifact_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_export_key() {
        assert_eq!(
            image_export_key("m1", "img", "tag1"),
            "beta/registry/m1/img/blobs/compressed/tag1.tar.gz"
        );
    }

    #[test]
    fn test_bundle_keys() {
        assert_eq!(
            documents_export_key("m1", "e1"),
            "beta/mirror/m1/documents/e1.tar.gz"
        );
        assert_eq!(file_export_key("m1", "f1"), "beta/mirror/m1/files/f1.tar.gz");
        assert_eq!(signature_key("a/b.tar.gz"), "a/b.tar.gz.sig");
    }
}
