//! Shared fixtures for the round-trip tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use mirror_core::context::OperationContext;
use mirror_core::error::Result;
use mirror_core::metadata::ImportRequest;
use mirror_core::model::{FileRecord, ImageRef, Model, ModelCardRevision, Release};
use mirror_runtime::archive::ByteStream;
use mirror_runtime::{ImportTrigger, LocalModelStore, ModelStore, PayloadFetcher};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Registry answering fixed manifest and blob paths.
pub struct MockRegistry {
    pub url: String,
}

impl MockRegistry {
    /// Serve `repository:tag` made of `layers`.
    pub async fn serve(repository: &str, tag: &str, layers: &[Vec<u8>]) -> Self {
        let mut routes: HashMap<String, Bytes> = HashMap::new();
        let mut descriptors = Vec::new();
        for layer in layers {
            let digest = format!("sha256:{}", hex::encode(Sha256::digest(layer)));
            routes.insert(
                format!("/v2/{}/blobs/{}", repository, digest),
                Bytes::from(layer.clone()),
            );
            descriptors.push(json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": layer.len(),
            }));
        }
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": format!("sha256:{}", hex::encode(Sha256::digest(b"{}"))),
                "size": 2,
            },
            "layers": descriptors,
        });
        routes.insert(
            format!("/v2/{}/manifests/{}", repository, tag),
            Bytes::from(serde_json::to_vec(&manifest).unwrap()),
        );

        let app = Router::new().fallback(lookup).with_state(Arc::new(routes));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
        }
    }
}

async fn lookup(State(routes): State<Arc<HashMap<String, Bytes>>>, uri: Uri) -> Response {
    match routes.get(uri.path()) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Captures webhook requests instead of sending them.
#[derive(Default)]
pub struct RecordingTrigger {
    pub requests: Mutex<Vec<ImportRequest>>,
}

#[async_trait]
impl ImportTrigger for RecordingTrigger {
    async fn trigger(&self, _ctx: &OperationContext, request: &ImportRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

/// Counts fetches and delegates to another fetcher.
pub struct CountingFetcher {
    pub inner: Arc<dyn PayloadFetcher>,
    pub calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn new(inner: Arc<dyn PayloadFetcher>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadFetcher for CountingFetcher {
    async fn fetch(&self, ctx: &OperationContext, url: &str) -> Result<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(ctx, url).await
    }
}

pub const FILE_SIZE: usize = 1024;

pub fn file_bytes() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

pub fn model_card(model_id: &str, version: u32) -> ModelCardRevision {
    ModelCardRevision {
        db_id: None,
        model_id: model_id.to_string(),
        schema_id: "minimal-general-v10".to_string(),
        version,
        metadata: json!({"overview": {"summary": "Sentiment classifier"}}),
        created_by: "alice".to_string(),
        created_at: Utc::now(),
    }
}

pub fn release(model_id: &str, semver: &str, images: Vec<ImageRef>) -> Release {
    Release {
        db_id: None,
        model_id: model_id.to_string(),
        model_card_version: 1,
        semver: semver.to_string(),
        notes: "Initial release".to_string(),
        minor: false,
        draft: false,
        file_ids: vec!["f1".to_string()],
        images,
        created_by: "alice".to_string(),
        created_at: Utc::now(),
    }
}

pub fn file_record(model_id: &str, bucket: &str) -> FileRecord {
    FileRecord {
        db_id: None,
        id: "f1".to_string(),
        model_id: model_id.to_string(),
        name: "weights.bin".to_string(),
        size: FILE_SIZE as u64,
        mime: "application/octet-stream".to_string(),
        bucket: bucket.to_string(),
        path: format!("beta/model/{}/files/f1", model_id),
        complete: true,
        tags: Vec::new(),
        created_at: Utc::now(),
    }
}

/// Source store with `m1` (mirrored to `m2`), one card, release `v1.0.0`,
/// file `f1` and image `img:tag1`.
pub async fn source_store(bucket: &str) -> Arc<LocalModelStore> {
    let store = Arc::new(LocalModelStore::in_memory());
    store
        .put_model(Model::mirrored_to("m1", "Sentiment", "m2"))
        .await
        .unwrap();
    store.insert_model_card(model_card("m1", 1)).await.unwrap();
    let image = ImageRef {
        repository: "m1".to_string(),
        name: "img".to_string(),
        tag: "tag1".to_string(),
    };
    store
        .insert_release(release("m1", "v1.0.0", vec![image]))
        .await
        .unwrap();
    store.insert_file(file_record("m1", bucket)).await.unwrap();
    store
}

/// Destination store holding only the empty mirror model `m2`.
pub async fn destination_store() -> Arc<LocalModelStore> {
    let store = Arc::new(LocalModelStore::in_memory());
    store
        .put_model(Model::mirrored_from("m2", "Sentiment (mirror)", "m1"))
        .await
        .unwrap();
    store
}
