//! Export orchestration.
//!
//! ```text
//!  store ──▶ collect ──▶ documents bundle ─┐
//!  store ──▶ file blobs ──▶ file bundles ──┼──▶ upload ──▶ sign ──▶ presign ──▶ webhooks
//!  registry ──▶ layers ──▶ image bundles ──┘
//! ```
//!
//! Webhooks go out only after every artifact of the run is uploaded and
//! signed. If anything before that fails, the artifacts already written are
//! deleted and a single error is returned.

mod collector;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use mirror_core::config::PipelineConfig;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use mirror_core::event::{events, EventEmitter, MirrorEvent};
use mirror_core::metadata::{ExportMetadata, ImportKind, ImportRequest, Signature};
use mirror_core::model::ImageRef;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::archive::{forward_stream, once_stream, write_bundle, BundleEntry, CompressedStream, IMAGE_LAYERS_ENTRY};
use crate::db::ModelStore;
use crate::metrics::MirrorMetrics;
use crate::registry::{repository_path, RegistryClient, TokenProvider};
use crate::remote::ImportTrigger;
use crate::signer::{DetachedSignature, IntegritySigner};
use crate::storage::{documents_export_key, file_export_key, image_export_key, signature_key, ObjectStore};

pub use collector::{collect, ExportContent, ExportSelection};

/// Rejection message when the disclaimer was not accepted.
pub const DISCLAIMER_REQUIRED: &str = "You must agree to the disclaimer agreement before exporting.";

/// Deadline for deleting a failed run's artifacts.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// One uploaded object of an export run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub key: String,
    pub metadata: ExportMetadata,
    pub size: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    pub payload_url: String,
}

impl ExportArtifact {
    /// Request telling the receiving instance to import this artifact.
    pub fn import_request(&self) -> ImportRequest {
        ImportRequest::from_metadata(&self.metadata, self.payload_url.clone())
    }
}

/// Confirmation of a finished export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReceipt {
    pub export_id: String,
    pub model_id: String,
    pub mirrored_model_id: String,
    pub artifacts: Vec<ExportArtifact>,
    /// Whether the receiving instance was notified
    pub notified: bool,
}

/// Result of checking a stored artifact against its detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVerification {
    pub key: String,
    pub sha256: String,
    pub digest_matches: bool,
    pub signature_valid: bool,
}

impl ArtifactVerification {
    pub fn is_valid(&self) -> bool {
        self.digest_matches && self.signature_valid
    }
}

/// Packages models for a receiving instance.
pub struct ExportService {
    store: Arc<dyn ModelStore>,
    objects: Arc<dyn ObjectStore>,
    registry: RegistryClient,
    tokens: TokenProvider,
    pipeline: PipelineConfig,
    exporter: String,
    signer: Option<IntegritySigner>,
    trigger: Option<Arc<dyn ImportTrigger>>,
    events: EventEmitter,
    metrics: Option<Arc<MirrorMetrics>>,
    presign_ttl: Duration,
}

impl ExportService {
    pub fn new(
        store: Arc<dyn ModelStore>,
        objects: Arc<dyn ObjectStore>,
        registry: RegistryClient,
        tokens: TokenProvider,
        pipeline: PipelineConfig,
        exporter: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            registry,
            tokens,
            pipeline,
            exporter: exporter.into(),
            signer: None,
            trigger: None,
            events: EventEmitter::default(),
            metrics: None,
            presign_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_signer(mut self, signer: IntegritySigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn ImportTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Export a model's cards and the selected releases to object storage,
    /// then ask the receiving instance to import them.
    pub async fn export_model(
        &self,
        ctx: &OperationContext,
        user: &str,
        model_id: &str,
        selection: &ExportSelection,
        disclaimer_agreement: bool,
    ) -> Result<ExportReceipt> {
        if !disclaimer_agreement {
            return Err(MirrorError::InvalidRequest(DISCLAIMER_REQUIRED.to_string()));
        }

        let started = Instant::now();
        let export_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(export_id = %export_id, model_id = %model_id, user = %user, "Starting export");
        self.events.emit(MirrorEvent::with_fields(
            events::EXPORT_STARTED,
            [
                ("exportId", json!(export_id)),
                ("modelId", json!(model_id)),
                ("user", json!(user)),
            ],
        ));

        let result = self.run_export(ctx, model_id, selection, &export_id).await;
        let elapsed = started.elapsed().as_secs_f64();
        if let Some(ref metrics) = self.metrics {
            metrics.record_export(result.is_ok(), elapsed);
        }

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    export_id = %export_id,
                    model_id = %model_id,
                    mirrored_model_id = %receipt.mirrored_model_id,
                    artifacts = receipt.artifacts.len(),
                    notified = receipt.notified,
                    elapsed_secs = elapsed,
                    "Export completed"
                );
                self.events.emit(MirrorEvent::with_fields(
                    events::EXPORT_COMPLETED,
                    [
                        ("exportId", json!(export_id)),
                        ("modelId", json!(model_id)),
                        ("artifacts", json!(receipt.artifacts.len())),
                    ],
                ));
            }
            Err(e) => {
                tracing::error!(export_id = %export_id, model_id = %model_id, error = %e, "Export failed");
                self.events.emit(MirrorEvent::with_fields(
                    events::EXPORT_FAILED,
                    [
                        ("exportId", json!(export_id)),
                        ("modelId", json!(model_id)),
                        ("error", json!(e.to_string())),
                    ],
                ));
            }
        }
        result
    }

    async fn run_export(
        &self,
        ctx: &OperationContext,
        model_id: &str,
        selection: &ExportSelection,
        export_id: &str,
    ) -> Result<ExportReceipt> {
        ctx.check("export")?;
        let content = collect(self.store.as_ref(), model_id, selection).await?;

        let mut written = Vec::new();
        let artifacts = match self.upload_artifacts(ctx, &content, export_id, &mut written).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                self.discard(&written).await;
                return Err(e);
            }
        };

        let notified = self.notify(ctx, &artifacts).await?;
        Ok(ExportReceipt {
            export_id: export_id.to_string(),
            model_id: model_id.to_string(),
            mirrored_model_id: content.mirrored_model_id,
            artifacts,
            notified,
        })
    }

    async fn upload_artifacts(
        &self,
        ctx: &OperationContext,
        content: &ExportContent,
        export_id: &str,
        written: &mut Vec<String>,
    ) -> Result<Vec<ExportArtifact>> {
        let model_id = content.model.id.as_str();
        let mut artifacts = Vec::new();

        let documents_kind = if content.releases.is_empty() {
            ImportKind::ModelCard
        } else {
            ImportKind::Release
        };
        let metadata = self.header(content, documents_kind);
        let bundle = self.bundle(document_entries(&metadata, content)?);
        artifacts.push(
            self.store_artifact(ctx, documents_export_key(model_id, export_id), metadata, bundle, written)
                .await?,
        );

        for file in content.complete_files() {
            let metadata = self.header(content, ImportKind::File).with_file_path(file.path.clone());
            let blob = self.objects.get_stream(ctx, &file.path).await?;
            let entries = vec![
                BundleEntry::json("metadata.json", &metadata)?,
                BundleEntry::json("file.json", file)?,
                BundleEntry::Blob {
                    path: "blob".to_string(),
                    size: file.size,
                    chunks: forward_stream(blob, self.pipeline.channel_capacity),
                },
            ];
            let bundle = self.bundle(entries);
            artifacts.push(
                self.store_artifact(ctx, file_export_key(model_id, &file.id), metadata, bundle, written)
                    .await?,
            );
        }

        for image in &content.images {
            let metadata = self
                .header(content, ImportKind::Image)
                .with_distribution_package_name(image.distribution_package_name());
            let payload = self.image_bundle(ctx, &metadata, image).await?;
            let key = image_export_key(model_id, &image.name, &image.tag);
            artifacts.push(self.store_artifact(ctx, key, metadata, payload, written).await?);
        }

        Ok(artifacts)
    }

    fn header(&self, content: &ExportContent, kind: ImportKind) -> ExportMetadata {
        ExportMetadata::new(
            self.exporter.clone(),
            content.model.id.clone(),
            content.mirrored_model_id.clone(),
            kind,
        )
    }

    fn bundle(&self, entries: Vec<BundleEntry>) -> CompressedStream {
        let (tx, rx) = mpsc::channel(self.pipeline.channel_capacity);
        let bundle = write_bundle(rx, &self.pipeline);
        tokio::spawn(async move {
            for entry in entries {
                if tx.send(entry).await.is_err() {
                    break;
                }
            }
        });
        bundle
    }

    /// Header followed by the image layers as one blob entry.
    async fn image_bundle(
        &self,
        ctx: &OperationContext,
        metadata: &ExportMetadata,
        image: &ImageRef,
    ) -> Result<CompressedStream> {
        let repository = repository_path(image);
        let auth = self.tokens.pull_auth(ctx, &repository).await?;
        let layers = self
            .registry
            .stream_layers(ctx, auth, &repository, &image.tag, self.pipeline.channel_capacity)
            .await?;
        if layers.count == 0 {
            return Err(MirrorError::external(
                "registry",
                format!("Image {}:{} has no layers", repository, image.tag),
            ));
        }
        Ok(self.bundle(vec![
            BundleEntry::json("metadata.json", metadata)?,
            BundleEntry::Blob {
                path: IMAGE_LAYERS_ENTRY.to_string(),
                size: layers.size,
                chunks: layers.layers,
            },
        ]))
    }

    async fn store_artifact(
        &self,
        ctx: &OperationContext,
        key: String,
        metadata: ExportMetadata,
        payload: CompressedStream,
        written: &mut Vec<String>,
    ) -> Result<ExportArtifact> {
        let object_metadata = HashMap::from([
            ("import-kind".to_string(), metadata.import_kind.to_string()),
            ("source-model-id".to_string(), metadata.source_model_id.clone()),
            ("mirrored-model-id".to_string(), metadata.mirrored_model_id.clone()),
        ]);

        let CompressedStream { stream, digest } = payload;
        let size = self.objects.put_stream(ctx, &key, stream, object_metadata).await?;
        written.push(key.clone());
        let digest = CompressedStream::finish(digest).await?;
        if digest.size != size {
            return Err(MirrorError::IntegrityError(format!(
                "Stored {} bytes for {} but compressed {}",
                size, key, digest.size
            )));
        }

        let signature = match self.signer {
            Some(ref signer) => {
                let signature = signer.sign(ctx, &digest.sha256).await?;
                let document = DetachedSignature {
                    key_id: signer.key_id().to_string(),
                    sha256: digest.sha256.clone(),
                    signature: signature.clone(),
                };
                let sig_key = signature_key(&key);
                self.objects
                    .put_stream(
                        ctx,
                        &sig_key,
                        once_stream(serde_json::to_vec_pretty(&document)?),
                        HashMap::new(),
                    )
                    .await?;
                written.push(sig_key);
                Some(signature)
            }
            None => None,
        };

        let payload_url = self.objects.presign_get(&key, self.presign_ttl).await?;

        if let Some(ref metrics) = self.metrics {
            metrics.add_uploaded(metadata.import_kind.as_str(), size);
        }
        tracing::info!(
            key = %key,
            kind = %metadata.import_kind,
            size,
            sha256 = %digest.sha256,
            signed = signature.is_some(),
            "Uploaded export artifact"
        );
        self.events.emit(MirrorEvent::with_fields(
            events::EXPORT_ARTIFACT,
            [
                ("key", json!(key)),
                ("kind", json!(metadata.import_kind.as_str())),
                ("size", json!(size)),
                ("sha256", json!(digest.sha256)),
            ],
        ));

        Ok(ExportArtifact {
            key,
            metadata,
            size,
            sha256: digest.sha256,
            signature,
            payload_url,
        })
    }

    /// Best-effort removal of a failed run's objects.
    async fn discard(&self, keys: &[String]) {
        let ctx = OperationContext::with_timeout(CLEANUP_TIMEOUT);
        for key in keys {
            match self.objects.delete(&ctx, key).await {
                Ok(()) => tracing::debug!(key = %key, "Deleted artifact of failed export"),
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to delete artifact of failed export"),
            }
        }
    }

    async fn notify(&self, ctx: &OperationContext, artifacts: &[ExportArtifact]) -> Result<bool> {
        let Some(ref trigger) = self.trigger else {
            tracing::info!(artifacts = artifacts.len(), "No remote instance configured; skipping import trigger");
            return Ok(false);
        };
        for artifact in artifacts {
            trigger.trigger(ctx, &artifact.import_request()).await?;
        }
        Ok(true)
    }

    /// Recompute an artifact's digest and check it against its `.sig` document.
    pub async fn verify_artifact(&self, ctx: &OperationContext, key: &str) -> Result<ArtifactVerification> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| MirrorError::ConfigError("No signing key configured".to_string()))?;

        let sig_stream = self.objects.get_stream(ctx, &signature_key(key)).await?;
        let sig_bytes = crate::archive::collect_stream(sig_stream)
            .await
            .map_err(|e| MirrorError::external("storage", format!("Reading signature of {}: {}", key, e)))?;
        let document: DetachedSignature = serde_json::from_slice(&sig_bytes)?;

        let mut stream = self.objects.get_stream(ctx, key).await?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MirrorError::external("storage", format!("Reading {}: {}", key, e)))?;
            hasher.update(&chunk);
        }
        let sha256 = hex::encode(hasher.finalize());

        let digest_matches = sha256 == document.sha256;
        let signature_valid = signer.verify(ctx, &sha256, &document.signature).await?;
        Ok(ArtifactVerification {
            key: key.to_string(),
            sha256,
            digest_matches,
            signature_valid,
        })
    }
}

/// Entries of a documents bundle, header first.
fn document_entries(metadata: &ExportMetadata, content: &ExportContent) -> Result<Vec<BundleEntry>> {
    let mut entries = vec![BundleEntry::json("metadata.json", metadata)?];
    for card in &content.model_cards {
        entries.push(BundleEntry::json(format!("model-cards/{}.json", card.version), card)?);
    }
    for release in &content.releases {
        entries.push(BundleEntry::json(format!("releases/{}.json", release.semver), release)?);
    }
    for file in &content.files {
        entries.push(BundleEntry::json(format!("files/{}.json", file.id), file)?);
    }
    Ok(entries)
}
