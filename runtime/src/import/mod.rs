//! Import orchestration.
//!
//! ```text
//!  payload URL ──▶ download ──▶ [gunzip + untar] ──▶ classify ──▶ reconcile
//!  payload URL ──▶ download ──▶ [gunzip + untar] ──▶ header ──▶ [gzip layers] ──▶ object store
//! ```
//!
//! Entities are processed one at a time in archive order. A validation
//! failure stops the import; entities committed before it stay committed.

mod classify;
mod fetch;
mod reconcile;

use std::sync::Arc;
use std::time::Instant;

use mirror_core::config::PipelineConfig;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use mirror_core::event::{events, EventEmitter, MirrorEvent};
use mirror_core::metadata::{ExportMetadata, ImportKind, ImportRequest};
use mirror_core::model::Model;
use serde::Serialize;
use serde_json::{json, Value};

use crate::archive::{
    compress, extract, forward_stream, CompressedStream, EntryBody, EntryStream, ExtractedEntry, IMAGE_LAYERS_ENTRY,
};
use crate::db::ModelStore;
use crate::metrics::MirrorMetrics;
use crate::registry::DistributionPackage;
use crate::scan::Scanners;
use crate::storage::{image_export_key, ObjectStore};

pub use classify::{classify, parse_file, parse_model_card, parse_release, EntryClass, ModelMapping};
pub use fetch::{HttpPayloadFetcher, PayloadFetcher};
pub use reconcile::{EntityOutcome, Reconciler};

/// Counts for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub imported: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl KindSummary {
    fn record(&mut self, outcome: EntityOutcome) {
        match outcome {
            EntityOutcome::Imported => self.imported += 1,
            EntityOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.imported + self.skipped + self.failed
    }
}

/// Per-kind summary of one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub model_cards: KindSummary,
    pub releases: KindSummary,
    pub files: KindSummary,
    pub images: KindSummary,
}

impl ImportResult {
    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindSummary {
        match kind {
            EntityKind::ModelCard => &mut self.model_cards,
            EntityKind::Release => &mut self.releases,
            EntityKind::File => &mut self.files,
            EntityKind::Image => &mut self.images,
        }
    }

    pub fn failed(&self) -> u32 {
        self.model_cards.failed + self.releases.failed + self.files.failed + self.images.failed
    }
}

/// Mirrored model and what was imported into it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub mirrored_model: Model,
    pub import_result: ImportResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    ModelCard,
    Release,
    File,
    Image,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::ModelCard => "modelCard",
            EntityKind::Release => "release",
            EntityKind::File => "file",
            EntityKind::Image => "image",
        }
    }
}

/// Reconstructs mirrored models from export payloads.
pub struct ImportService {
    store: Arc<dyn ModelStore>,
    fetcher: Arc<dyn PayloadFetcher>,
    reconciler: Reconciler,
    pipeline: PipelineConfig,
    events: EventEmitter,
    metrics: Option<Arc<MirrorMetrics>>,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ModelStore>,
        objects: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn PayloadFetcher>,
        scanners: Scanners,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), objects, scanners),
            store,
            fetcher,
            pipeline,
            events: EventEmitter::default(),
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Wait for scans submitted by earlier imports. Results arrive as `scan.*` events.
    pub async fn drain_scans(&self) {
        self.reconciler.scanners().drain().await
    }

    /// Import one export payload into its mirrored model.
    pub async fn import_model(
        &self,
        ctx: &OperationContext,
        user: &str,
        request: &ImportRequest,
    ) -> Result<ImportOutcome> {
        request.validate()?;
        let package = match request.import_kind {
            ImportKind::Image => Some(DistributionPackage::parse(
                request.distribution_package_name.as_deref().unwrap_or_default(),
            )?),
            _ => None,
        };

        let mirrored_model = self.mirrored_model(request).await?;

        let started = Instant::now();
        tracing::info!(
            mirrored_model_id = %request.mirrored_model_id,
            source_model_id = %request.source_model_id,
            kind = %request.import_kind,
            exporter = %request.exporter,
            user = %user,
            "Starting import"
        );
        self.events.emit(MirrorEvent::with_fields(
            events::IMPORT_STARTED,
            [
                ("mirroredModelId", json!(request.mirrored_model_id)),
                ("sourceModelId", json!(request.source_model_id)),
                ("importKind", json!(request.import_kind.as_str())),
                ("user", json!(user)),
            ],
        ));

        let mut result = ImportResult::default();
        let outcome = match package {
            Some(package) => self.import_image(ctx, request, &package, &mut result).await,
            None if request.import_kind == ImportKind::File => self.import_file(ctx, request, &mut result).await,
            None => self.import_documents(ctx, request, &mut result).await,
        };

        let elapsed = started.elapsed().as_secs_f64();
        if let Some(ref metrics) = self.metrics {
            metrics.record_import(request.import_kind.as_str(), outcome.is_ok(), elapsed);
        }

        match outcome {
            Ok(()) => {
                tracing::info!(
                    mirrored_model_id = %request.mirrored_model_id,
                    kind = %request.import_kind,
                    ?result,
                    elapsed_secs = elapsed,
                    "Import completed"
                );
                self.events.emit(MirrorEvent::with_fields(
                    events::IMPORT_COMPLETED,
                    [
                        ("mirroredModelId", json!(request.mirrored_model_id)),
                        ("importResult", summary_json(&result)),
                    ],
                ));
                Ok(ImportOutcome {
                    mirrored_model,
                    import_result: result,
                })
            }
            Err(e) => {
                log_failure(request, &e);
                self.events.emit(MirrorEvent::with_fields(
                    events::IMPORT_FAILED,
                    [
                        ("mirroredModelId", json!(request.mirrored_model_id)),
                        ("error", json!(e.to_string())),
                        ("importResult", summary_json(&result)),
                    ],
                ));
                Err(e)
            }
        }
    }

    /// The target model must exist and mirror the request's source model.
    async fn mirrored_model(&self, request: &ImportRequest) -> Result<Model> {
        let model = self
            .store
            .get_model(&request.mirrored_model_id)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("Model {}", request.mirrored_model_id)))?;

        match model.mirror.source_model_id.as_deref() {
            Some(source) if source == request.source_model_id => Ok(model),
            Some(source) => Err(MirrorError::InvalidRequest(format!(
                "Model {} mirrors '{}', not '{}'",
                model.id, source, request.source_model_id
            ))),
            None => Err(MirrorError::InvalidRequest(format!(
                "Model {} is not a mirrored model",
                model.id
            ))),
        }
    }

    async fn open_archive(&self, ctx: &OperationContext, request: &ImportRequest) -> Result<EntryStream> {
        let stream = self.fetcher.fetch(ctx, &request.payload_url).await?;
        Ok(extract(
            forward_stream(stream, self.pipeline.channel_capacity),
            &self.pipeline,
        ))
    }

    async fn import_documents(
        &self,
        ctx: &OperationContext,
        request: &ImportRequest,
        result: &mut ImportResult,
    ) -> Result<()> {
        let mut archive = self.open_archive(ctx, request).await?;
        let metadata = read_header(&mut archive, request).await?;
        let mapping = ModelMapping::from_metadata(&metadata);

        while let Some(entry) = archive.entries.recv().await {
            ctx.check("import")?;
            let entry = entry?;
            let ExtractedEntry { path, body, .. } = entry;
            let data = match body {
                EntryBody::Json(data) => data,
                EntryBody::Blob(_) => {
                    tracing::warn!(entity = %path, "Skipping non-JSON entry in documents bundle");
                    continue;
                }
            };
            let value: Value = serde_json::from_slice(&data)
                .map_err(|e| mapping.invalid(&path, format!("Malformed JSON: {}", e)))?;

            match classify(&path, &value) {
                EntryClass::ModelCard => {
                    let outcome = match parse_model_card(&mapping, &path, value) {
                        Ok(card) => self.reconciler.model_card(card).await,
                        Err(e) => Err(e),
                    };
                    self.tally(result, EntityKind::ModelCard, &path, outcome)?;
                }
                EntryClass::Release => {
                    let outcome = match parse_release(&mapping, &path, value) {
                        Ok(release) => self.reconciler.release(release).await,
                        Err(e) => Err(e),
                    };
                    self.tally(result, EntityKind::Release, &path, outcome)?;
                }
                EntryClass::File => {
                    let outcome = match parse_file(&mapping, &path, value, self.reconciler.bucket()) {
                        Ok(file) => self.reconciler.file_record(ctx, file).await,
                        Err(e) => Err(e),
                    };
                    self.tally(result, EntityKind::File, &path, outcome)?;
                }
                EntryClass::Metadata => {
                    return Err(mapping.invalid(&path, "Duplicate export metadata"));
                }
                EntryClass::Unknown => {
                    tracing::warn!(entity = %path, "Skipping unrecognised entry");
                }
            }
        }

        archive.finish().await?;
        Ok(())
    }

    async fn import_file(
        &self,
        ctx: &OperationContext,
        request: &ImportRequest,
        result: &mut ImportResult,
    ) -> Result<()> {
        let mut archive = self.open_archive(ctx, request).await?;
        let metadata = read_header(&mut archive, request).await?;
        let mapping = ModelMapping::from_metadata(&metadata);

        let (path, data) = match next_entry(&mut archive).await? {
            ExtractedEntry {
                path,
                body: EntryBody::Json(data),
                ..
            } if classify(&path, &Value::Null) == EntryClass::File => (path, data),
            entry => return Err(mapping.invalid(&entry.path, "Expected file.json after export metadata")),
        };
        let value: Value =
            serde_json::from_slice(&data).map_err(|e| mapping.invalid(&path, format!("Malformed JSON: {}", e)))?;

        let source_path = value.get("path").and_then(Value::as_str).unwrap_or_default();
        if Some(source_path) != request.file_path.as_deref() {
            result.files.failed += 1;
            return Err(mapping.invalid(
                &path,
                format!("File path '{}' does not match filePath of the request", source_path),
            ));
        }

        let file = match parse_file(&mapping, &path, value, self.reconciler.bucket()) {
            Ok(file) => file,
            Err(e) => {
                result.files.failed += 1;
                return Err(e);
            }
        };

        let blob = match next_entry(&mut archive).await? {
            ExtractedEntry {
                body: EntryBody::Blob(chunks),
                size,
                ..
            } if size == file.size => chunks,
            entry => {
                result.files.failed += 1;
                return Err(mapping.invalid(
                    &entry.path,
                    format!("Expected a {} byte blob for file {}", file.size, file.id),
                ));
            }
        };

        let size = file.size;
        let outcome = self.reconciler.file_blob(ctx, file, blob).await;
        if let (Ok(EntityOutcome::Imported), Some(metrics)) = (&outcome, &self.metrics) {
            metrics.add_downloaded(EntityKind::File.as_str(), size);
        }
        self.tally(result, EntityKind::File, &path, outcome)?;

        archive.finish().await?;
        Ok(())
    }

    async fn import_image(
        &self,
        ctx: &OperationContext,
        request: &ImportRequest,
        package: &DistributionPackage,
        result: &mut ImportResult,
    ) -> Result<()> {
        let image = package.image_ref(&request.mirrored_model_id);
        let key = image_export_key(&request.mirrored_model_id, &image.name, &image.tag);
        let entity = package.to_string();

        if self.reconciler.image_present(ctx, &key).await? {
            tracing::debug!(key = %key, "Image payload already present");
            return self.tally(result, EntityKind::Image, &entity, Ok(EntityOutcome::Skipped));
        }

        let mut archive = self.open_archive(ctx, request).await?;
        let metadata = read_header(&mut archive, request).await?;
        let mapping = ModelMapping::from_metadata(&metadata);

        let (layers, layers_size) = match next_entry(&mut archive).await? {
            ExtractedEntry {
                path,
                size,
                body: EntryBody::Blob(chunks),
            } if path.trim_start_matches("./") == IMAGE_LAYERS_ENTRY => (chunks, size),
            entry => {
                result.images.failed += 1;
                return Err(mapping.invalid(
                    &entry.path,
                    format!("Expected '{}' after export metadata", IMAGE_LAYERS_ENTRY),
                ));
            }
        };

        let compressed = compress(layers, &self.pipeline);
        let stored = match self.reconciler.image(ctx, &image, &key, compressed.stream).await {
            Ok(written) => {
                let checked = async {
                    let digest = CompressedStream::finish(compressed.digest).await?;
                    archive.finish().await?;
                    Ok::<_, MirrorError>(digest)
                }
                .await;
                match checked {
                    Ok(digest) => Ok((written, digest)),
                    Err(e) => {
                        self.reconciler.discard(ctx, &key).await;
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let outcome = stored.map(|(written, digest)| {
            tracing::debug!(
                key = %key,
                sha256 = %digest.sha256,
                layers_size,
                "Verified image payload"
            );
            if let Some(ref metrics) = self.metrics {
                metrics.add_downloaded(EntityKind::Image.as_str(), written);
            }
            self.reconciler.scan_image(&image, &key);
            EntityOutcome::Imported
        });
        self.tally(result, EntityKind::Image, &entity, outcome)
    }

    /// Count one entity and report it.
    fn tally(
        &self,
        result: &mut ImportResult,
        kind: EntityKind,
        entity: &str,
        outcome: Result<EntityOutcome>,
    ) -> Result<()> {
        let label = match outcome {
            Ok(EntityOutcome::Imported) => "imported",
            Ok(EntityOutcome::Skipped) => "skipped",
            Err(_) => "failed",
        };
        if let Some(ref metrics) = self.metrics {
            metrics.record_entity(kind.as_str(), label);
        }
        self.events.emit(MirrorEvent::with_fields(
            events::IMPORT_ENTITY,
            [
                ("kind", json!(kind.as_str())),
                ("entity", json!(entity)),
                ("outcome", json!(label)),
            ],
        ));

        let summary = result.kind_mut(kind);
        match outcome {
            Ok(outcome) => {
                summary.record(outcome);
                Ok(())
            }
            Err(e) => {
                summary.failed += 1;
                Err(e)
            }
        }
    }
}

/// Read the first entry, which must be the export header matching `request`.
async fn read_header(archive: &mut EntryStream, request: &ImportRequest) -> Result<ExportMetadata> {
    let mapping = ModelMapping::new(&request.source_model_id, &request.mirrored_model_id);
    let entry = next_entry(archive).await?;
    let data = match entry.body {
        EntryBody::Json(data) if classify(&entry.path, &Value::Null) == EntryClass::Metadata => data,
        _ => return Err(mapping.invalid(&entry.path, "Archive does not start with metadata.json")),
    };
    let metadata: ExportMetadata = serde_json::from_slice(&data)
        .map_err(|e| mapping.invalid(&entry.path, format!("Malformed export metadata: {}", e)))?;
    metadata.check_against(request)?;
    Ok(metadata)
}

/// Next entry, treating a premature end as a broken payload.
async fn next_entry(archive: &mut EntryStream) -> Result<ExtractedEntry> {
    match archive.entries.recv().await {
        Some(entry) => entry,
        None => Err(MirrorError::external("archive", "Archive ended unexpectedly")),
    }
}

fn summary_json(result: &ImportResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

fn log_failure(request: &ImportRequest, error: &MirrorError) {
    match error {
        MirrorError::ValidationError {
            message,
            entity,
            mirrored_model_id,
            source_model_id,
        } => tracing::error!(
            entity = %entity,
            mirrored_model_id = %mirrored_model_id,
            source_model_id = %source_model_id,
            kind = %request.import_kind,
            "Import rejected: {}",
            message
        ),
        _ => tracing::error!(
            mirrored_model_id = %request.mirrored_model_id,
            source_model_id = %request.source_model_id,
            kind = %request.import_kind,
            error = %error,
            "Import failed"
        ),
    }
}
