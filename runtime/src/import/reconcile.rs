//! Persisting validated entities.
//!
//! Cards and releases are insert-or-skip. Files move
//! `Pending -> Downloading -> Complete`; only `Pending` and `Complete` are
//! ever stored, so an interrupted download leaves a record that a retry
//! picks up again.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use mirror_core::model::{FileRecord, FileState, ImageRef, ModelCardRevision, Release};
use tokio::sync::mpsc;

use crate::archive::{receiver_stream, ByteStream};
use crate::db::{InsertOutcome, ModelStore};
use crate::scan::{Artefact, Scanners};
use crate::storage::ObjectStore;

/// What happened to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Imported,
    Skipped,
}

impl From<InsertOutcome> for EntityOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted => EntityOutcome::Imported,
            InsertOutcome::AlreadyExists => EntityOutcome::Skipped,
        }
    }
}

/// Writes imported entities to the model store and object storage.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ModelStore>,
    objects: Arc<dyn ObjectStore>,
    scanners: Scanners,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ModelStore>, objects: Arc<dyn ObjectStore>, scanners: Scanners) -> Self {
        Self {
            store,
            objects,
            scanners,
        }
    }

    pub fn bucket(&self) -> &str {
        self.objects.bucket()
    }

    pub fn scanners(&self) -> &Scanners {
        &self.scanners
    }

    pub async fn model_card(&self, card: ModelCardRevision) -> Result<EntityOutcome> {
        let (model_id, version) = (card.model_id.clone(), card.version);
        let outcome = self.store.insert_model_card(card).await?;
        tracing::debug!(model_id = %model_id, version, ?outcome, "Reconciled model card");
        Ok(outcome.into())
    }

    pub async fn release(&self, release: Release) -> Result<EntityOutcome> {
        let (model_id, semver) = (release.model_id.clone(), release.semver.clone());
        let outcome = self.store.insert_release(release).await?;
        tracing::debug!(model_id = %model_id, semver = %semver, ?outcome, "Reconciled release");
        Ok(outcome.into())
    }

    /// Record a file whose blob travels separately.
    ///
    /// The record is complete only if its blob already exists at the destination.
    pub async fn file_record(&self, ctx: &OperationContext, mut file: FileRecord) -> Result<EntityOutcome> {
        let blob_present = self.objects.exists(ctx, &file.path).await?;

        if let Some(existing) = self.store.file(&file.model_id, &file.id).await? {
            if existing.complete || !blob_present {
                return Ok(EntityOutcome::Skipped);
            }
            self.complete(&existing).await?;
            return Ok(EntityOutcome::Imported);
        }

        file.complete = blob_present;
        let outcome = self.store.insert_file(file.clone()).await?;
        if outcome.is_inserted() && blob_present {
            self.submit_file_scan(&file);
        }
        tracing::debug!(
            model_id = %file.model_id,
            file_id = %file.id,
            complete = blob_present,
            "Reconciled file record"
        );
        Ok(outcome.into())
    }

    /// Record a file and stream its blob to the destination.
    ///
    /// A file already complete is skipped without reading `blob`.
    pub async fn file_blob(
        &self,
        ctx: &OperationContext,
        file: FileRecord,
        blob: mpsc::Receiver<io::Result<Bytes>>,
    ) -> Result<EntityOutcome> {
        let existing = self.store.file(&file.model_id, &file.id).await?;
        let record = match existing {
            Some(record) if record.complete => {
                tracing::debug!(model_id = %record.model_id, file_id = %record.id, "File already complete");
                return Ok(EntityOutcome::Skipped);
            }
            Some(record) => record,
            None => {
                self.store.insert_file(file.clone()).await?;
                file
            }
        };

        let state = record.state();
        if !state.can_transition_to(FileState::Downloading) {
            return Err(MirrorError::Other(format!(
                "File {} cannot start downloading from {:?}",
                record.id, state
            )));
        }

        let metadata = HashMap::from([
            ("model-id".to_string(), record.model_id.clone()),
            ("file-id".to_string(), record.id.clone()),
        ]);
        let stream: ByteStream = receiver_stream(blob);
        let written = self.objects.put_stream(ctx, &record.path, stream, metadata).await?;
        if written != record.size {
            self.discard(ctx, &record.path).await;
            return Err(MirrorError::IntegrityError(format!(
                "File {} has {} bytes but its record declares {}",
                record.id, written, record.size
            )));
        }

        self.complete(&record).await?;
        tracing::info!(model_id = %record.model_id, file_id = %record.id, size = written, "Imported file blob");
        Ok(EntityOutcome::Imported)
    }

    /// Whether an image payload is already stored under `key`.
    pub async fn image_present(&self, ctx: &OperationContext, key: &str) -> Result<bool> {
        self.objects.exists(ctx, key).await
    }

    /// Store an image payload under `key`.
    ///
    /// `payload` must end in an error if the download or decode failed, so a
    /// broken payload is never committed.
    pub async fn image(&self, ctx: &OperationContext, image: &ImageRef, key: &str, payload: ByteStream) -> Result<u64> {
        let metadata = HashMap::from([
            ("model-id".to_string(), image.repository.clone()),
            ("distribution-package-name".to_string(), image.distribution_package_name()),
        ]);
        let written = self.objects.put_stream(ctx, key, payload, metadata).await?;
        tracing::info!(key = %key, size = written, "Imported image payload");
        Ok(written)
    }

    /// Hand a stored and verified image to the scanners.
    pub fn scan_image(&self, image: &ImageRef, key: &str) {
        self.scanners.submit(Artefact::Image {
            model_id: image.repository.clone(),
            name: image.name.clone(),
            tag: image.tag.clone(),
            key: key.to_string(),
        });
    }

    /// Drop an object written before its payload failed verification.
    pub async fn discard(&self, ctx: &OperationContext, key: &str) {
        if let Err(e) = self.objects.delete(ctx, key).await {
            tracing::warn!(key = %key, error = %e, "Failed to remove unverified object");
        }
    }

    async fn complete(&self, file: &FileRecord) -> Result<()> {
        if self.store.mark_file_complete(&file.model_id, &file.id).await? {
            self.submit_file_scan(file);
        }
        Ok(())
    }

    fn submit_file_scan(&self, file: &FileRecord) {
        self.scanners.submit(Artefact::File {
            model_id: file.model_id.clone(),
            file_id: file.id.clone(),
            bucket: file.bucket.clone(),
            key: file.path.clone(),
        });
    }
}
