//! Classifying and validating archive entries.
//!
//! Every entity must belong to the source model named in the export header.
//! Accepted entities are rewritten to the mirrored model and lose their
//! original database id.

use mirror_core::error::{MirrorError, Result};
use mirror_core::metadata::ExportMetadata;
use mirror_core::model::{file_blob_key, FileRecord, ModelCardRevision, Release};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// What an archive entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Metadata,
    ModelCard,
    Release,
    File,
    Unknown,
}

/// Classify by path first, falling back to the document's shape.
pub fn classify(path: &str, value: &Value) -> EntryClass {
    let path = path.trim_start_matches("./");
    if path == "metadata.json" {
        return EntryClass::Metadata;
    }
    if path == "file.json" {
        return EntryClass::File;
    }
    if let Some((dir, _)) = path.split_once('/') {
        match dir {
            "model-cards" => return EntryClass::ModelCard,
            "releases" => return EntryClass::Release,
            "files" => return EntryClass::File,
            _ => {}
        }
    }

    let has = |field: &str| value.get(field).is_some();
    if has("schemaVersion") && has("importKind") {
        EntryClass::Metadata
    } else if has("semver") {
        EntryClass::Release
    } else if has("schemaId") && has("version") {
        EntryClass::ModelCard
    } else if has("size") && has("bucket") {
        EntryClass::File
    } else {
        EntryClass::Unknown
    }
}

/// Source and mirrored model ids of one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMapping {
    pub source_model_id: String,
    pub mirrored_model_id: String,
}

impl ModelMapping {
    pub fn new(source_model_id: impl Into<String>, mirrored_model_id: impl Into<String>) -> Self {
        Self {
            source_model_id: source_model_id.into(),
            mirrored_model_id: mirrored_model_id.into(),
        }
    }

    pub fn from_metadata(metadata: &ExportMetadata) -> Self {
        Self::new(&metadata.source_model_id, &metadata.mirrored_model_id)
    }

    /// Validation error carrying this mapping and the offending entity.
    pub fn invalid(&self, entity: &str, message: impl Into<String>) -> MirrorError {
        MirrorError::ValidationError {
            message: message.into(),
            entity: entity.to_string(),
            mirrored_model_id: self.mirrored_model_id.clone(),
            source_model_id: self.source_model_id.clone(),
        }
    }

    fn check_model_id(&self, entity: &str, model_id: &str) -> Result<()> {
        if model_id != self.source_model_id {
            return Err(self.invalid(
                entity,
                format!(
                    "modelId '{}' does not match sourceModelId '{}'",
                    model_id, self.source_model_id
                ),
            ));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(mapping: &ModelMapping, entity: &str, kind: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| mapping.invalid(entity, format!("Invalid {}: {}", kind, e)))
}

/// Parse a model card revision and move it to the mirrored model.
pub fn parse_model_card(mapping: &ModelMapping, entity: &str, value: Value) -> Result<ModelCardRevision> {
    let mut card: ModelCardRevision = decode(mapping, entity, "model card", value)?;
    mapping.check_model_id(entity, &card.model_id)?;
    card.model_id = mapping.mirrored_model_id.clone();
    card.db_id = None;
    Ok(card)
}

/// Parse a release and move it, and its images, to the mirrored model.
pub fn parse_release(mapping: &ModelMapping, entity: &str, value: Value) -> Result<Release> {
    let mut release: Release = decode(mapping, entity, "release", value)?;
    mapping.check_model_id(entity, &release.model_id)?;
    release.model_id = mapping.mirrored_model_id.clone();
    release.db_id = None;
    for image in &mut release.images {
        image.repository = mapping.mirrored_model_id.clone();
    }
    Ok(release)
}

/// Parse a file record and point it at the mirrored model's blob in `bucket`.
///
/// The record starts incomplete; it is marked complete once the blob is
/// known to exist at the destination.
pub fn parse_file(mapping: &ModelMapping, entity: &str, value: Value, bucket: &str) -> Result<FileRecord> {
    let mut file: FileRecord = decode(mapping, entity, "file", value)?;
    mapping.check_model_id(entity, &file.model_id)?;
    file.model_id = mapping.mirrored_model_id.clone();
    file.db_id = None;
    file.bucket = bucket.to_string();
    file.path = file_blob_key(&mapping.mirrored_model_id, &file.id);
    file.complete = false;
    Ok(file)
}
