//! Mirrored entities: models, model-card revisions, releases and files.
//!
//! Field names follow the JSON documents exchanged between instances
//! (`modelId`, `schemaId`, ...). The database identifier is carried as `_id`
//! and is never trusted across instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mirroring settings attached to a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSettings {
    /// Model on the exporting instance this model mirrors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_model_id: Option<String>,
    /// Model on the receiving instance this model is mirrored to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_model_id: Option<String>,
}

/// A model known to this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mirror: MirrorSettings,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mirror: MirrorSettings::default(),
        }
    }

    /// A model that receives imports from `source_model_id`.
    pub fn mirrored_from(
        id: impl Into<String>,
        name: impl Into<String>,
        source_model_id: impl Into<String>,
    ) -> Self {
        Self {
            mirror: MirrorSettings {
                source_model_id: Some(source_model_id.into()),
                destination_model_id: None,
            },
            ..Self::new(id, name)
        }
    }

    /// A model that exports to `destination_model_id`.
    pub fn mirrored_to(
        id: impl Into<String>,
        name: impl Into<String>,
        destination_model_id: impl Into<String>,
    ) -> Self {
        Self {
            mirror: MirrorSettings {
                source_model_id: None,
                destination_model_id: Some(destination_model_id.into()),
            },
            ..Self::new(id, name)
        }
    }
}

/// An immutable model-card revision. Unique per `(modelId, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCardRevision {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    pub model_id: String,
    pub schema_id: String,
    pub version: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// An image pushed to the model-scoped registry repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository the image lives under (the model id on the exporting side).
    pub repository: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// The `name:tag` form used as a distribution package name.
    pub fn distribution_package_name(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// A release. Unique per `(modelId, semver)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    pub model_id: String,
    pub model_card_version: u32,
    pub semver: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub minor: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// File metadata. The blob itself lives in object storage at `bucket/path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    /// Stable file identifier referenced by `Release::file_ids`.
    pub id: String,
    pub model_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub bucket: String,
    pub path: String,
    /// True only once the blob has been fully written.
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Current position in the `Pending -> Downloading -> Complete` lifecycle.
    ///
    /// `Downloading` is never persisted, so a stored record is either
    /// pending or complete.
    pub fn state(&self) -> FileState {
        if self.complete {
            FileState::Complete
        } else {
            FileState::Pending
        }
    }
}

/// Lifecycle of an imported file blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileState {
    Pending,
    Downloading,
    Complete,
}

impl FileState {
    /// Only forward transitions are allowed.
    pub fn can_transition_to(self, next: FileState) -> bool {
        matches!(
            (self, next),
            (FileState::Pending, FileState::Downloading)
                | (FileState::Downloading, FileState::Complete)
        )
    }
}

/// Object storage key for a model file blob.
pub fn file_blob_key(model_id: &str, file_id: &str) -> String {
    format!("beta/model/{}/files/{}", model_id, file_id)
}
