//! Point-in-time snapshot of what an export will carry.

use std::collections::{BTreeSet, HashSet};

use mirror_core::error::{MirrorError, Result};
use mirror_core::model::{FileRecord, ImageRef, Model, ModelCardRevision, Release};

use crate::db::ModelStore;

/// Which releases to export. Model card revisions are always included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSelection {
    pub release_semvers: Vec<String>,
}

impl ExportSelection {
    pub fn releases<I, S>(semvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            release_semvers: semvers.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything read from the store for one export.
#[derive(Debug, Clone)]
pub struct ExportContent {
    pub model: Model,
    pub mirrored_model_id: String,
    pub model_cards: Vec<ModelCardRevision>,
    pub releases: Vec<Release>,
    /// Files referenced by the selected releases
    pub files: Vec<FileRecord>,
    /// Images referenced by the selected releases, deduplicated
    pub images: Vec<ImageRef>,
}

impl ExportContent {
    /// Files whose blobs are fully written and can be bundled.
    pub fn complete_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| file.complete)
    }
}

/// Read a model's cards, the selected releases and what those releases reference.
pub async fn collect(
    store: &dyn ModelStore,
    model_id: &str,
    selection: &ExportSelection,
) -> Result<ExportContent> {
    let model = store
        .get_model(model_id)
        .await?
        .ok_or_else(|| MirrorError::NotFound(format!("Model {}", model_id)))?;

    let mirrored_model_id = model
        .mirror
        .destination_model_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            MirrorError::InvalidRequest(format!(
                "Model {} has no mirror destination model id",
                model_id
            ))
        })?;

    let model_cards = store.model_cards(model_id).await?;

    let mut releases = Vec::with_capacity(selection.release_semvers.len());
    for semver in &selection.release_semvers {
        let release = store
            .release(model_id, semver)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("Release {} of model {}", semver, model_id)))?;
        releases.push(release);
    }

    let file_ids: BTreeSet<&str> = releases
        .iter()
        .flat_map(|release| release.file_ids.iter().map(String::as_str))
        .collect();
    let mut files = Vec::with_capacity(file_ids.len());
    for file_id in file_ids {
        let file = store
            .file(model_id, file_id)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("File {} of model {}", file_id, model_id)))?;
        if !file.complete {
            tracing::warn!(model_id = %model_id, file_id = %file_id, "File is not complete; exporting metadata only");
        }
        files.push(file);
    }

    let mut seen = HashSet::new();
    let images: Vec<ImageRef> = releases
        .iter()
        .flat_map(|release| release.images.iter())
        .filter(|image| seen.insert((*image).clone()))
        .cloned()
        .collect();

    tracing::debug!(
        model_id = %model_id,
        model_cards = model_cards.len(),
        releases = releases.len(),
        files = files.len(),
        images = images.len(),
        "Collected export content"
    );

    Ok(ExportContent {
        model,
        mirrored_model_id,
        model_cards,
        releases,
        files,
        images,
    })
}
