//! In-memory model store with an optional JSON snapshot on disk.
//!
//! Every mutation rewrites the snapshot atomically (write `.tmp`, rename),
//! so a crash leaves either the previous or the new state behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mirror_core::error::{MirrorError, Result};
use mirror_core::model::{FileRecord, FileState, Model, ModelCardRevision, Release};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{InsertOutcome, ModelStore};

/// On-disk snapshot format.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    models: Vec<Model>,
    model_cards: Vec<ModelCardRevision>,
    releases: Vec<Release>,
    files: Vec<FileRecord>,
}

#[derive(Debug, Default)]
struct Tables {
    models: BTreeMap<String, Model>,
    model_cards: BTreeMap<(String, u32), ModelCardRevision>,
    releases: BTreeMap<(String, String), Release>,
    files: BTreeMap<(String, String), FileRecord>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Tables::default();
        for model in snapshot.models {
            tables.models.insert(model.id.clone(), model);
        }
        for card in snapshot.model_cards {
            tables
                .model_cards
                .insert((card.model_id.clone(), card.version), card);
        }
        for release in snapshot.releases {
            tables
                .releases
                .insert((release.model_id.clone(), release.semver.clone()), release);
        }
        for file in snapshot.files {
            tables
                .files
                .insert((file.model_id.clone(), file.id.clone()), file);
        }
        tables
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            models: self.models.values().cloned().collect(),
            model_cards: self.model_cards.values().cloned().collect(),
            releases: self.releases.values().cloned().collect(),
            files: self.files.values().cloned().collect(),
        }
    }
}

/// Model store kept in memory, optionally persisted to a JSON file.
pub struct LocalModelStore {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl LocalModelStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Open a store persisted at `path`, loading it if it exists.
    pub fn open(path: &Path) -> Result<Self> {
        let tables = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|e| {
                MirrorError::Other(format!("Failed to read store {}: {}", path.display(), e))
            })?;
            let snapshot: Snapshot = serde_json::from_str(&data)?;
            Tables::from_snapshot(snapshot)
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Tables::default()
        };

        tracing::debug!(
            path = %path.display(),
            models = tables.models.len(),
            releases = tables.releases.len(),
            "Opened model store"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            tables: RwLock::new(tables),
        })
    }

    /// Persist `tables`. Callers hold the write lock, so snapshots land in
    /// mutation order.
    async fn save(&self, tables: &Tables) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(&tables.to_snapshot())?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            MirrorError::Other(format!("Failed to write store {}: {}", tmp_path.display(), e))
        })?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn new_db_id() -> Option<String> {
    Some(uuid::Uuid::new_v4().simple().to_string())
}

#[async_trait]
impl ModelStore for LocalModelStore {
    async fn get_model(&self, model_id: &str) -> Result<Option<Model>> {
        Ok(self.tables.read().await.models.get(model_id).cloned())
    }

    async fn put_model(&self, model: Model) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.models.insert(model.id.clone(), model);
        self.save(&tables).await
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        Ok(self.tables.read().await.models.values().cloned().collect())
    }

    async fn model_cards(&self, model_id: &str) -> Result<Vec<ModelCardRevision>> {
        let tables = self.tables.read().await;
        Ok(tables
            .model_cards
            .values()
            .filter(|card| card.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn releases(&self, model_id: &str) -> Result<Vec<Release>> {
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .values()
            .filter(|release| release.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn release(&self, model_id: &str, semver: &str) -> Result<Option<Release>> {
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .get(&(model_id.to_string(), semver.to_string()))
            .cloned())
    }

    async fn files(&self, model_id: &str) -> Result<Vec<FileRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .files
            .values()
            .filter(|file| file.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn file(&self, model_id: &str, file_id: &str) -> Result<Option<FileRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .files
            .get(&(model_id.to_string(), file_id.to_string()))
            .cloned())
    }

    async fn insert_model_card(&self, mut card: ModelCardRevision) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let key = (card.model_id.clone(), card.version);
        if tables.model_cards.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        card.db_id = new_db_id();
        tables.model_cards.insert(key, card);
        self.save(&tables).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_release(&self, mut release: Release) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let key = (release.model_id.clone(), release.semver.clone());
        if tables.releases.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        release.db_id = new_db_id();
        tables.releases.insert(key, release);
        self.save(&tables).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_file(&self, mut file: FileRecord) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let key = (file.model_id.clone(), file.id.clone());
        if tables.files.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        file.db_id = new_db_id();
        tables.files.insert(key, file);
        self.save(&tables).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_file_complete(&self, model_id: &str, file_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let file = tables
            .files
            .get_mut(&(model_id.to_string(), file_id.to_string()))
            .ok_or_else(|| MirrorError::NotFound(format!("File {} of model {}", file_id, model_id)))?;

        if file.state() == FileState::Complete {
            return Ok(false);
        }
        file.complete = true;
        self.save(&tables).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn card(model_id: &str, version: u32) -> ModelCardRevision {
        ModelCardRevision {
            db_id: None,
            model_id: model_id.to_string(),
            schema_id: "minimal-general-v10".to_string(),
            version,
            metadata: serde_json::json!({"overview": {"summary": "test"}}),
            created_by: "user".to_string(),
            created_at: Utc::now(),
        }
    }

    fn file(model_id: &str, id: &str) -> FileRecord {
        FileRecord {
            db_id: None,
            id: id.to_string(),
            model_id: model_id.to_string(),
            name: "weights.bin".to_string(),
            size: 1024,
            mime: "application/octet-stream".to_string(),
            bucket: "uploads".to_string(),
            path: format!("beta/model/{}/files/{}", model_id, id),
            complete: false,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_model_card_is_idempotent() {
        let store = LocalModelStore::in_memory();
        assert_eq!(
            store.insert_model_card(card("m1", 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_model_card(card("m1", 1)).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(
            store.insert_model_card(card("m2", 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.model_cards("m1").await.unwrap().len(), 1);
        assert!(store.model_cards("m1").await.unwrap()[0].db_id.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_all_reach_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = std::sync::Arc::new(LocalModelStore::open(&path).unwrap());

        let tasks: Vec<_> = (1..=20)
            .map(|version| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_model_card(card("m1", version)).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), InsertOutcome::Inserted);
        }

        assert!(!path.with_extension("json.tmp").exists());
        let reopened = LocalModelStore::open(&path).unwrap();
        assert_eq!(reopened.model_cards("m1").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_mark_file_complete_flips_once() {
        let store = LocalModelStore::in_memory();
        store.insert_file(file("m1", "f1")).await.unwrap();
        assert!(store.mark_file_complete("m1", "f1").await.unwrap());
        assert!(!store.mark_file_complete("m1", "f1").await.unwrap());
        assert!(store.file("m1", "f1").await.unwrap().unwrap().complete);
    }

    #[tokio::test]
    async fn test_mark_missing_file_is_not_found() {
        let store = LocalModelStore::in_memory();
        let err = store.mark_file_complete("m1", "nope").await.unwrap_err();
        assert!(matches!(err, MirrorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("models.json");

        {
            let store = LocalModelStore::open(&path).unwrap();
            store.put_model(Model::new("m1", "Model one")).await.unwrap();
            store.insert_model_card(card("m1", 1)).await.unwrap();
            store.insert_file(file("m1", "f1")).await.unwrap();
        }

        let store = LocalModelStore::open(&path).unwrap();
        assert_eq!(store.list_models().await.unwrap().len(), 1);
        assert_eq!(store.model_cards("m1").await.unwrap().len(), 1);
        assert!(store.file("m1", "f1").await.unwrap().is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
