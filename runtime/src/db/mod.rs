//! Model persistence.
//!
//! Inserts are insert-or-skip: a second insert under the same unique key
//! reports [`InsertOutcome::AlreadyExists`] and leaves the stored document
//! untouched. Retried webhooks and duplicate importer runs rely on this.

mod local;

use async_trait::async_trait;
use mirror_core::error::Result;
use mirror_core::model::{FileRecord, Model, ModelCardRevision, Release};

pub use local::LocalModelStore;

/// Result of an insert-or-skip write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

impl InsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

/// Storage of models and their cards, releases and file records.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get_model(&self, model_id: &str) -> Result<Option<Model>>;

    /// Create or replace a model.
    async fn put_model(&self, model: Model) -> Result<()>;

    async fn list_models(&self) -> Result<Vec<Model>>;

    /// Model card revisions of a model, oldest version first.
    async fn model_cards(&self, model_id: &str) -> Result<Vec<ModelCardRevision>>;

    /// Releases of a model, ordered by semver string.
    async fn releases(&self, model_id: &str) -> Result<Vec<Release>>;

    async fn release(&self, model_id: &str, semver: &str) -> Result<Option<Release>>;

    async fn files(&self, model_id: &str) -> Result<Vec<FileRecord>>;

    async fn file(&self, model_id: &str, file_id: &str) -> Result<Option<FileRecord>>;

    /// Insert unless `(modelId, version)` exists.
    async fn insert_model_card(&self, card: ModelCardRevision) -> Result<InsertOutcome>;

    /// Insert unless `(modelId, semver)` exists.
    async fn insert_release(&self, release: Release) -> Result<InsertOutcome>;

    /// Insert unless `(modelId, id)` exists.
    async fn insert_file(&self, file: FileRecord) -> Result<InsertOutcome>;

    /// Flip `complete` to true. Returns `false` if it was already complete.
    async fn mark_file_complete(&self, model_id: &str, file_id: &str) -> Result<bool>;
}
