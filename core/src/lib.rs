//! Model Mirror Core - entities, export metadata and shared plumbing.
//!
//! Types in this crate are shared by the exporting and the receiving side
//! of a mirror: the documents that travel inside archives, the webhook body
//! announcing an archive, configuration, errors and progress events.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod metadata;
pub mod model;

// Re-export commonly used types
pub use config::{MirrorConfig, PipelineConfig, StorageBackend, SigningBackend};
pub use context::OperationContext;
pub use error::{MirrorError, Result, Severity};
pub use event::{EventEmitter, MirrorEvent};
pub use metadata::{ExportMetadata, ImportKind, ImportRequest, Signature, EXPORT_SCHEMA_VERSION};
pub use model::{FileRecord, FileState, ImageRef, Model, ModelCardRevision, Release};

/// Model Mirror version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
