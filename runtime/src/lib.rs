//! Model Mirror Runtime - transfer pipeline implementation.
//!
//! This crate provides the export and import engines for mirroring models
//! between instances, including registry layer streaming, tar+gzip archives,
//! detached signatures and idempotent reconciliation.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod db;
pub mod export;
pub mod import;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod scan;
pub mod service;
pub mod signer;
pub mod storage;

// Re-export common types
pub use db::{InsertOutcome, LocalModelStore, ModelStore};
pub use export::{ArtifactVerification, ExportArtifact, ExportReceipt, ExportSelection, ExportService};
pub use import::{HttpPayloadFetcher, ImportOutcome, ImportResult, ImportService, KindSummary, PayloadFetcher};
pub use metrics::MirrorMetrics;
pub use registry::{DistributionPackage, RegistryClient, TokenProvider};
pub use remote::{HttpImportTrigger, ImportTrigger};
pub use scan::{Artefact, ArtefactScanResult, ArtefactScanner, Scanners};
pub use service::MirrorRuntime;
pub use signer::{AwsKms, IntegritySigner, KeyManagementService, LocalKms};
pub use storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};

/// Model Mirror Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
