//! Wiring the engine together from a [`MirrorConfig`].

use std::sync::Arc;
use std::time::Duration;

use mirror_core::config::{MirrorConfig, SigningBackend, StorageBackend};
use mirror_core::error::{MirrorError, Result};
use mirror_core::event::EventEmitter;

use crate::db::{LocalModelStore, ModelStore};
use crate::export::ExportService;
use crate::import::{HttpPayloadFetcher, ImportService, PayloadFetcher};
use crate::metrics::MirrorMetrics;
use crate::registry::{RegistryClient, TokenProvider};
use crate::remote::HttpImportTrigger;
use crate::scan::Scanners;
use crate::signer::{AwsKms, IntegritySigner, KeyManagementService, LocalKms};
use crate::storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};

/// Everything a process needs to export and import models.
pub struct MirrorRuntime {
    pub config: MirrorConfig,
    pub store: Arc<dyn ModelStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub signer: Option<IntegritySigner>,
    pub events: EventEmitter,
    pub metrics: Arc<MirrorMetrics>,
    pub export: ExportService,
    pub import: ImportService,
}

impl MirrorRuntime {
    /// Build the runtime with no artefact scanners.
    pub async fn from_config(config: MirrorConfig) -> Result<Self> {
        Self::with_scanners(config, Scanners::default()).await
    }

    pub async fn with_scanners(config: MirrorConfig, scanners: Scanners) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.request())
            .build()
            .map_err(|e| MirrorError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let store = open_store(&config)?;
        let (objects, fetcher) = open_objects(&config, http.clone()).await;
        let signer = build_signer(&config).await?;
        let events = EventEmitter::default();
        let metrics = Arc::new(MirrorMetrics::new()?);

        let registry = RegistryClient::with_http(http.clone(), &config.registry.url, config.registry.concurrency);
        let tokens = TokenProvider::from_config(&config.registry, http.clone());

        let mut export = ExportService::new(
            store.clone(),
            objects.clone(),
            registry,
            tokens,
            config.pipeline.clone(),
            config.instance_name.clone(),
        )
        .with_events(events.clone())
        .with_metrics(metrics.clone())
        .with_presign_ttl(Duration::from_secs(config.storage.presign_ttl_secs));
        if let Some(ref signer) = signer {
            export = export.with_signer(signer.clone());
        }
        if let Some(ref remote) = config.remote {
            let trigger = HttpImportTrigger::new(&remote.url, remote.auth_token.clone(), config.timeouts.request())?;
            export = export.with_trigger(Arc::new(trigger));
        }

        let scanners = scanners.with_events(events.clone());
        let import = ImportService::new(store.clone(), objects.clone(), fetcher, scanners, config.pipeline.clone())
            .with_events(events.clone())
            .with_metrics(metrics.clone());

        tracing::info!(
            instance = %config.instance_name,
            storage = ?config.storage.backend,
            bucket = %config.storage.bucket,
            signing = ?config.signing.backend,
            remote = config.remote.is_some(),
            "Mirror runtime ready"
        );

        Ok(Self {
            config,
            store,
            objects,
            signer,
            events,
            metrics,
            export,
            import,
        })
    }
}

fn open_store(config: &MirrorConfig) -> Result<Arc<dyn ModelStore>> {
    Ok(match config.store.path {
        Some(ref path) => Arc::new(LocalModelStore::open(path)?),
        None => Arc::new(LocalModelStore::in_memory()),
    })
}

/// Object store and the fetcher for payload URLs it presigns.
///
/// URLs from the in-memory store only resolve against that same store.
async fn open_objects(
    config: &MirrorConfig,
    http: reqwest::Client,
) -> (Arc<dyn ObjectStore>, Arc<dyn PayloadFetcher>) {
    match config.storage.backend {
        StorageBackend::S3 => {
            let objects: Arc<dyn ObjectStore> =
                Arc::new(S3ObjectStore::from_config(&config.storage, config.pipeline.part_size).await);
            let fetcher: Arc<dyn PayloadFetcher> = Arc::new(HttpPayloadFetcher::with_client(http));
            (objects, fetcher)
        }
        StorageBackend::Memory => {
            let memory = Arc::new(MemoryObjectStore::new(&config.storage.bucket));
            let objects: Arc<dyn ObjectStore> = memory.clone();
            let fetcher: Arc<dyn PayloadFetcher> = memory;
            (objects, fetcher)
        }
    }
}

async fn build_signer(config: &MirrorConfig) -> Result<Option<IntegritySigner>> {
    let signing = &config.signing;
    if signing.backend == SigningBackend::None {
        return Ok(None);
    }
    let key_id = signing
        .key_id
        .clone()
        .ok_or_else(|| MirrorError::ConfigError("signing.key_id is required".to_string()))?;

    let kms: Arc<dyn KeyManagementService> = match signing.backend {
        SigningBackend::Kms => Arc::new(AwsKms::from_region(signing.region.clone()).await),
        SigningBackend::Local => {
            let path = signing.local_key_path.as_ref().ok_or_else(|| {
                MirrorError::ConfigError("signing.local_key_path is required for the local backend".to_string())
            })?;
            Arc::new(LocalKms::from_file(key_id.clone(), path)?)
        }
        SigningBackend::None => return Ok(None),
    };
    Ok(Some(IntegritySigner::new(kms, key_id)))
}
