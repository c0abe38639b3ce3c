//! Export from one instance, import into another.
//!
//! Both instances share an in-memory object store for payload URLs, and
//! image layers come from a local registry served over HTTP.

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use flate2::read::GzDecoder;
use mirror_core::config::PipelineConfig;
use mirror_core::context::OperationContext;
use mirror_core::error::MirrorError;
use mirror_core::event::{events, EventEmitter};
use mirror_core::metadata::{ExportMetadata, ImportKind, ImportRequest};
use mirror_runtime::archive::{collect_stream, write_bundle, BundleEntry, IMAGE_LAYERS_ENTRY};
use mirror_runtime::export::ExportSelection;
use mirror_runtime::scan::Scanners;
use mirror_runtime::storage::image_export_key;
use mirror_runtime::{
    ExportService, ImportService, IntegritySigner, LocalKms, MemoryObjectStore, MirrorMetrics, ModelStore,
    ObjectStore, RegistryClient, TokenProvider,
};

const SOURCE_BUCKET: &str = "source-uploads";
const DEST_BUCKET: &str = "dest-uploads";

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        channel_capacity: 4,
        chunk_size: 256,
        ..Default::default()
    }
}

fn layers() -> Vec<Vec<u8>> {
    vec![vec![0x11; 3000], b"second layer contents".to_vec()]
}

struct Instances {
    source_objects: Arc<MemoryObjectStore>,
    dest_store: Arc<mirror_runtime::LocalModelStore>,
    dest_objects: Arc<MemoryObjectStore>,
    export: ExportService,
    import: ImportService,
    trigger: Arc<RecordingTrigger>,
    events: EventEmitter,
    metrics: Arc<MirrorMetrics>,
}

async fn instances() -> Instances {
    let registry = MockRegistry::serve("m1/img", "tag1", &layers()).await;

    let source_store = source_store(SOURCE_BUCKET).await;
    let source_objects = Arc::new(MemoryObjectStore::new(SOURCE_BUCKET));
    source_objects.insert("beta/model/m1/files/f1", file_bytes());

    let trigger = Arc::new(RecordingTrigger::default());
    let events = EventEmitter::default();
    let metrics = Arc::new(MirrorMetrics::new().unwrap());
    let kms = Arc::new(LocalKms::from_bytes("mirror-key", &[9u8; 32]).unwrap());
    let export = ExportService::new(
        source_store,
        source_objects.clone(),
        RegistryClient::new(&registry.url, 2, Duration::from_secs(5)).unwrap(),
        TokenProvider::anonymous(),
        pipeline(),
        "source-instance",
    )
    .with_signer(IntegritySigner::new(kms, "mirror-key"))
    .with_trigger(trigger.clone())
    .with_events(events.clone())
    .with_metrics(metrics.clone());

    let dest_store = destination_store().await;
    let dest_objects = Arc::new(MemoryObjectStore::new(DEST_BUCKET));
    let import = ImportService::new(
        dest_store.clone(),
        dest_objects.clone(),
        source_objects.clone(),
        Scanners::default(),
        pipeline(),
    )
    .with_events(events.clone())
    .with_metrics(metrics.clone());

    Instances {
        source_objects,
        dest_store,
        dest_objects,
        export,
        import,
        trigger,
        events,
        metrics,
    }
}

/// Write `entries` as a bundle into the source bucket and return its payload URL.
async fn publish(instances: &Instances, key: &str, entries: Vec<BundleEntry>) -> String {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let bundle = write_bundle(rx, &pipeline());
    tokio::spawn(async move {
        for entry in entries {
            tx.send(entry).await.unwrap();
        }
    });
    let payload = collect_stream(bundle.stream).await.unwrap();
    instances.source_objects.insert(key, payload);
    instances
        .source_objects
        .presign_get(key, Duration::from_secs(60))
        .await
        .unwrap()
}

fn layers_entry(data: Vec<u8>) -> BundleEntry {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let size = data.len() as u64;
    tokio::spawn(async move {
        let _ = tx.send(Ok(bytes::Bytes::from(data))).await;
    });
    BundleEntry::Blob {
        path: IMAGE_LAYERS_ENTRY.to_string(),
        size,
        chunks: rx,
    }
}

fn image_request(payload_url: String) -> ImportRequest {
    ImportRequest {
        payload_url,
        mirrored_model_id: "m2".to_string(),
        source_model_id: "m1".to_string(),
        exporter: "source-instance".to_string(),
        import_kind: ImportKind::Image,
        file_path: None,
        distribution_package_name: Some("img:tag1".to_string()),
    }
}

async fn export_and_import(instances: &Instances) -> Vec<ImportRequest> {
    let ctx = OperationContext::unbounded();
    let receipt = instances
        .export
        .export_model(&ctx, "alice", "m1", &ExportSelection::releases(["v1.0.0"]), true)
        .await
        .unwrap();
    assert!(receipt.notified);
    assert_eq!(receipt.artifacts.len(), 3);

    let requests = instances.trigger.requests.lock().clone();
    for request in &requests {
        instances.import.import_model(&ctx, "bob", request).await.unwrap();
    }
    requests
}

#[tokio::test]
async fn test_round_trip_into_fresh_mirror() {
    let instances = instances().await;
    let requests = export_and_import(&instances).await;
    let kinds: Vec<ImportKind> = requests.iter().map(|r| r.import_kind).collect();
    assert_eq!(kinds, vec![ImportKind::Release, ImportKind::File, ImportKind::Image]);

    let store = &instances.dest_store;
    let releases = store.releases("m2").await.unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].semver, "v1.0.0");
    assert_eq!(releases[0].notes, "Initial release");
    assert_eq!(releases[0].images[0].repository, "m2");

    let cards = store.model_cards("m2").await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].version, 1);

    let files = store.files("m2").await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].complete);
    assert_eq!(files[0].size, FILE_SIZE as u64);
    assert_eq!(files[0].bucket, DEST_BUCKET);
    assert_eq!(
        instances.dest_objects.get_bytes("beta/model/m2/files/f1").unwrap(),
        file_bytes()
    );

    assert!(store.releases("m1").await.unwrap().is_empty());
    assert!(store.files("m1").await.unwrap().is_empty());

    let image = instances
        .dest_objects
        .get_bytes(&image_export_key("m2", "img", "tag1"))
        .unwrap();
    let mut unpacked = Vec::new();
    GzDecoder::new(image.as_ref()).read_to_end(&mut unpacked).unwrap();
    assert_eq!(unpacked, layers().concat());
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let instances = instances().await;
    let requests = export_and_import(&instances).await;
    let ctx = OperationContext::unbounded();

    let documents = instances.import.import_model(&ctx, "bob", &requests[0]).await.unwrap();
    assert_eq!(documents.import_result.releases.skipped, 1);
    assert_eq!(documents.import_result.model_cards.skipped, 1);
    assert_eq!(documents.import_result.files.skipped, 1);
    assert_eq!(documents.import_result.releases.imported, 0);

    let file = instances.import.import_model(&ctx, "bob", &requests[1]).await.unwrap();
    assert_eq!(file.import_result.files.skipped, 1);

    let image = instances.import.import_model(&ctx, "bob", &requests[2]).await.unwrap();
    assert_eq!(image.import_result.images.skipped, 1);

    assert_eq!(instances.dest_store.releases("m2").await.unwrap().len(), 1);
    assert_eq!(instances.dest_store.model_cards("m2").await.unwrap().len(), 1);
    assert_eq!(instances.dest_store.files("m2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_exported_artifacts_verify() {
    let instances = instances().await;
    let ctx = OperationContext::unbounded();
    let receipt = instances
        .export
        .export_model(&ctx, "alice", "m1", &ExportSelection::releases(["v1.0.0"]), true)
        .await
        .unwrap();
    for artifact in &receipt.artifacts {
        let verification = instances.export.verify_artifact(&ctx, &artifact.key).await.unwrap();
        assert!(verification.is_valid(), "{} failed verification", artifact.key);
    }
}

#[tokio::test]
async fn test_mismatched_model_id_keeps_earlier_entities() {
    let instances = instances().await;
    let ctx = OperationContext::unbounded();

    let metadata = ExportMetadata::new("source-instance", "m1", "m2", ImportKind::Release);
    let mut foreign = release("m9", "v2.0.0", Vec::new());
    foreign.file_ids.clear();

    let url = publish(
        &instances,
        "beta/mirror/m1/documents/crafted.tar.gz",
        vec![
            BundleEntry::json("metadata.json", &metadata).unwrap(),
            BundleEntry::json("model-cards/1.json", &model_card("m1", 1)).unwrap(),
            BundleEntry::json("releases/v2.0.0.json", &foreign).unwrap(),
        ],
    )
    .await;
    let request = ImportRequest::from_metadata(&metadata, url);

    let err = instances.import.import_model(&ctx, "bob", &request).await.unwrap_err();
    match err {
        MirrorError::ValidationError {
            entity,
            mirrored_model_id,
            source_model_id,
            ..
        } => {
            assert_eq!(entity, "releases/v2.0.0.json");
            assert_eq!(mirrored_model_id, "m2");
            assert_eq!(source_model_id, "m1");
        }
        other => panic!("expected a validation error, got {:?}", other),
    }

    assert_eq!(instances.dest_store.model_cards("m2").await.unwrap().len(), 1);
    assert!(instances.dest_store.releases("m2").await.unwrap().is_empty());
    assert!(instances.dest_store.releases("m9").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_image_request_without_package_name_is_rejected_before_fetch() {
    let instances = instances().await;
    let fetcher = Arc::new(CountingFetcher::new(instances.source_objects.clone()));
    let import = ImportService::new(
        instances.dest_store.clone(),
        instances.dest_objects.clone(),
        fetcher.clone(),
        Scanners::default(),
        pipeline(),
    );

    let request = ImportRequest {
        payload_url: "memory://source-uploads/beta/registry/m1/img/blobs/compressed/tag1.tar.gz".to_string(),
        mirrored_model_id: "m2".to_string(),
        source_model_id: "m1".to_string(),
        exporter: "source-instance".to_string(),
        import_kind: ImportKind::Image,
        file_path: None,
        distribution_package_name: None,
    };
    let err = import
        .import_model(&OperationContext::unbounded(), "bob", &request)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::InvalidRequest(_)));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_truncated_image_payload_is_not_stored() {
    let instances = instances().await;
    let ctx = OperationContext::unbounded();
    let requests = {
        instances
            .export
            .export_model(&ctx, "alice", "m1", &ExportSelection::releases(["v1.0.0"]), true)
            .await
            .unwrap();
        instances.trigger.requests.lock().clone()
    };
    let image_request = requests
        .iter()
        .find(|r| r.import_kind == ImportKind::Image)
        .unwrap()
        .clone();

    let key = instances.source_objects.key_from_url(&image_request.payload_url).unwrap().to_string();
    let payload = instances.source_objects.get_bytes(&key).unwrap();
    instances.source_objects.insert(key, payload.slice(..payload.len() / 2));

    let err = instances
        .import
        .import_model(&ctx, "bob", &image_request)
        .await
        .unwrap_err();
    assert!(!matches!(err, MirrorError::InvalidRequest(_)));
    assert!(instances
        .dest_objects
        .get_bytes(&image_export_key("m2", "img", "tag1"))
        .is_none());
}

#[tokio::test]
async fn test_import_into_unrelated_model_is_rejected() {
    let instances = instances().await;
    instances
        .dest_store
        .put_model(mirror_core::model::Model::new("m3", "Unrelated"))
        .await
        .unwrap();

    let request = ImportRequest {
        payload_url: "memory://source-uploads/whatever.tar.gz".to_string(),
        mirrored_model_id: "m3".to_string(),
        source_model_id: "m1".to_string(),
        exporter: "source-instance".to_string(),
        import_kind: ImportKind::Release,
        file_path: None,
        distribution_package_name: None,
    };
    let err = instances
        .import
        .import_model(&OperationContext::unbounded(), "bob", &request)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_image_exported_from_another_model_is_rejected() {
    let instances = instances().await;
    let foreign = ExportMetadata::new("source-instance", "m9", "m2", ImportKind::Image)
        .with_distribution_package_name("img:tag1");
    let url = publish(
        &instances,
        "beta/registry/m9/img/blobs/compressed/tag1.tar.gz",
        vec![
            BundleEntry::json("metadata.json", &foreign).unwrap(),
            layers_entry(b"layers of another model".to_vec()),
        ],
    )
    .await;

    let err = instances
        .import
        .import_model(&OperationContext::unbounded(), "bob", &image_request(url))
        .await
        .unwrap_err();
    match err {
        MirrorError::ValidationError {
            entity, source_model_id, ..
        } => {
            assert_eq!(entity, "metadata.json");
            assert_eq!(source_model_id, "m9");
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
    assert!(instances
        .dest_objects
        .get_bytes(&image_export_key("m2", "img", "tag1"))
        .is_none());
}

#[tokio::test]
async fn test_image_without_export_header_is_rejected() {
    let instances = instances().await;
    let url = publish(
        &instances,
        "beta/registry/m1/img/blobs/compressed/tag1.tar.gz",
        vec![layers_entry(b"bare layers".to_vec())],
    )
    .await;

    let err = instances
        .import
        .import_model(&OperationContext::unbounded(), "bob", &image_request(url))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::ValidationError { ref entity, .. } if entity == IMAGE_LAYERS_ENTRY));
    assert!(instances
        .dest_objects
        .get_bytes(&image_export_key("m2", "img", "tag1"))
        .is_none());
}

#[tokio::test]
async fn test_malformed_export_metadata_is_a_validation_error() {
    let instances = instances().await;
    let url = publish(
        &instances,
        "beta/mirror/m1/documents/broken.tar.gz",
        vec![BundleEntry::Json {
            path: "metadata.json".to_string(),
            data: b"{\"schemaVersion\": ".to_vec(),
        }],
    )
    .await;
    let request = ImportRequest {
        payload_url: url,
        mirrored_model_id: "m2".to_string(),
        source_model_id: "m1".to_string(),
        exporter: "source-instance".to_string(),
        import_kind: ImportKind::Release,
        file_path: None,
        distribution_package_name: None,
    };

    let err = instances
        .import
        .import_model(&OperationContext::unbounded(), "bob", &request)
        .await
        .unwrap_err();
    match err {
        MirrorError::ValidationError {
            entity,
            mirrored_model_id,
            source_model_id,
            ..
        } => {
            assert_eq!(entity, "metadata.json");
            assert_eq!(mirrored_model_id, "m2");
            assert_eq!(source_model_id, "m1");
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_trip_publishes_events_and_metrics() {
    let instances = instances().await;
    let mut feed = instances.events.subscribe();
    export_and_import(&instances).await;

    let mut seen = Vec::new();
    while let Ok(event) = feed.try_recv() {
        let detail = match event.key.as_str() {
            events::EXPORT_ARTIFACT => event.field("kind").cloned(),
            events::IMPORT_ENTITY => event.field("outcome").cloned(),
            _ => None,
        };
        seen.push((event.key, detail.and_then(|v| v.as_str().map(str::to_string))));
    }
    let seen: Vec<(&str, Option<&str>)> = seen.iter().map(|(k, d)| (k.as_str(), d.as_deref())).collect();
    assert_eq!(
        seen,
        vec![
            (events::EXPORT_STARTED, None),
            (events::EXPORT_ARTIFACT, Some("release")),
            (events::EXPORT_ARTIFACT, Some("file")),
            (events::EXPORT_ARTIFACT, Some("image")),
            (events::EXPORT_COMPLETED, None),
            (events::IMPORT_STARTED, None),
            (events::IMPORT_ENTITY, Some("imported")),
            (events::IMPORT_ENTITY, Some("imported")),
            (events::IMPORT_ENTITY, Some("imported")),
            (events::IMPORT_COMPLETED, None),
            (events::IMPORT_STARTED, None),
            (events::IMPORT_ENTITY, Some("imported")),
            (events::IMPORT_COMPLETED, None),
            (events::IMPORT_STARTED, None),
            (events::IMPORT_ENTITY, Some("imported")),
            (events::IMPORT_COMPLETED, None),
        ]
    );

    let metrics = &instances.metrics;
    assert_eq!(metrics.exports_total.with_label_values(&["success"]).get(), 1);
    for kind in ["release", "file", "image"] {
        assert_eq!(metrics.imports_total.with_label_values(&[kind, "success"]).get(), 1);
    }
    assert_eq!(metrics.entities_total.with_label_values(&["modelCard", "imported"]).get(), 1);
    assert_eq!(metrics.entities_total.with_label_values(&["release", "imported"]).get(), 1);
    assert_eq!(metrics.entities_total.with_label_values(&["file", "imported"]).get(), 2);
    assert_eq!(metrics.entities_total.with_label_values(&["image", "imported"]).get(), 1);
    assert_eq!(
        metrics.bytes_downloaded_total.with_label_values(&["file"]).get(),
        FILE_SIZE as f64
    );
    assert!(metrics.bytes_uploaded_total.with_label_values(&["image"]).get() > 0.0);

    let text = metrics.gather().unwrap();
    assert!(text.contains("mirror_import_entities_total{kind=\"file\",outcome=\"imported\"} 2"));
}
