//! Prometheus metrics for export and import runs.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use mirror_core::error::{MirrorError, Result};

fn metrics_error(e: prometheus::Error) -> MirrorError {
    MirrorError::Other(format!("Failed to initialise metrics: {}", e))
}

/// Counters and histograms for the transfer pipeline.
pub struct MirrorMetrics {
    registry: Registry,

    /// Finished exports by outcome
    pub exports_total: IntCounterVec,
    /// Finished imports by kind and outcome
    pub imports_total: IntCounterVec,
    /// Imported entities by kind and outcome (imported, skipped, failed)
    pub entities_total: IntCounterVec,
    /// Bytes uploaded to object storage by artifact kind
    pub bytes_uploaded_total: CounterVec,
    /// Bytes downloaded from payload URLs by import kind
    pub bytes_downloaded_total: CounterVec,
    /// Wall-clock duration of whole operations
    pub operation_duration_seconds: HistogramVec,
}

impl MirrorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let exports_total = IntCounterVec::new(
            Opts::new("mirror_exports_total", "Finished exports"),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        let imports_total = IntCounterVec::new(
            Opts::new("mirror_imports_total", "Finished imports"),
            &["kind", "outcome"],
        )
        .map_err(metrics_error)?;

        let entities_total = IntCounterVec::new(
            Opts::new("mirror_import_entities_total", "Imported entities"),
            &["kind", "outcome"],
        )
        .map_err(metrics_error)?;

        let bytes_uploaded_total = CounterVec::new(
            Opts::new("mirror_bytes_uploaded_total", "Bytes uploaded to object storage"),
            &["artifact"],
        )
        .map_err(metrics_error)?;

        let bytes_downloaded_total = CounterVec::new(
            Opts::new("mirror_bytes_downloaded_total", "Bytes downloaded from payload URLs"),
            &["kind"],
        )
        .map_err(metrics_error)?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mirror_operation_duration_seconds",
                "Duration of export and import operations in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(exports_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(imports_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(entities_total.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(bytes_uploaded_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(bytes_downloaded_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operation_duration_seconds.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            exports_total,
            imports_total,
            entities_total,
            bytes_uploaded_total,
            bytes_downloaded_total,
            operation_duration_seconds,
        })
    }

    pub fn record_export(&self, success: bool, seconds: f64) {
        self.exports_total
            .with_label_values(&[outcome(success)])
            .inc();
        self.operation_duration_seconds
            .with_label_values(&["export"])
            .observe(seconds);
    }

    pub fn record_import(&self, kind: &str, success: bool, seconds: f64) {
        self.imports_total
            .with_label_values(&[kind, outcome(success)])
            .inc();
        self.operation_duration_seconds
            .with_label_values(&["import"])
            .observe(seconds);
    }

    pub fn record_entity(&self, kind: &str, outcome: &str) {
        self.entities_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn add_uploaded(&self, artifact: &str, bytes: u64) {
        self.bytes_uploaded_total
            .with_label_values(&[artifact])
            .inc_by(bytes as f64);
    }

    pub fn add_downloaded(&self, kind: &str, bytes: u64) {
        self.bytes_downloaded_total
            .with_label_values(&[kind])
            .inc_by(bytes as f64);
    }

    /// Prometheus text exposition of every metric.
    pub fn gather(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MirrorError::Other(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| MirrorError::Other(e.to_string()))
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
