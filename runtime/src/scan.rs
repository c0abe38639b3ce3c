//! Post-import scanning.
//!
//! Scanners run in the background once a file or image is committed. A
//! failing scanner is logged and never affects the import that triggered it.
//! Results are published as `scan.*` events; finished tasks are reaped on
//! the next submission, so nothing accumulates in a long-running process.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::error::Result;
use mirror_core::event::{events, EventEmitter, MirrorEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;

/// Something that can be scanned after import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Artefact {
    #[serde(rename_all = "camelCase")]
    File {
        model_id: String,
        file_id: String,
        bucket: String,
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        model_id: String,
        name: String,
        tag: String,
        key: String,
    },
}

impl Artefact {
    pub fn model_id(&self) -> &str {
        match self {
            Artefact::File { model_id, .. } | Artefact::Image { model_id, .. } => model_id,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Artefact::File { key, .. } | Artefact::Image { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanState {
    Complete,
    Error,
}

/// Outcome reported by one scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactScanResult {
    pub tool_name: String,
    pub scanner_version: Option<String>,
    pub state: ScanState,
    pub is_infected: Option<bool>,
    #[serde(default)]
    pub summary: Vec<String>,
    pub last_run_at: DateTime<Utc>,
}

/// A scanning connector.
#[async_trait]
pub trait ArtefactScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, artefact: &Artefact) -> Result<ArtefactScanResult>;
}

/// Fans artefacts out to every configured scanner in the background.
#[derive(Clone, Default)]
pub struct Scanners {
    scanners: Vec<Arc<dyn ArtefactScanner>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    events: EventEmitter,
}

impl Scanners {
    pub fn new(scanners: Vec<Arc<dyn ArtefactScanner>>) -> Self {
        Self {
            scanners,
            ..Default::default()
        }
    }

    /// Publish scan results on `events`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Number of scan tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Start scanning `artefact` with every scanner without waiting.
    pub fn submit(&self, artefact: Artefact) {
        if self.scanners.is_empty() {
            return;
        }
        let scanners = self.scanners.clone();
        let events = self.events.clone();

        let mut tasks = self.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!(error = %e, "Scan task panicked");
            }
        }
        tasks.spawn(async move {
            for scanner in scanners {
                let event = match scanner.scan(&artefact).await {
                    Ok(result) => {
                        tracing::info!(
                            scanner = %scanner.name(),
                            model_id = %artefact.model_id(),
                            state = ?result.state,
                            infected = ?result.is_infected,
                            "Artefact scanned"
                        );
                        MirrorEvent::with_fields(
                            events::SCAN_COMPLETED,
                            [
                                ("scanner", json!(scanner.name())),
                                ("artefact", json!(artefact)),
                                ("result", json!(result)),
                            ],
                        )
                    }
                    Err(e) => {
                        tracing::warn!(
                            scanner = %scanner.name(),
                            model_id = %artefact.model_id(),
                            error = %e,
                            "Artefact scan failed"
                        );
                        MirrorEvent::with_fields(
                            events::SCAN_FAILED,
                            [
                                ("scanner", json!(scanner.name())),
                                ("artefact", json!(artefact)),
                                ("error", json!(e.to_string())),
                            ],
                        )
                    }
                };
                events.emit(event);
            }
        });
    }

    /// Wait for every scan still running.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::warn!(error = %e, "Scan task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::error::MirrorError;

    struct StaticScanner {
        fail: bool,
    }

    #[async_trait]
    impl ArtefactScanner for StaticScanner {
        fn name(&self) -> &str {
            if self.fail {
                "broken"
            } else {
                "clean"
            }
        }

        async fn scan(&self, _artefact: &Artefact) -> Result<ArtefactScanResult> {
            if self.fail {
                return Err(MirrorError::external("scanner", "unreachable"));
            }
            Ok(ArtefactScanResult {
                tool_name: self.name().to_string(),
                scanner_version: Some("1.0".to_string()),
                state: ScanState::Complete,
                is_infected: Some(false),
                summary: Vec::new(),
                last_run_at: Utc::now(),
            })
        }
    }

    fn artefact() -> Artefact {
        Artefact::File {
            model_id: "m2".to_string(),
            file_id: "f1".to_string(),
            bucket: "uploads".to_string(),
            key: "beta/model/m2/files/f1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_scanner_does_not_hide_others() {
        let events = EventEmitter::new(16);
        let mut rx = events.subscribe();
        let scanners = Scanners::new(vec![
            Arc::new(StaticScanner { fail: true }),
            Arc::new(StaticScanner { fail: false }),
        ])
        .with_events(events);
        scanners.submit(artefact());
        scanners.drain().await;

        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.key, events::SCAN_FAILED);
        assert_eq!(failed.field("scanner"), Some(&json!("broken")));
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.key, events::SCAN_COMPLETED);
        let result: ArtefactScanResult =
            serde_json::from_value(completed.field("result").unwrap().clone()).unwrap();
        assert_eq!(result.tool_name, "clean");
        assert_eq!(scanners.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_scanners_is_noop() {
        let scanners = Scanners::default();
        scanners.submit(artefact());
        assert_eq!(scanners.pending(), 0);
        scanners.drain().await;
    }

    #[tokio::test]
    async fn test_finished_scans_are_reaped_on_submit() {
        let scanners = Scanners::new(vec![Arc::new(StaticScanner { fail: false })]);
        for _ in 0..100 {
            scanners.submit(artefact());
        }
        scanners.drain().await;
        assert_eq!(scanners.pending(), 0);

        for _ in 0..1000 {
            scanners.submit(artefact());
            tokio::task::yield_now().await;
        }
        assert!(scanners.pending() <= 2, "retained {} tasks", scanners.pending());
        scanners.drain().await;
        assert_eq!(scanners.pending(), 0);
    }

    #[test]
    fn test_artefact_serializes_with_kind_tag() {
        let value = serde_json::to_value(artefact()).unwrap();
        assert_eq!(value["kind"], "file");
        assert_eq!(value["fileId"], "f1");
    }
}
