//! `model-mirror import` command.

use std::path::PathBuf;

use clap::Args;
use mirror_core::event::events;
use mirror_core::metadata::{ImportKind, ImportRequest};
use mirror_runtime::{KindSummary, MirrorRuntime};

use crate::output;

#[derive(Args)]
pub struct ImportArgs {
    /// Read the webhook body from a JSON file instead of flags
    #[arg(long, conflicts_with_all = ["payload_url", "mirrored_model", "source_model"])]
    pub request: Option<PathBuf>,

    /// Pre-signed URL of the export payload
    #[arg(long, required_unless_present = "request")]
    pub payload_url: Option<String>,

    /// Model receiving the import
    #[arg(long, required_unless_present = "request")]
    pub mirrored_model: Option<String>,

    /// Model the payload was exported from
    #[arg(long, required_unless_present = "request")]
    pub source_model: Option<String>,

    /// Payload kind: modelCard, release, file or image
    #[arg(long, default_value = "release")]
    pub kind: ImportKind,

    /// Source path of the file (file imports)
    #[arg(long)]
    pub file_path: Option<String>,

    /// Image name and tag (image imports)
    #[arg(long)]
    pub distribution_package_name: Option<String>,

    /// Instance that produced the payload
    #[arg(long, default_value = "unknown")]
    pub exporter: String,

    /// User recorded as the initiator
    #[arg(long, env = "USER", default_value = "cli")]
    pub user: String,

    /// Operation timeout in seconds (overrides the configuration)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

impl ImportArgs {
    fn to_request(&self) -> Result<ImportRequest, Box<dyn std::error::Error>> {
        if let Some(ref path) = self.request {
            let data = std::fs::read(path)?;
            return Ok(serde_json::from_slice(&data)?);
        }
        Ok(ImportRequest {
            payload_url: self.payload_url.clone().unwrap_or_default(),
            mirrored_model_id: self.mirrored_model.clone().unwrap_or_default(),
            source_model_id: self.source_model.clone().unwrap_or_default(),
            exporter: self.exporter.clone(),
            import_kind: self.kind,
            file_path: self.file_path.clone(),
            distribution_package_name: self.distribution_package_name.clone(),
        })
    }
}

pub async fn execute(runtime: &MirrorRuntime, args: ImportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let request = args.to_request()?;
    let ctx = super::operation_context(&runtime.config, args.timeout);
    let mut feed = runtime.events.subscribe();
    let outcome = runtime.import.import_model(&ctx, &args.user, &request).await?;
    runtime.import.drain_scans().await;
    let mut scans = 0usize;
    while let Ok(event) = feed.try_recv() {
        if event.key == events::SCAN_COMPLETED {
            scans += 1;
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let result = &outcome.import_result;
    let mut table = output::new_table(&["KIND", "IMPORTED", "SKIPPED", "FAILED"]);
    let rows: [(&str, &KindSummary); 4] = [
        ("modelCard", &result.model_cards),
        ("release", &result.releases),
        ("file", &result.files),
        ("image", &result.images),
    ];
    for (kind, summary) in rows {
        if summary.total() == 0 {
            continue;
        }
        table.add_row(vec![
            kind.to_string(),
            summary.imported.to_string(),
            summary.skipped.to_string(),
            summary.failed.to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Imported into {} ({}), {} scan result(s)",
        outcome.mirrored_model.id,
        outcome.mirrored_model.name,
        scans
    );
    Ok(())
}
