//! `model-mirror export` command.

use clap::Args;
use mirror_runtime::export::ExportSelection;
use mirror_runtime::MirrorRuntime;

use crate::output;

#[derive(Args)]
pub struct ExportArgs {
    /// Model to export
    #[arg(short, long)]
    pub model: String,

    /// Release semver to include (repeatable)
    #[arg(short, long)]
    pub release: Vec<String>,

    /// Accept the export disclaimer
    #[arg(long)]
    pub agree: bool,

    /// User recorded as the initiator
    #[arg(long, env = "USER", default_value = "cli")]
    pub user: String,

    /// Operation timeout in seconds (overrides the configuration)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the receipt as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(runtime: &MirrorRuntime, args: ExportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = super::operation_context(&runtime.config, args.timeout);
    let selection = ExportSelection::releases(args.release);
    let receipt = runtime
        .export
        .export_model(&ctx, &args.user, &args.model, &selection, args.agree)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        return Ok(());
    }

    let mut table = output::new_table(&["KIND", "KEY", "SIZE", "SHA256", "SIGNED"]);
    for artifact in &receipt.artifacts {
        let signed = if artifact.signature.is_some() { "yes" } else { "no" };
        table.add_row(vec![
            artifact.metadata.import_kind.to_string(),
            artifact.key.clone(),
            output::format_bytes(artifact.size),
            output::short_digest(&artifact.sha256),
            signed.to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Exported {} as {} ({} artifacts, remote {})",
        receipt.model_id,
        receipt.mirrored_model_id,
        receipt.artifacts.len(),
        if receipt.notified { "notified" } else { "not configured" }
    );
    Ok(())
}
