//! `model-mirror models` command.

use clap::Args;
use mirror_runtime::MirrorRuntime;

use crate::output;

#[derive(Args)]
pub struct ModelsArgs {
    /// Only show model ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(runtime: &MirrorRuntime, args: ModelsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let models = runtime.store.list_models().await?;

    if args.quiet {
        for model in &models {
            println!("{}", model.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&[
        "ID", "NAME", "MIRRORS", "MIRRORED TO", "CARDS", "RELEASES", "FILES", "LATEST",
    ]);
    for model in &models {
        let cards = runtime.store.model_cards(&model.id).await?;
        let releases = runtime.store.releases(&model.id).await?;
        let files = runtime.store.files(&model.id).await?;
        let complete = files.iter().filter(|f| f.complete).count();
        let latest = releases
            .iter()
            .max_by_key(|r| r.created_at)
            .map(|r| format!("{} ({})", r.semver, output::format_ago(&r.created_at)))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            model.id.clone(),
            model.name.clone(),
            model.mirror.source_model_id.clone().unwrap_or_else(|| "-".to_string()),
            model.mirror.destination_model_id.clone().unwrap_or_else(|| "-".to_string()),
            cards.len().to_string(),
            releases.len().to_string(),
            format!("{}/{}", complete, files.len()),
            latest,
        ]);
    }

    println!("{table}");
    Ok(())
}
