//! `model-mirror verify` command.

use clap::Args;
use mirror_runtime::MirrorRuntime;

use crate::output;

#[derive(Args)]
pub struct VerifyArgs {
    /// Object keys of the artifacts to check
    #[arg(required = true)]
    pub keys: Vec<String>,

    /// Operation timeout in seconds (overrides the configuration)
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(runtime: &MirrorRuntime, args: VerifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = super::operation_context(&runtime.config, args.timeout);

    let mut table = output::new_table(&["KEY", "SHA256", "DIGEST", "SIGNATURE"]);
    let mut failed = 0usize;
    for key in &args.keys {
        let verification = runtime.export.verify_artifact(&ctx, key).await?;
        if !verification.is_valid() {
            failed += 1;
        }
        table.add_row(vec![
            verification.key.clone(),
            output::short_digest(&verification.sha256),
            check(verification.digest_matches),
            check(verification.signature_valid),
        ]);
    }
    println!("{table}");

    if failed > 0 {
        return Err(format!("{} of {} artifact(s) failed verification", failed, args.keys.len()).into());
    }
    Ok(())
}

fn check(ok: bool) -> String {
    let label = if ok { "ok" } else { "MISMATCH" };
    label.to_string()
}
