//! CLI command definitions and dispatch.

mod export;
mod import;
mod models;
mod verify;
mod version;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use mirror_core::config::MirrorConfig;
use mirror_core::context::OperationContext;
use mirror_runtime::MirrorRuntime;

/// Model Mirror: export models to a receiving instance and import them there.
#[derive(Parser)]
#[command(name = "model-mirror", version, about)]
pub struct Cli {
    /// Configuration file (YAML); defaults plus MIRROR_* variables when omitted
    #[arg(short, long, global = true, env = "MIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Write Prometheus metrics of the run to this file when the command ends
    #[arg(long, global = true, env = "MIRROR_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Export a model and notify the receiving instance
    Export(export::ExportArgs),
    /// Import an export payload into its mirrored model
    Import(import::ImportArgs),
    /// Check a stored artifact against its detached signature
    Verify(verify::VerifyArgs),
    /// List models in the local store
    Models(models::ModelsArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load the configuration file, or fall back to defaults and environment.
pub fn load_config(path: Option<&Path>) -> mirror_core::Result<MirrorConfig> {
    match path {
        Some(path) => MirrorConfig::from_file(path),
        None => MirrorConfig::from_env(),
    }
}

/// Context bounded by the configured operation timeout.
pub(crate) fn operation_context(config: &MirrorConfig, timeout_secs: Option<u64>) -> OperationContext {
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeouts.operation());
    OperationContext::with_timeout(timeout)
}

/// Return the path of the local model store snapshot (~/.model-mirror/store.json).
pub(crate) fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".model-mirror"))
        .unwrap_or_else(|| PathBuf::from(".model-mirror"))
        .join("store.json")
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, mut config: MirrorConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Version(args) = cli.command {
        return version::execute(args).await;
    }

    if config.store.path.is_none() {
        config.store.path = Some(default_store_path());
    }

    let runtime = MirrorRuntime::from_config(config).await?;
    let metrics_file = cli.metrics_file.clone();
    let result = match cli.command {
        Command::Export(args) => export::execute(&runtime, args).await,
        Command::Import(args) => import::execute(&runtime, args).await,
        Command::Verify(args) => verify::execute(&runtime, args).await,
        Command::Models(args) => models::execute(&runtime, args).await,
        Command::Version(args) => version::execute(args).await,
    };

    // Failed runs still report their counters
    if let Some(ref path) = metrics_file {
        write_metrics(&runtime, path)?;
    }
    result
}

/// Write the runtime's metrics in the Prometheus text format.
pub(crate) fn write_metrics(runtime: &MirrorRuntime, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, runtime.metrics.gather()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_requires_model() {
        assert!(Cli::try_parse_from(["model-mirror", "export", "--agree"]).is_err());
        let cli = Cli::try_parse_from([
            "model-mirror",
            "export",
            "--model",
            "m1",
            "--release",
            "v1.0.0",
            "--release",
            "v1.1.0",
            "--agree",
        ])
        .unwrap();
        match cli.command {
            Command::Export(args) => {
                assert_eq!(args.model, "m1");
                assert_eq!(args.release, vec!["v1.0.0", "v1.1.0"]);
                assert!(args.agree);
            }
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["model-mirror", "models", "--config", "/etc/mirror.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/mirror.yaml")));
    }

    #[test]
    fn test_default_store_path_is_json_snapshot() {
        let path = default_store_path();
        assert!(path.ends_with(".model-mirror/store.json"));
    }

    #[test]
    fn test_metrics_file_flag() {
        let cli = Cli::try_parse_from(["model-mirror", "models", "--metrics-file", "/tmp/mirror.prom"]).unwrap();
        assert_eq!(cli.metrics_file, Some(PathBuf::from("/tmp/mirror.prom")));
    }

    #[tokio::test]
    async fn test_write_metrics_exposes_counters() {
        let mut config = MirrorConfig::default();
        config.storage.backend = mirror_core::config::StorageBackend::Memory;
        let runtime = MirrorRuntime::from_config(config).await.unwrap();
        runtime.metrics.record_export(true, 0.5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("mirror.prom");
        write_metrics(&runtime, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("mirror_exports_total{outcome=\"success\"} 1"));
        assert!(text.contains("mirror_operation_duration_seconds"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.yaml");
        std::fs::write(
            &path,
            "instance_name: east\nstorage:\n  backend: memory\n  bucket: exports\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.instance_name, "east");
        assert_eq!(config.storage.bucket, "exports");
    }
}
