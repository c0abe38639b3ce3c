//! Notifying the receiving instance that an export is ready.

use std::time::Duration;

use async_trait::async_trait;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use mirror_core::metadata::ImportRequest;

/// Import endpoint on the receiving instance.
pub const IMPORT_PATH: &str = "/api/v2/model/import/s3";

/// Delivers an import request to the receiving instance.
#[async_trait]
pub trait ImportTrigger: Send + Sync {
    async fn trigger(&self, ctx: &OperationContext, request: &ImportRequest) -> Result<()>;
}

/// `POST {url}/api/v2/model/import/s3` with an optional bearer token.
pub struct HttpImportTrigger {
    http: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpImportTrigger {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MirrorError::ConfigError(format!("Failed to build remote client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
            auth_token,
        })
    }

    /// Full URL of the import endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), IMPORT_PATH)
    }
}

#[async_trait]
impl ImportTrigger for HttpImportTrigger {
    async fn trigger(&self, ctx: &OperationContext, request: &ImportRequest) -> Result<()> {
        let endpoint = self.endpoint();
        let mut builder = self.http.post(&endpoint).json(request);
        if let Some(ref token) = self.auth_token {
            builder = builder.bearer_auth(token);
        }

        ctx.run("remote import trigger", async {
            let response = builder
                .send()
                .await
                .map_err(|e| MirrorError::external("remote", format!("POST {} failed: {}", endpoint, e)))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(MirrorError::external(
                    "remote",
                    format!("POST {} returned {}: {}", endpoint, status, body.trim()),
                ));
            }
            Ok(())
        })
        .await?;

        tracing::info!(
            endpoint = %endpoint,
            kind = %request.import_kind,
            mirrored_model_id = %request.mirrored_model_id,
            "Triggered remote import"
        );
        Ok(())
    }
}
