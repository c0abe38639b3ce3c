//! Registry HTTP API v2 client for manifests and layer blobs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client as OciClient, Reference};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::token::PullAuth;

/// Manifest media types accepted from the registry.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

fn registry_error(message: impl Into<String>) -> MirrorError {
    MirrorError::external("registry", message)
}

/// Layers of one image, delivered in manifest order.
pub struct LayerStream {
    /// Number of layers listed in the manifest
    pub count: usize,
    /// Sum of the layer sizes listed in the manifest
    pub size: u64,
    /// Layer blobs; an `Err` ends the stream
    pub layers: mpsc::Receiver<io::Result<Bytes>>,
}

/// Where layer blobs are pulled from once the manifest is known.
enum LayerSource {
    Http(Option<String>),
    Oci(Reference),
}

/// Pulls manifests and blobs from a Docker/OCI registry.
///
/// Bearer pulls go over plain HTTP; basic credentials are handed to the OCI
/// client, which performs the registry's own token handshake.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    oci: Arc<OciClient>,
    base_url: String,
    concurrency: usize,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url`.
    pub fn new(base_url: impl Into<String>, concurrency: usize, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| MirrorError::ConfigError(format!("Failed to build registry client: {}", e)))?;
        Ok(Self::with_http(http, base_url, concurrency))
    }

    /// Create a client around an existing HTTP client.
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>, concurrency: usize) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let protocol = if base_url.starts_with("http://") {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let oci = OciClient::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self {
            http,
            oci: Arc::new(oci),
            base_url,
            concurrency: concurrency.max(1),
        }
    }

    fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.base_url)
    }

    /// OCI reference for `repository:tag` on this registry.
    pub fn oci_reference(&self, repository: &str, tag: &str) -> Result<Reference> {
        format!("{}/{}:{}", self.host(), repository, tag)
            .parse::<Reference>()
            .map_err(|e| registry_error(format!("Invalid image reference {}:{}: {}", repository, tag, e)))
    }

    async fn oci_manifest(
        &self,
        ctx: &OperationContext,
        auth: &OciRegistryAuth,
        reference: &Reference,
    ) -> Result<OciImageManifest> {
        let (manifest, digest) = ctx
            .run("registry manifest", async {
                self.oci
                    .pull_image_manifest(reference, auth)
                    .await
                    .map_err(|e| registry_error(format!("Failed to pull manifest {}: {}", reference, e)))
            })
            .await?;
        tracing::debug!(reference = %reference, digest = %digest, "Fetched manifest");
        Ok(manifest)
    }

    async fn fetch_layer(
        &self,
        ctx: &OperationContext,
        source: &LayerSource,
        repository: &str,
        layer: &OciDescriptor,
    ) -> Result<Bytes> {
        let reference = match source {
            LayerSource::Http(token) => {
                return self.fetch_blob(ctx, token.as_deref(), repository, &layer.digest).await;
            }
            LayerSource::Oci(reference) => reference,
        };

        let mut data: Vec<u8> = Vec::new();
        ctx.run("registry blob", async {
            self.oci
                .pull_blob(reference, layer, &mut data)
                .await
                .map_err(|e| registry_error(format!("Failed to pull layer {}: {}", layer.digest, e)))
        })
        .await?;

        verify_digest(&layer.digest, &data)?;
        tracing::debug!(repository = %repository, digest = %layer.digest, size = data.len(), "Fetched layer");
        Ok(Bytes::from(data))
    }

    async fn get(
        &self,
        ctx: &OperationContext,
        token: Option<&str>,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        ctx.run("registry request", async {
            let response = request
                .send()
                .await
                .map_err(|e| registry_error(format!("GET {} failed: {}", url, e)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(registry_error(format!("GET {} returned {}", url, status)));
            }
            Ok(response)
        })
        .await
    }

    /// Fetch and parse the image manifest for `repository:tag`.
    pub async fn fetch_manifest(
        &self,
        ctx: &OperationContext,
        token: Option<&str>,
        repository: &str,
        tag: &str,
    ) -> Result<OciImageManifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, tag);
        let response = self.get(ctx, token, &url, Some(MANIFEST_ACCEPT)).await?;
        let body = ctx
            .run("registry manifest", async {
                response
                    .bytes()
                    .await
                    .map_err(|e| registry_error(format!("Reading manifest {} failed: {}", url, e)))
            })
            .await?;

        serde_json::from_slice(&body)
            .map_err(|e| registry_error(format!("Invalid manifest for {}:{}: {}", repository, tag, e)))
    }

    /// Fetch a blob fully into memory and check it against its digest.
    pub async fn fetch_blob(
        &self,
        ctx: &OperationContext,
        token: Option<&str>,
        repository: &str,
        digest: &str,
    ) -> Result<Bytes> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, digest);
        let response = self.get(ctx, token, &url, None).await?;
        let data = ctx
            .run("registry blob", async {
                response
                    .bytes()
                    .await
                    .map_err(|e| registry_error(format!("Reading blob {} failed: {}", digest, e)))
            })
            .await?;

        verify_digest(digest, &data)?;
        tracing::debug!(repository = %repository, digest = %digest, size = data.len(), "Fetched layer");
        Ok(data)
    }

    /// Fetch the manifest, then stream its layers through a bounded channel.
    ///
    /// Up to `concurrency` blobs are in flight at once; they are delivered in
    /// manifest order. Manifest errors are returned directly, blob errors
    /// arrive as the last item of the stream.
    pub async fn stream_layers(
        &self,
        ctx: &OperationContext,
        auth: PullAuth,
        repository: &str,
        tag: &str,
        capacity: usize,
    ) -> Result<LayerStream> {
        let (manifest, source) = match auth {
            PullAuth::Bearer(token) => {
                let manifest = self.fetch_manifest(ctx, token.as_deref(), repository, tag).await?;
                (manifest, LayerSource::Http(token))
            }
            basic @ PullAuth::Basic { .. } => {
                let reference = self.oci_reference(repository, tag)?;
                let manifest = self.oci_manifest(ctx, &basic.to_oci_auth(), &reference).await?;
                (manifest, LayerSource::Oci(reference))
            }
        };
        let count = layer_digests(&manifest)?.len();
        let size = layers_size(&manifest)?;
        tracing::info!(repository = %repository, tag = %tag, layers = count, size, "Resolved image manifest");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = self.clone();
        let ctx = ctx.clone();
        let repository = repository.to_string();
        let source = Arc::new(source);

        tokio::spawn(async move {
            let fetches = futures::stream::iter(manifest.layers.into_iter().map(|layer| {
                let client = client.clone();
                let ctx = ctx.clone();
                let source = source.clone();
                let repository = repository.clone();
                async move { client.fetch_layer(&ctx, &source, &repository, &layer).await }
            }))
            .buffered(client.concurrency);
            let mut fetches = Box::pin(fetches);

            while let Some(result) = fetches.next().await {
                match result {
                    Ok(layer) => {
                        if tx.send(Ok(layer)).await.is_err() {
                            tracing::debug!(repository = %repository, "Layer consumer went away");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(repository = %repository, error = %e, "Layer fetch failed");
                        let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(LayerStream { count, size, layers: rx })
    }
}

/// Layer digests of a manifest. A missing or empty digest is an error.
pub fn layer_digests(manifest: &OciImageManifest) -> Result<Vec<String>> {
    manifest
        .layers
        .iter()
        .enumerate()
        .map(|(i, layer)| {
            if layer.digest.trim().is_empty() {
                Err(registry_error(format!("Missing digest for layer {}", i)))
            } else {
                Ok(layer.digest.clone())
            }
        })
        .collect()
}

/// Total size of the manifest's layers. A negative size is an error.
pub fn layers_size(manifest: &OciImageManifest) -> Result<u64> {
    manifest.layers.iter().try_fold(0u64, |total, layer| {
        u64::try_from(layer.size)
            .map(|size| total + size)
            .map_err(|_| registry_error(format!("Invalid size {} for layer {}", layer.size, layer.digest)))
    })
}

/// Check `data` against a `sha256:` digest. Other algorithms are not verified.
pub fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    if let Some(expected) = digest.strip_prefix("sha256:") {
        let actual = hex::encode(Sha256::digest(data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(registry_error(format!(
                "Digest mismatch for blob {}: got sha256:{}",
                digest, actual
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(digests: &[&str]) -> OciImageManifest {
        let layers: Vec<_> = digests
            .iter()
            .map(|d| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": d,
                    "size": 1
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:00",
                "size": 2
            },
            "layers": layers
        }))
        .unwrap()
    }

    #[test]
    fn test_layer_digests_in_order() {
        let m = manifest(&["sha256:aa", "sha256:bb"]);
        assert_eq!(layer_digests(&m).unwrap(), vec!["sha256:aa", "sha256:bb"]);
    }

    #[test]
    fn test_empty_digest_is_external_error() {
        let m = manifest(&["sha256:aa", ""]);
        let err = layer_digests(&m).unwrap_err();
        assert!(matches!(err, MirrorError::ExternalServiceError { .. }));
        assert!(err.to_string().contains("layer 1"));
    }

    #[test]
    fn test_layers_size_sums_descriptors() {
        let m = manifest(&["sha256:aa", "sha256:bb", "sha256:cc"]);
        assert_eq!(layers_size(&m).unwrap(), 3);

        let mut negative = manifest(&["sha256:aa"]);
        negative.layers[0].size = -1;
        assert!(layers_size(&negative).is_err());
    }

    #[test]
    fn test_verify_digest() {
        let data = b"layer";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        assert!(verify_digest(&digest, data).is_ok());
        assert!(verify_digest(&digest, b"other").is_err());
        assert!(verify_digest("sha512:whatever", data).is_ok());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = RegistryClient::with_http(reqwest::Client::new(), "http://reg.local/", 0);
        assert_eq!(client.base_url, "http://reg.local");
        assert_eq!(client.concurrency, 1);
    }

    #[test]
    fn test_oci_reference_uses_registry_host() {
        let client = RegistryClient::with_http(reqwest::Client::new(), "http://127.0.0.1:5000", 1);
        let reference = client.oci_reference("m1/img", "tag1").unwrap();
        assert_eq!(reference.registry(), "127.0.0.1:5000");
        assert_eq!(reference.repository(), "m1/img");
        assert_eq!(reference.tag(), Some("tag1"));

        let secure = RegistryClient::with_http(reqwest::Client::new(), "https://reg.example.com/", 1);
        let reference = secure.oci_reference("org/model", "v2").unwrap();
        assert_eq!(reference.registry(), "reg.example.com");
    }
}
