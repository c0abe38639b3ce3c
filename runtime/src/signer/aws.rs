//! AWS KMS signing backend.

use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{MessageType, SigningAlgorithmSpec};
use aws_sdk_kms::Client;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};

use super::{KeyDescription, KeyManagementService};

fn kms_error(action: &str, key_id: &str, err: impl std::fmt::Display) -> MirrorError {
    MirrorError::external("kms", format!("{} for key {} failed: {}", action, key_id, err))
}

/// Asymmetric keys held in AWS KMS.
pub struct AwsKms {
    client: Client,
}

impl AwsKms {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the AWS default credential chain.
    pub async fn from_region(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

#[async_trait]
impl KeyManagementService for AwsKms {
    async fn describe_key(&self, ctx: &OperationContext, key_id: &str) -> Result<Option<KeyDescription>> {
        let output = ctx
            .run("kms describe key", async {
                self.client
                    .describe_key()
                    .key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| kms_error("DescribeKey", key_id, e))
            })
            .await?;

        Ok(output.key_metadata.map(|metadata| KeyDescription {
            signing_algorithms: metadata.signing_algorithms.map(|algorithms| {
                algorithms
                    .iter()
                    .map(|algorithm| algorithm.as_str().to_string())
                    .collect()
            }),
        }))
    }

    async fn sign(
        &self,
        ctx: &OperationContext,
        key_id: &str,
        digest: &[u8],
        algorithm: &str,
    ) -> Result<Option<Vec<u8>>> {
        let output = ctx
            .run("kms sign", async {
                self.client
                    .sign()
                    .key_id(key_id)
                    .message(Blob::new(digest))
                    .message_type(MessageType::Digest)
                    .signing_algorithm(SigningAlgorithmSpec::from(algorithm))
                    .send()
                    .await
                    .map_err(|e| kms_error("Sign", key_id, e))
            })
            .await?;

        Ok(output.signature.map(Blob::into_inner))
    }

    async fn public_key(&self, ctx: &OperationContext, key_id: &str) -> Result<Vec<u8>> {
        let output = ctx
            .run("kms get public key", async {
                self.client
                    .get_public_key()
                    .key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| kms_error("GetPublicKey", key_id, e))
            })
            .await?;

        output
            .public_key
            .map(Blob::into_inner)
            .ok_or_else(|| MirrorError::IntegrityError(format!("No public key returned for key {}", key_id)))
    }
}
