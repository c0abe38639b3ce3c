//! Detached signatures over export digests.
//!
//! The signer never sees archive bytes: it submits the SHA-256 digest with
//! `MessageType=DIGEST` and decodes the DER ECDSA signature the key service
//! returns into its `(r, s)` components.

mod aws;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use der::asn1::UintRef;
use der::{Decode, Sequence};
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use mirror_core::metadata::Signature;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};

pub use aws::AwsKms;
pub use local::LocalKms;

/// ECDSA over P-256 with SHA-256, as named by KMS-style services.
pub const ECDSA_SHA_256: &str = "ECDSA_SHA_256";

/// Size of a P-256 scalar in bytes.
const P256_FIELD_BYTES: usize = 32;

/// Subset of key metadata the signer relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDescription {
    /// Algorithms the key currently supports, as advertised by the service
    pub signing_algorithms: Option<Vec<String>>,
}

/// KMS-style asymmetric signing service.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// `DescribeKey`. `None` when the service returned no key metadata.
    async fn describe_key(&self, ctx: &OperationContext, key_id: &str) -> Result<Option<KeyDescription>>;

    /// `Sign` with `MessageType=DIGEST`. Returns the DER-encoded signature, if any.
    async fn sign(
        &self,
        ctx: &OperationContext,
        key_id: &str,
        digest: &[u8],
        algorithm: &str,
    ) -> Result<Option<Vec<u8>>>;

    /// `GetPublicKey`. DER-encoded SubjectPublicKeyInfo.
    async fn public_key(&self, ctx: &OperationContext, key_id: &str) -> Result<Vec<u8>>;
}

/// Signature document stored beside an artifact as `{key}.sig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedSignature {
    pub key_id: String,
    /// Hex SHA-256 of the artifact bytes
    pub sha256: String,
    #[serde(flatten)]
    pub signature: Signature,
}

/// `ECDSA-Sig-Value ::= SEQUENCE { r INTEGER, s INTEGER }`
#[derive(Sequence)]
struct EcdsaSigValue<'a> {
    r: UintRef<'a>,
    s: UintRef<'a>,
}

/// Signs export digests with a key held by a [`KeyManagementService`].
#[derive(Clone)]
pub struct IntegritySigner {
    kms: Arc<dyn KeyManagementService>,
    key_id: String,
}

impl IntegritySigner {
    pub fn new(kms: Arc<dyn KeyManagementService>, key_id: impl Into<String>) -> Self {
        Self {
            kms,
            key_id: key_id.into(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign a hex-encoded digest.
    ///
    /// The algorithm is looked up from the key on every call.
    pub async fn sign(&self, ctx: &OperationContext, hash_hex: &str) -> Result<Signature> {
        let digest = hex::decode(hash_hex)
            .map_err(|e| MirrorError::InvalidRequest(format!("Digest is not valid hex: {}", e)))?;

        let algorithm = self
            .kms
            .describe_key(ctx, &self.key_id)
            .await?
            .and_then(|description| description.signing_algorithms)
            .and_then(|algorithms| algorithms.into_iter().next())
            .ok_or_else(|| MirrorError::IntegrityError("Cannot get key information".to_string()))?;

        let der = self
            .kms
            .sign(ctx, &self.key_id, &digest, &algorithm)
            .await?
            .ok_or_else(|| {
                MirrorError::IntegrityError(format!("No signature returned for key {}", self.key_id))
            })?;

        let signature = decode_der_signature(&der)?;
        tracing::debug!(key_id = %self.key_id, algorithm = %algorithm, digest = %hash_hex, "Signed digest");
        Ok(signature)
    }

    /// Check `signature` over a hex-encoded digest against this key.
    pub async fn verify(&self, ctx: &OperationContext, hash_hex: &str, signature: &Signature) -> Result<bool> {
        let public_key = self.kms.public_key(ctx, &self.key_id).await?;
        verify_signature(hash_hex, signature, &public_key)
    }
}

/// Decode a DER `ECDSA-Sig-Value` into its big-endian components.
pub fn decode_der_signature(der: &[u8]) -> Result<Signature> {
    let value = EcdsaSigValue::from_der(der)
        .map_err(|e| MirrorError::IntegrityError(format!("Malformed DER signature: {}", e)))?;
    Ok(Signature::from_components(value.r.as_bytes(), value.s.as_bytes()))
}

/// Verify a P-256 signature over a hex digest with a DER SubjectPublicKeyInfo.
pub fn verify_signature(hash_hex: &str, signature: &Signature, public_key_der: &[u8]) -> Result<bool> {
    let digest = hex::decode(hash_hex)
        .map_err(|e| MirrorError::InvalidRequest(format!("Digest is not valid hex: {}", e)))?;
    let key = p256::ecdsa::VerifyingKey::from_public_key_der(public_key_der)
        .map_err(|e| MirrorError::IntegrityError(format!("Unsupported public key: {}", e)))?;
    let bytes = signature.to_fixed_bytes(P256_FIELD_BYTES)?;
    let signature = p256::ecdsa::Signature::from_slice(&bytes)
        .map_err(|e| MirrorError::IntegrityError(format!("Invalid signature: {}", e)))?;

    Ok(key.verify_prehash(&digest, &signature).is_ok())
}
