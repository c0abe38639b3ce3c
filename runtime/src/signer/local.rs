//! In-process P-256 signing key.
//!
//! Behaves like a single-key KMS; useful for development instances and tests.

use std::path::Path;

use async_trait::async_trait;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature as P256Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;

use super::{KeyDescription, KeyManagementService, ECDSA_SHA_256};

/// A single P-256 key addressed by `key_id`.
pub struct LocalKms {
    key_id: String,
    key: SigningKey,
}

impl LocalKms {
    /// Key from a 32-byte big-endian secret scalar.
    pub fn from_bytes(key_id: impl Into<String>, secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| MirrorError::ConfigError(format!("Invalid P-256 signing key: {}", e)))?;
        Ok(Self {
            key_id: key_id.into(),
            key,
        })
    }

    /// Key from a file holding the hex-encoded secret scalar.
    pub fn from_file(key_id: impl Into<String>, path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::ConfigError(format!("Failed to read signing key {}: {}", path.display(), e))
        })?;
        let secret = hex::decode(contents.trim()).map_err(|e| {
            MirrorError::ConfigError(format!("Signing key {} is not hex: {}", path.display(), e))
        })?;
        Self::from_bytes(key_id, &secret)
    }

    fn check_key(&self, key_id: &str) -> Result<()> {
        if key_id == self.key_id {
            Ok(())
        } else {
            Err(MirrorError::NotFound(format!("Signing key {}", key_id)))
        }
    }
}

#[async_trait]
impl KeyManagementService for LocalKms {
    async fn describe_key(&self, _ctx: &OperationContext, key_id: &str) -> Result<Option<KeyDescription>> {
        self.check_key(key_id)?;
        Ok(Some(KeyDescription {
            signing_algorithms: Some(vec![ECDSA_SHA_256.to_string()]),
        }))
    }

    async fn sign(
        &self,
        _ctx: &OperationContext,
        key_id: &str,
        digest: &[u8],
        algorithm: &str,
    ) -> Result<Option<Vec<u8>>> {
        self.check_key(key_id)?;
        if algorithm != ECDSA_SHA_256 {
            return Err(MirrorError::external(
                "signer",
                format!("Unsupported signing algorithm {}", algorithm),
            ));
        }
        let signature: P256Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| MirrorError::external("signer", format!("Sign failed: {}", e)))?;
        Ok(Some(signature.to_der().as_bytes().to_vec()))
    }

    async fn public_key(&self, _ctx: &OperationContext, key_id: &str) -> Result<Vec<u8>> {
        self.check_key(key_id)?;
        let der = self
            .key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| MirrorError::IntegrityError(format!("Failed to encode public key: {}", e)))?;
        Ok(der.as_bytes().to_vec())
    }
}
