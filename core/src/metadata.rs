//! Export metadata, import requests and detached signatures.

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Current export archive schema version.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Payload shape carried by an export archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportKind {
    ModelCard,
    Release,
    File,
    Image,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::ModelCard => "modelCard",
            ImportKind::Release => "release",
            ImportKind::File => "file",
            ImportKind::Image => "image",
        }
    }

    /// Documents bundles carry model cards, releases and file metadata.
    pub fn is_documents(&self) -> bool {
        matches!(self, ImportKind::ModelCard | ImportKind::Release)
    }
}

impl std::fmt::Display for ImportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "modelCard" | "model-card" => Ok(Self::ModelCard),
            "release" => Ok(Self::Release),
            "file" => Ok(Self::File),
            "image" => Ok(Self::Image),
            _ => Err(format!(
                "unknown import kind: '{}' (supported: modelCard, release, file, image)",
                s
            )),
        }
    }
}

/// Header describing the intent of an export archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub schema_version: u32,
    pub exporter: String,
    pub source_model_id: String,
    pub mirrored_model_id: String,
    pub import_kind: ImportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_package_name: Option<String>,
}

impl ExportMetadata {
    pub fn new(
        exporter: impl Into<String>,
        source_model_id: impl Into<String>,
        mirrored_model_id: impl Into<String>,
        import_kind: ImportKind,
    ) -> Self {
        Self {
            schema_version: EXPORT_SCHEMA_VERSION,
            exporter: exporter.into(),
            source_model_id: source_model_id.into(),
            mirrored_model_id: mirrored_model_id.into(),
            import_kind,
            file_path: None,
            distribution_package_name: None,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_distribution_package_name(mut self, name: impl Into<String>) -> Self {
        self.distribution_package_name = Some(name.into());
        self
    }

    /// Check that an archive header agrees with the request that delivered it.
    pub fn check_against(&self, request: &ImportRequest) -> Result<()> {
        if self.schema_version != EXPORT_SCHEMA_VERSION {
            return Err(MirrorError::InvalidRequest(format!(
                "Unsupported export schema version {} (expected {})",
                self.schema_version, EXPORT_SCHEMA_VERSION
            )));
        }

        let mismatch = |field: &str, header: &str, request: &str| {
            MirrorError::ValidationError {
                message: format!(
                    "Export metadata {} '{}' does not match request '{}'",
                    field, header, request
                ),
                entity: "metadata.json".to_string(),
                mirrored_model_id: self.mirrored_model_id.clone(),
                source_model_id: self.source_model_id.clone(),
            }
        };

        if self.source_model_id != request.source_model_id {
            return Err(mismatch(
                "sourceModelId",
                &self.source_model_id,
                &request.source_model_id,
            ));
        }
        if self.mirrored_model_id != request.mirrored_model_id {
            return Err(mismatch(
                "mirroredModelId",
                &self.mirrored_model_id,
                &request.mirrored_model_id,
            ));
        }
        if self.import_kind != request.import_kind
            && !(self.import_kind.is_documents() && request.import_kind.is_documents())
        {
            return Err(mismatch(
                "importKind",
                self.import_kind.as_str(),
                request.import_kind.as_str(),
            ));
        }
        if request.file_path.is_some() && self.file_path != request.file_path {
            return Err(mismatch(
                "filePath",
                self.file_path.as_deref().unwrap_or(""),
                request.file_path.as_deref().unwrap_or(""),
            ));
        }
        if request.distribution_package_name.is_some()
            && self.distribution_package_name != request.distribution_package_name
        {
            return Err(mismatch(
                "distributionPackageName",
                self.distribution_package_name.as_deref().unwrap_or(""),
                request.distribution_package_name.as_deref().unwrap_or(""),
            ));
        }
        Ok(())
    }
}

/// Body of `POST /api/v2/model/import/s3` sent to the receiving instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub payload_url: String,
    pub mirrored_model_id: String,
    pub source_model_id: String,
    pub exporter: String,
    pub import_kind: ImportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_package_name: Option<String>,
}

impl ImportRequest {
    pub fn from_metadata(metadata: &ExportMetadata, payload_url: impl Into<String>) -> Self {
        Self {
            payload_url: payload_url.into(),
            mirrored_model_id: metadata.mirrored_model_id.clone(),
            source_model_id: metadata.source_model_id.clone(),
            exporter: metadata.exporter.clone(),
            import_kind: metadata.import_kind,
            file_path: metadata.file_path.clone(),
            distribution_package_name: metadata.distribution_package_name.clone(),
        }
    }

    /// Shape checks that must pass before any network I/O.
    pub fn validate(&self) -> Result<()> {
        if self.payload_url.trim().is_empty() {
            return Err(MirrorError::InvalidRequest(
                "payloadUrl is required".to_string(),
            ));
        }
        if self.mirrored_model_id.trim().is_empty() || self.source_model_id.trim().is_empty() {
            return Err(MirrorError::InvalidRequest(
                "mirroredModelId and sourceModelId are required".to_string(),
            ));
        }
        match self.import_kind {
            ImportKind::Image if self.distribution_package_name.is_none() => {
                Err(MirrorError::InvalidRequest(
                    "Missing distributionPackageName for image import".to_string(),
                ))
            }
            ImportKind::File if self.file_path.is_none() => Err(MirrorError::InvalidRequest(
                "Missing filePath for file import".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Detached ECDSA signature over an archive digest.
///
/// `r` and `s` are unsigned big-endian integers without leading zero bytes,
/// serialized as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "sigR", with = "hex_bytes")]
    pub r: Vec<u8>,
    #[serde(rename = "sigS", with = "hex_bytes")]
    pub s: Vec<u8>,
}

impl Signature {
    pub fn from_components(r: &[u8], s: &[u8]) -> Self {
        Self {
            r: strip_leading_zeros(r).to_vec(),
            s: strip_leading_zeros(s).to_vec(),
        }
    }

    /// `r || s`, each left-padded to `width` bytes.
    pub fn to_fixed_bytes(&self, width: usize) -> Result<Vec<u8>> {
        if self.r.len() > width || self.s.len() > width {
            return Err(MirrorError::IntegrityError(format!(
                "Signature component exceeds {} bytes",
                width
            )));
        }
        let mut out = vec![0u8; width * 2];
        out[width - self.r.len()..width].copy_from_slice(&self.r);
        out[width * 2 - self.s.len()..].copy_from_slice(&self.s);
        Ok(out)
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
