//! Distribution package names.
//!
//! Images live in a model-scoped repository (`{modelId}/{image}`) and are
//! addressed across instances by their `name:tag` distribution package name.

use mirror_core::error::{MirrorError, Result};
use mirror_core::model::ImageRef;

/// Default tag when none is given.
const DEFAULT_TAG: &str = "latest";

/// Parsed `name:tag` reference to an image inside a model's repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPackage {
    /// Image name (e.g., "inference", "tools/cli")
    pub name: String,
    /// Tag (e.g., "v1", "latest")
    pub tag: String,
}

impl DistributionPackage {
    /// Parse a distribution package name.
    ///
    /// Supports formats:
    /// - `inference` → inference:latest
    /// - `inference:v1` → inference:v1
    /// - `tools/cli:1.2.0` → tools/cli:1.2.0
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MirrorError::InvalidRequest(
                "Empty distribution package name".to_string(),
            ));
        }
        if reference.contains('@') {
            return Err(MirrorError::InvalidRequest(format!(
                "Digest references are not supported in distribution package name '{}'",
                reference
            )));
        }

        // The tag follows the last colon after the last slash
        let name_start = reference.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (name, tag) = match reference[name_start..].rfind(':') {
            Some(colon) => {
                let colon = name_start + colon;
                (&reference[..colon], &reference[colon + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if !is_valid_name(name) {
            return Err(MirrorError::InvalidRequest(format!(
                "Invalid image name in distribution package name '{}'",
                reference
            )));
        }
        if !is_valid_tag(tag) {
            return Err(MirrorError::InvalidRequest(format!(
                "Invalid tag in distribution package name '{}'",
                reference
            )));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Image reference under `model_id`'s repository.
    pub fn image_ref(&self, model_id: &str) -> ImageRef {
        ImageRef {
            repository: model_id.to_string(),
            name: self.name.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl std::fmt::Display for DistributionPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Registry repository path of an image (`{repository}/{name}`).
pub fn repository_path(image: &ImageRef) -> String {
    format!("{}/{}", image.repository, image.name)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
                && component
                    .chars()
                    .next()
                    .map_or(false, |c| c.is_ascii_alphanumeric())
        })
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        && !tag.starts_with(['.', '-'])
}
