use thiserror::Error;

/// How an error should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Misconfiguration or broken integrity. Do not retry.
    Fatal,
    /// Transient failure. The whole operation can be retried.
    Retryable,
    /// Bad input. Retrying without correcting the data will not help.
    Permanent,
}

/// Model mirror error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Missing or invalid configuration (signing key, registry, storage)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Registry, object storage, signer or remote instance failure
    #[error("External service error: {service} - {message}")]
    ExternalServiceError { service: String, message: String },

    /// Imported entity failed validation
    #[error(
        "Validation error: {message} (entity: {entity}, mirroredModelId: {mirrored_model_id}, sourceModelId: {source_model_id})"
    )]
    ValidationError {
        message: String,
        entity: String,
        mirrored_model_id: String,
        source_model_id: String,
    },

    /// Signing key metadata or signature missing
    #[error("Internal error: {0}")]
    IntegrityError(String),

    /// Request rejected before any work was done
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Operation cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Shorthand for an [`MirrorError::ExternalServiceError`].
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        MirrorError::ExternalServiceError {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Classify the error for retry decisions.
    pub fn severity(&self) -> Severity {
        match self {
            MirrorError::ConfigError(_) | MirrorError::IntegrityError(_) => Severity::Fatal,
            MirrorError::ExternalServiceError { .. }
            | MirrorError::TimeoutError(_)
            | MirrorError::Cancelled(_)
            | MirrorError::IoError(_) => Severity::Retryable,
            MirrorError::ValidationError { .. }
            | MirrorError::InvalidRequest(_)
            | MirrorError::NotFound(_)
            | MirrorError::SerializationError(_)
            | MirrorError::Other(_) => Severity::Permanent,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.severity() == Severity::Retryable
    }

    /// Whether the error was caused by the caller's input (maps to a 4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MirrorError::InvalidRequest(_)
                | MirrorError::NotFound(_)
                | MirrorError::ValidationError { .. }
        )
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

/// Result type alias for model mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = MirrorError::ConfigError("Missing signing key".to_string());
        assert_eq!(error.to_string(), "Configuration error: Missing signing key");
        assert_eq!(error.severity(), Severity::Fatal);
    }

    #[test]
    fn test_external_service_error_display() {
        let error = MirrorError::external("registry", "HTTP 502");
        assert_eq!(error.to_string(), "External service error: registry - HTTP 502");
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error_carries_context() {
        let error = MirrorError::ValidationError {
            message: "modelId does not match sourceModelId".to_string(),
            entity: "release 1.0.0".to_string(),
            mirrored_model_id: "m2".to_string(),
            source_model_id: "m1".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("release 1.0.0"));
        assert!(text.contains("mirroredModelId: m2"));
        assert!(text.contains("sourceModelId: m1"));
        assert_eq!(error.severity(), Severity::Permanent);
        assert!(error.is_client_error());
    }

    #[test]
    fn test_integrity_error_display() {
        let error = MirrorError::IntegrityError("Cannot get key information".to_string());
        assert_eq!(error.to_string(), "Internal error: Cannot get key information");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let error = MirrorError::TimeoutError("export exceeded 30s".to_string());
        assert_eq!(error.to_string(), "Timeout: export exceeded 30s");
        assert!(error.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: MirrorError = io_error.into();
        assert!(matches!(error, MirrorError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: MirrorError = result.unwrap_err().into();
        assert!(matches!(error, MirrorError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: MirrorError = result.unwrap_err().into();
        assert!(matches!(error, MirrorError::SerializationError(_)));
    }

    #[test]
    fn test_invalid_request_is_client_error() {
        let error = MirrorError::InvalidRequest("disclaimer not accepted".to_string());
        assert!(error.is_client_error());
        assert!(!MirrorError::external("s3", "down").is_client_error());
    }
}
