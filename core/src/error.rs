use thiserror::Error;

/// relaybox error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Image build failed (unreadable input, missing COPY source, I/O in staging)
    #[error("Build error: {0}")]
    BuildError(String),

    /// Build recipe violates the image contract
    #[error("Recipe error: {0}")]
    RecipeError(String),

    /// Dependency manifest could not be parsed
    #[error("Manifest error: line {line}: {message}")]
    ManifestError { line: usize, message: String },

    /// A RUN step exited with a non-zero status
    #[error("Step '{step}' failed (exit {exit_code}): {stderr}")]
    StepFailed {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    /// Build layer cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// OCI image or image store error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container launch error
    #[error("Container error: {0}")]
    ContainerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

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

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

/// Result type alias for relaybox operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display() {
        let error = RelayError::BuildError("COPY source not found: main.py".to_string());
        assert_eq!(
            error.to_string(),
            "Build error: COPY source not found: main.py"
        );
    }

    #[test]
    fn test_manifest_error_display() {
        let error = RelayError::ManifestError {
            line: 3,
            message: "invalid requirement 'flask=='".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Manifest error: line 3: invalid requirement 'flask=='"
        );
    }

    #[test]
    fn test_step_failed_display() {
        let error = RelayError::StepFailed {
            step: "RUN pip install -r requirements.txt".to_string(),
            exit_code: 1,
            stderr: "No matching distribution found for nosuchpkg".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Step 'RUN pip install -r requirements.txt' failed (exit 1): No matching distribution found for nosuchpkg"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_error.into();
        assert!(matches!(err, RelayError::IoError(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = json_err.into();
        assert!(matches!(err, RelayError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<String>>("key: value").unwrap_err();
        let err: RelayError = yaml_err.into();
        assert!(matches!(err, RelayError::SerializationError(_)));
    }

    #[test]
    fn test_recipe_error_display() {
        let error = RelayError::RecipeError("base image must be pinned".to_string());
        assert_eq!(error.to_string(), "Recipe error: base image must be pinned");
    }
}
