use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("variant list encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unsupported store scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },
    #[error("store configuration error: {message}")]
    Configuration { message: String },
}

impl StorageError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported_scheme(scheme: impl Into<String>) -> Self {
        Self::UnsupportedScheme {
            scheme: scheme.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}
