//! Error types for the SDK core

use std::fmt;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors reported by the storage contract.
pub type StorageError = CoreError;

#[derive(Debug)]
pub enum CoreError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Event data exceeds the maximum object size
    ObjectTooLarge { size: u64, max: u64 },

    /// No feature registered under this name
    FeatureNotRegistered(String),

    /// A feature with this name is already registered
    FeatureAlreadyRegistered(String),

    /// Feature names must be a single plain directory name
    InvalidFeatureName(String),

    /// The feature could not turn a batch into a request
    RequestBuilder(String),

    /// Upload did not complete within the configured timeout
    Timeout,

    /// Transport error
    Transport(String),

    /// The core lane has stopped and no longer accepts work
    LaneClosed,

    /// Generic error with message
    Other(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(err) => write!(f, "IO error: {}", err),
            CoreError::Http(err) => write!(f, "HTTP error: {}", err),
            CoreError::Json(err) => write!(f, "JSON error: {}", err),
            CoreError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CoreError::ObjectTooLarge { size, max } => {
                write!(f, "Data of {} bytes exceeds the maximum size of {} bytes", size, max)
            }
            CoreError::FeatureNotRegistered(name) => write!(f, "Feature '{}' is not registered", name),
            CoreError::FeatureAlreadyRegistered(name) => {
                write!(f, "Feature '{}' is already registered", name)
            }
            CoreError::InvalidFeatureName(name) => write!(f, "Invalid feature name '{}'", name),
            CoreError::RequestBuilder(msg) => write!(f, "Request builder error: {}", msg),
            CoreError::Timeout => write!(f, "Upload timed out"),
            CoreError::Transport(msg) => write!(f, "Transport error: {}", msg),
            CoreError::LaneClosed => write!(f, "Core lane is closed"),
            CoreError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(err) => Some(err),
            CoreError::Http(err) => Some(err),
            CoreError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err)
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Http(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Json(err)
    }
}
