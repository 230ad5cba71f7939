//! Error handling module for the bulletin backend.
//!
//! Provides the engine-facing error type with stable error codes, and the
//! narrower error type returned by exporter and importer plugins.

/// Error codes as constants to avoid stringly-typed errors.
#[allow(dead_code)]
pub mod codes {
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const TOPIC_NOT_FOUND: &str = "TOPIC_NOT_FOUND";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const SYSTEM_NOT_READY: &str = "SYSTEM_NOT_READY";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const CODEC_ERROR: &str = "CODEC_ERROR";
    pub const PLUGIN_ERROR: &str = "PLUGIN_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    /// Principal lacks the required mode on the named topic
    AccessDenied { topic: String },
    /// A topic path does not resolve in the namespace tree
    TopicNotFound(String),
    /// Message, user or other record not found
    NotFound(String),
    /// System mode refuses the operation
    SystemNotReady(String),
    /// Authentication failed
    Unauthorized(String),
    /// Validation error
    Validation(String),
    /// Filesystem error
    Storage(String),
    /// Record could not be encoded or decoded
    Codec(String),
    /// Exporter or importer plugin error
    Plugin(String),
    /// Internal error
    Internal(String),
}

impl AppError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::AccessDenied { .. } => codes::ACCESS_DENIED,
            AppError::TopicNotFound(_) => codes::TOPIC_NOT_FOUND,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::SystemNotReady(_) => codes::SYSTEM_NOT_READY,
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Storage(_) => codes::STORAGE_ERROR,
            AppError::Codec(_) => codes::CODEC_ERROR,
            AppError::Plugin(_) => codes::PLUGIN_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::AccessDenied { topic } => format!("access denied to topic '{}'", topic),
            AppError::TopicNotFound(path) => format!("topic '{}' does not exist", path),
            AppError::NotFound(msg) => msg.clone(),
            AppError::SystemNotReady(msg) => msg.clone(),
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Storage(msg) => msg.clone(),
            AppError::Codec(msg) => msg.clone(),
            AppError::Plugin(msg) => msg.clone(),
            AppError::Internal(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!("Storage error: {:?}", err);
        AppError::Storage(format!("Storage error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::Codec(format!("JSON error: {}", err))
    }
}

impl From<PluginError> for AppError {
    fn from(err: PluginError) -> Self {
        AppError::Plugin(err.to_string())
    }
}

/// Error returned by exporter and importer implementations.
#[derive(Debug)]
pub enum PluginError {
    /// Settings rejected at construction time
    Config(String),
    /// Remote side or local resource unavailable; worth retrying
    Unavailable(String),
    /// Input could not be turned into a message
    Malformed(String),
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::Config(msg) => write!(f, "invalid plugin settings: {}", msg),
            PluginError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            PluginError::Malformed(msg) => write!(f, "malformed input: {}", msg),
        }
    }
}

impl std::error::Error for PluginError {}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::Malformed(err.to_string())
    }
}

/// Result alias used across the engine.
pub type AppResult<T> = Result<T, AppError>;
