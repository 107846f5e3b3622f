use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EyecapError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Frame decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Device stream (network) failures
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("Invalid device address '{address}': {details}")]
    InvalidAddress { address: String, details: String },

    #[error("No device address configured")]
    NotConfigured,

    #[error("All connection candidates failed: {}", attempted.join(", "))]
    ConnectFailed { attempted: Vec<String> },

    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectTimeout { url: String, timeout_secs: u64 },

    #[error("No async runtime available to drive the connection")]
    NoRuntime,
}

/// Per-frame decode failures. Never fatal: the frame is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame payload too small ({len} bytes, minimum {min})")]
    TooSmall { len: usize, min: usize },

    #[error("Invalid image data: {details}")]
    Invalid { details: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to create session directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid user information: {details}")]
    InvalidUser { details: String },

    #[error("Failed to encode image: {details}")]
    Encode { details: String },

    #[error("Failed to write image {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Stage plan is empty")]
    EmptyPlan,

    #[error("Stage '{name}' is invalid: {details}")]
    InvalidStage { name: String, details: String },
}

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Failed to read session directory {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive {path}: {details}")]
    Archive { path: PathBuf, details: String },

    #[error("Failed to build manifest: {details}")]
    Manifest { details: String },

    #[error("Packaging task failed: {details}")]
    Task { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

impl EyecapError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the owner may retry the failed operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            EyecapError::Stream(StreamError::InvalidAddress { .. })
            | EyecapError::Stream(StreamError::NotConfigured)
            | EyecapError::Stream(StreamError::NoRuntime) => false,
            EyecapError::Stream(_) | EyecapError::Decode(_) => true,
            EyecapError::Session(SessionError::DirectoryCreation { .. }) => false,
            EyecapError::Session(_) => true,
            EyecapError::Packaging(_) => true,
            EyecapError::Config(_) | EyecapError::Stage(_) => false,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EyecapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_lists_candidates() {
        let err = StreamError::ConnectFailed {
            attempted: vec!["ws://10.0.0.2".to_string(), "ws://10.0.0.2/ws".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "All connection candidates failed: ws://10.0.0.2, ws://10.0.0.2/ws"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(EyecapError::from(StreamError::ConnectFailed { attempted: vec![] }).is_recoverable());
        assert!(!EyecapError::from(StreamError::NotConfigured).is_recoverable());
        assert!(!EyecapError::from(SessionError::DirectoryCreation {
            path: PathBuf::from("/nope"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        })
        .is_recoverable());
    }
}
