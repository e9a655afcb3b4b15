//! Error types for the telemetry pipeline

use std::fmt;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug)]
pub enum PipelineError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed before a response arrived
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Collector response could not be parsed
    Xml(String),

    /// Configuration error
    Config(String),

    /// Submission attempted without a credentials supplier
    MissingCredentialsProvider,

    /// Event rejected by strict-mode checks
    InvalidEvent(String),

    /// Durable store failure
    Store(String),

    /// Clock used before synchronization, or synchronization failed
    Clock(String),

    /// Persistence task is gone
    ChannelClosed,

    /// Transport error
    Transport(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io(err) => write!(f, "IO error: {}", err),
            PipelineError::Http(err) => write!(f, "HTTP error: {}", err),
            PipelineError::Json(err) => write!(f, "JSON error: {}", err),
            PipelineError::Xml(msg) => write!(f, "Response parsing error: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::MissingCredentialsProvider => {
                write!(f, "Configuration error: no credentials provider set")
            }
            PipelineError::InvalidEvent(msg) => write!(f, "Invalid event: {}", msg),
            PipelineError::Store(msg) => write!(f, "Store error: {}", msg),
            PipelineError::Clock(msg) => write!(f, "Clock error: {}", msg),
            PipelineError::ChannelClosed => write!(f, "Persistence channel closed"),
            PipelineError::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::Http(err) => Some(err),
            PipelineError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Http(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Json(err)
    }
}

impl From<quick_xml::Error> for PipelineError {
    fn from(err: quick_xml::Error) -> Self {
        PipelineError::Xml(err.to_string())
    }
}
