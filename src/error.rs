// src/error.rs
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by process and supervised sessions
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to launch tool: {0}")]
    Launch(io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Failed to read from tool: {0}")]
    Read(io::Error),

    #[error("{0}")]
    Tool(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Session stopped")]
    Stopped,

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Config error: {0}")]
    Config(String),
}

impl SessionError {
    /// The tool answered, but reported a failure for this particular input
    pub fn is_tool_error(&self) -> bool {
        matches!(self, SessionError::Tool(_))
    }

    /// The pipes or the process itself misbehaved; the session may be unusable
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_)
                | SessionError::Read(_)
                | SessionError::Framing(_)
                | SessionError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_displays_bare_message() {
        let err = SessionError::Tool("file not found".to_string());
        assert_eq!(err.to_string(), "file not found");
        assert!(err.is_tool_error());
        assert!(!err.is_transport_error());
    }

    #[test]
    fn test_transport_classification() {
        let err = SessionError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_transport_error());
        assert!(!SessionError::Stopped.is_transport_error());
        assert!(SessionError::Timeout(Duration::from_millis(5)).is_transport_error());
    }
}
