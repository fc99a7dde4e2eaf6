//! Error taxonomy for the conversation engine
//!
//! Every failure the core can surface maps to exactly one user-facing message.
//! Capture and session errors are recovered locally; none of them are fatal to
//! the process.

use crate::transport::TransportError;

/// Where an offline condition was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Process start with no network
    Startup,
    /// Connectivity dropped while running
    Lost,
    /// Opening a session
    Open,
    /// Starting microphone capture
    Capture,
}

/// Errors surfaced by the conversation engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("offline ({0:?})")]
    Connectivity(Boundary),

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no microphone found")]
    DeviceNotFound,

    #[error("capture error: {0}")]
    Capture(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session closed unexpectedly (code {code}): {reason}")]
    UncleanClose { code: u16, reason: String },
}

impl Error {
    /// Text shown to the user in place of the status line.
    pub fn user_message(&self) -> String {
        match self {
            Error::Connectivity(Boundary::Startup) => {
                "You are offline. Please check your internet connection.".to_string()
            }
            Error::Connectivity(Boundary::Lost) => {
                "Connection lost. Please check your internet connection.".to_string()
            }
            Error::Connectivity(Boundary::Open) => {
                "Cannot initialize session. You are offline.".to_string()
            }
            Error::Connectivity(Boundary::Capture) => {
                "Cannot start recording. You are offline.".to_string()
            }
            Error::PermissionDenied => {
                "Microphone access denied. Please allow microphone access to continue."
                    .to_string()
            }
            Error::DeviceNotFound => {
                "No microphone found. Please connect a microphone and try again.".to_string()
            }
            Error::Capture(detail) => format!("Could not start recording: {}", detail),
            Error::Transport(TransportError::Connect(detail)) => {
                format!("Session error: {}", detail)
            }
            Error::Transport(_) => {
                "A real-time connection error occurred. Please check your internet and try again."
                    .to_string()
            }
            Error::UncleanClose { .. } => {
                "The connection was closed unexpectedly. Reset to start a new session."
                    .to_string()
            }
        }
    }

    /// Session-fatal errors move the session to `Failed` and force capture to stop.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::UncleanClose { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
