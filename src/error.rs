//! # Error Handling
//!
//! Defines the error taxonomy for the voice-agent client and how other
//! error types convert into it.
//!
//! ## Error Categories:
//! - **Transport**: socket connect/read/write failures; the session drops to
//!   disconnected and nothing is retried automatically
//! - **Decode**: a binary audio chunk that cannot be parsed as 16-bit PCM;
//!   the chunk is dropped and the session continues
//! - **Parse**: a control frame that is not valid JSON (or a settings payload
//!   that cannot be serialized); the frame is dropped and the session continues
//! - **Device**: microphone or speaker unavailable, permission denied, or an
//!   unsupported stream format; recording/playback does not start
//! - **Config**: configuration file or environment variable problems
//! - **InvalidState**: an operation called in a lifecycle state that does not
//!   permit it (connect while connected, play after destroy)

use std::fmt;

/// Error type covering every failure the client reports to its caller.
///
/// Recovery is always left to the caller: there is no retry or backoff
/// anywhere in this crate. A caller that wants to reconnect simply calls
/// `connect` (or `start_recording`) again.
#[derive(Debug)]
pub enum AgentError {
    /// Socket-level failure (connect, read, write, or close)
    Transport(String),

    /// Undecodable binary audio chunk
    Decode(String),

    /// Malformed control JSON, or an unserializable outbound payload
    Parse(String),

    /// Audio device acquisition or stream failure
    Device(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Operation not valid in the current session/engine state
    InvalidState(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AgentError::Decode(msg) => write!(f, "Audio decode error: {}", msg),
            AgentError::Parse(msg) => write!(f, "Message parse error: {}", msg),
            AgentError::Device(msg) => write!(f, "Audio device error: {}", msg),
            AgentError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AgentError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

/// Socket failures all collapse into the transport category; the session
/// state machine treats them uniformly (drop to disconnected, no retry).
impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

/// JSON failures come from two places with the same handling: inbound control
/// frames that fail to parse, and the outbound settings frame failing to
/// serialize. Both are parse errors, never fatal to the process.
impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}

/// Type alias for Results that use the client error type.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category_and_message() {
        let err = AgentError::Decode("odd byte count".to_string());
        assert_eq!(err.to_string(), "Audio decode error: odd byte count");

        let err = AgentError::Device("no default input device".to_string());
        assert!(err.to_string().starts_with("Audio device error"));
    }

    #[test]
    fn json_errors_become_parse_errors() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: AgentError = bad.unwrap_err().into();
        assert!(matches!(err, AgentError::Parse(_)));
    }
}
