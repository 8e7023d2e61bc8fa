//! Error taxonomy shared across the engine, adapters, and transports
//!
//! Every failure the session engine can produce is one of these variants;
//! the tool dispatcher maps them into structured tool-error payloads and the
//! HTTP layer maps them onto status codes. Nothing here ever reaches the
//! top-level process except `Configuration` at startup.

use thiserror::Error;

/// Unified error type for call and chat operations
#[derive(Debug, Error)]
pub enum CallError {
    /// Missing or invalid startup configuration; fatal. Carries every
    /// missing variable so the operator fixes them in one pass.
    #[error("missing configuration: {}", missing.join(", "))]
    Configuration { missing: Vec<String> },

    /// Non-2xx (or transport failure) from the carrier, TTS, or STT service
    #[error("{service} error: {message}")]
    Provider { service: &'static str, message: String },

    /// Webhook signature rejected; never reaches the session engine
    #[error("webhook signature verification failed")]
    Signature,

    /// Media WebSocket did not become ready within the connection window
    #[error("media stream did not connect within {0} seconds")]
    ConnectionTimeout(u64),

    /// Recognizer produced no finalized utterance within the configured window
    #[error("no transcript received within {0} seconds")]
    TranscriptTimeout(u64),

    /// The caller hung up (carrier event or media-stream stop)
    #[error("call was hung up")]
    HungUp,

    /// Operation referenced a session that is not live
    #[error("no such session: {0}")]
    NoSuchSession(u64),

    /// Malformed inbound payload; logged and discarded at the boundary
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CallError {
    /// Provider-error constructor used by the HTTP clients
    pub fn provider(service: &'static str, message: impl Into<String>) -> Self {
        CallError::Provider { service, message: message.into() }
    }

    /// Whether this error ends the call (as opposed to just the turn)
    pub fn is_fatal_to_call(&self) -> bool {
        matches!(
            self,
            CallError::HungUp | CallError::ConnectionTimeout(_) | CallError::NoSuchSession(_)
        )
    }
}

/// Convenience alias used throughout the engine
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_lists_all_missing() {
        let err = CallError::Configuration {
            missing: vec!["PHONE_ACCOUNT_ID".into(), "PHONE_SECRET".into()],
        };
        let text = err.to_string();
        assert!(text.contains("PHONE_ACCOUNT_ID"));
        assert!(text.contains("PHONE_SECRET"));
    }

    #[test]
    fn test_fatality_split() {
        assert!(CallError::HungUp.is_fatal_to_call());
        assert!(CallError::ConnectionTimeout(15).is_fatal_to_call());
        assert!(!CallError::TranscriptTimeout(180).is_fatal_to_call());
        assert!(!CallError::provider("tts", "boom").is_fatal_to_call());
    }
}
