//! error taxonomy for the gateway
//!
//! only signing errors are fatal, and only at startup. everything else is
//! recovered from inside the loop that raised it.

use thiserror::Error;

/// The private key could not be used to mint a credential.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("malformed private key: {0}")]
    MalformedKey(String),

    #[error("token validity must be positive")]
    InvalidValidity,

    #[error("signing failed: {0}")]
    Sign(String),
}

/// Failures surfaced by the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    /// broker rejected the credential; reconnect with a fresh one
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// network / tls failure; reconnect
    #[error("transport error: {0}")]
    Transport(String),

    /// publish attempted while the session is not subscribed
    #[error("not connected")]
    NotConnected,

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error(transparent)]
    Signing(#[from] SigningError),

    /// the session task has stopped
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// errors that mean the current connection is unusable
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            SessionError::Auth(_) | SessionError::Transport(_) | SessionError::Subscribe { .. }
        )
    }
}

/// A single sensor poll failed. Never fatal.
#[derive(Error, Debug)]
pub enum SensorReadError {
    #[error("bus error: {0}")]
    Bus(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },

    #[error("read timed out after {0} ms")]
    Timeout(u64),

    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fault_classification() {
        assert!(SessionError::Auth("bad".into()).is_connection_fault());
        assert!(SessionError::Transport("reset".into()).is_connection_fault());
        assert!(!SessionError::NotConnected.is_connection_fault());
        assert!(!SessionError::Closed.is_connection_fault());
    }

    #[test]
    fn test_checksum_message() {
        let e = SensorReadError::Checksum { expected: 0x2a, actual: 0x10 };
        assert_eq!(e.to_string(), "checksum mismatch (expected 0x2a, got 0x10)");
    }
}
