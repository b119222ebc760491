//! Crate-wide error taxonomy.
//!
//! Mirrors the error classes from the runtime's failure-handling design:
//! config errors abort startup, lifecycle failures abort the Runtime, and
//! bus/remote/serialization/topic errors are reported as classified values
//! rather than panics — callers decide whether a failure is fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaceError {
    /// Missing mandatory option, unknown Entity implementation, duplicate
    /// names, or any other malformed configuration. Fatal — aborts startup.
    #[error("config error: {0}")]
    Config(String),

    /// An Entity failed to acknowledge a lifecycle command in time, or
    /// returned a failure acknowledgment.
    #[error("lifecycle failure for entity '{entity}' during {phase}: {reason}")]
    Lifecycle {
        entity: String,
        phase: &'static str,
        reason: String,
    },

    /// Inbox full under a hard-fail overflow policy.
    #[error("bus enqueue failed for channel '{channel}': {reason}")]
    BusEnqueue { channel: String, reason: String },

    /// Outbound remote send or request failed (dead connection, peer gone).
    #[error("remote transport error talking to '{peer}': {reason}")]
    RemoteTransport { peer: String, reason: String },

    /// Unregistered payload type, or a codec that failed to encode/decode.
    #[error("serialization error for payload type {type_id}: {reason}")]
    Serialization { type_id: String, reason: String },

    /// Unexpected Accept/Release or a rejected ChannelTopic cycle.
    #[error("channel-topic protocol violation: {0}")]
    TopicProtocol(String),

    /// A channel pattern that fails to parse (e.g. `**` mid-path).
    #[error("invalid channel pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RaceError {
    pub fn config(msg: impl Into<String>) -> Self {
        RaceError::Config(msg.into())
    }

    pub fn lifecycle(entity: impl Into<String>, phase: &'static str, reason: impl Into<String>) -> Self {
        RaceError::Lifecycle {
            entity: entity.into(),
            phase,
            reason: reason.into(),
        }
    }
}

/// Call-level transport error for a single request/notify against an
/// internal `mpsc`/`oneshot` pair — distinguishes "the peer task is gone"
/// from an application-level rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// The receiving task's channel is closed; nobody will ever answer.
    Send,
    /// The receiving task dropped the reply sender without responding.
    Recv,
    /// The receiving task's inbox is full (bounded channel, `try_send`).
    Full,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Send => write!(f, "send failed: receiver is not running"),
            CallError::Recv => write!(f, "recv failed: receiver dropped the reply sender"),
            CallError::Full => write!(f, "receiver's inbox is full"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let e = RaceError::config("missing field");
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn lifecycle_error_display_has_entity_and_phase() {
        let e = RaceError::lifecycle("radar-1", "Start", "timed out");
        let msg = e.to_string();
        assert!(msg.contains("radar-1"));
        assert!(msg.contains("Start"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn call_error_display() {
        assert!(CallError::Send.to_string().contains("not running"));
        assert!(CallError::Recv.to_string().contains("dropped"));
        assert!(CallError::Full.to_string().contains("full"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let e: RaceError = io_err.into();
        assert!(e.to_string().contains("io error"));
    }
}
