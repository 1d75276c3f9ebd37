//! Error types and ack codes for mhf-channel

use thiserror::Error;

/// Main error type for channel server operations
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Malformed opcode or payload. Aborts the rest of the current packet group.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A stage or semaphore is full
    #[error("{target} is full ({capacity} slots)")]
    Capacity { target: String, capacity: u16 },

    /// The operation names something that does not exist or is not allowed in its current state
    #[error("Invalid state: {message}")]
    State { message: String },

    /// Socket failure or EOF
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A handler panicked while processing a packet group
    #[error("Dispatch panic: {message}")]
    Panic { message: String },
}

impl ChannelError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State { message: message.into() }
    }

    pub fn capacity(target: impl Into<String>, capacity: u16) -> Self {
        Self::Capacity { target: target.into(), capacity }
    }

    /// Convert error to the `ErrorCode` byte carried by a failure ack:
    /// - 0: Success (never produced by an error)
    /// - 1: Generic failure (capacity, state, protocol)
    ///
    /// Fatal classes never reach the client; they map to 1 for logging only.
    pub fn ack_code(&self) -> u8 {
        match self {
            Self::Protocol { .. } => ACK_FAIL,
            Self::Capacity { .. } => ACK_FAIL,
            Self::State { .. } => ACK_FAIL,
            Self::Connection(_) => ACK_FAIL,
            Self::Panic { .. } => ACK_FAIL,
        }
    }

    /// True for errors that end the session instead of producing an ack
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Panic { .. })
    }
}

/// Ack error code for success
pub const ACK_SUCCESS: u8 = 0;
/// Ack error code for a generic failure
pub const ACK_FAIL: u8 = 1;
/// Ack error code the client reads as "operation still in progress"
pub const ACK_IN_PROGRESS: u8 = 2;

/// Result type alias for channel server operations
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classes() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(ChannelError::from(io).is_fatal());
        assert!(ChannelError::Panic { message: "boom".into() }.is_fatal());
        assert!(!ChannelError::capacity("room1", 2).is_fatal());
        assert!(!ChannelError::state("no stage").is_fatal());
        assert!(!ChannelError::protocol("short read").is_fatal());
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(ChannelError::capacity("boss1", 4).ack_code(), ACK_FAIL);
        assert_eq!(ChannelError::state("missing").ack_code(), ACK_FAIL);
    }

    #[test]
    fn test_display() {
        let err = ChannelError::capacity("room1", 2);
        assert_eq!(err.to_string(), "room1 is full (2 slots)");
    }
}
