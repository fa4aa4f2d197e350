//! Hardware Manager error types.

use thiserror::Error;

use crate::ids::EntityId;

/// Main error type for hardware-manager operations.
#[derive(Error, Debug)]
pub enum HwmError {
    /// A state machine rejected an input in its current state.
    #[error("invalid transition: {fsm} got {input} in state {state}")]
    InvalidTransition {
        fsm: &'static str,
        input: &'static str,
        state: &'static str,
    },

    /// A frame referenced an entity this manager does not know.
    #[error("unknown entity: {0:?}")]
    UnknownEntity(EntityId),

    /// A replay record referenced a node that has not been replayed yet.
    #[error("out-of-order replay record for node {0}")]
    ReplayOutOfOrder(u32),

    /// A peer sent a structurally broken frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An entity was added twice under the same key.
    #[error("duplicate entity: {0:?}")]
    DuplicateEntity(EntityId),

    /// Configuration could not be applied.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport is gone or was never established.
    #[error("transport unavailable")]
    TransportUnavailable,
}

/// Result type alias for hardware-manager operations.
pub type Result<T> = std::result::Result<T, HwmError>;

impl HwmError {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True if the condition only affects the offending frame and the
    /// connection may continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::ReplayOutOfOrder(_)
                | Self::UnknownEntity(_)
                | Self::InvalidTransition { .. }
        )
    }
}
