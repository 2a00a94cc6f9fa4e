//! Error taxonomy surfaced by the session core.
//!
//! Three layers: link-level failures ([`ConnectionError`], [`LinkError`]),
//! the command/parameter request-ack outcomes ([`CommandResult`],
//! [`ParamError`]), and mission transfer outcomes ([`MissionError`]).
//! Capability facades lift these 1:1 rather than wrapping them.

use std::io;

use thiserror::Error;

/// Failures while starting a link.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The receive pipeline could not be started.
    #[error("connections exhausted: receive pipeline could not be started")]
    ConnectionsExhausted,

    /// Socket creation or option setup failed.
    #[error("socket error: {0}")]
    SocketError(#[source] io::Error),

    /// Binding the local port failed.
    #[error("bind error: {0}")]
    BindError(#[source] io::Error),
}

/// Failures while sending on an established link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No datagram has arrived yet, so the peer address is unknown.
    #[error("remote endpoint unknown, no datagram received yet")]
    PeerUnknown,

    /// The OS send failed or was short.
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a command exchange.
///
/// Delivered to async callbacks; the blocking wrappers return the terminal
/// value. [`CommandResult::InProgress`] is the only non-terminal kind: it may
/// be delivered any number of times before exactly one terminal result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandResult {
    /// The vehicle acknowledged with `MAV_RESULT_ACCEPTED`.
    Success,
    /// No vehicle discovered yet (no heartbeat received).
    NoDevice,
    /// The message could not be sent on the link.
    ConnectionError,
    /// The engine's single in-flight slot is occupied.
    Busy,
    /// The vehicle rejected the command.
    CommandDenied,
    /// No ack within the retry budget.
    Timeout,
    /// The vehicle acknowledged a long-running command; carries the reported
    /// progress (NaN when the vehicle did not report any).
    InProgress(f32),
}

impl CommandResult {
    /// Whether this result ends the exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandResult::InProgress(_))
    }
}

/// Outcome of a failed mission upload, download or set-current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MissionError {
    /// Another mission activity occupies the slot.
    #[error("mission engine busy")]
    Busy,

    /// No vehicle discovered yet.
    #[error("no vehicle discovered yet")]
    NoDevice,

    /// Sending on the link failed.
    #[error("link send failed")]
    ConnectionError,

    /// The exchange stalled past the mission timeout.
    #[error("mission transfer timed out")]
    Timeout,

    /// The vehicle reported `MAV_MISSION_NO_SPACE` during upload.
    #[error("too many mission items for vehicle storage")]
    TooManyItems,

    /// A download produced zero items.
    #[error("no mission available on vehicle")]
    NoMissionAvailable,

    /// A downloaded wire item cannot be mapped to the mission item model.
    #[error("unsupported mission item received")]
    Unsupported,

    /// A caller-supplied index does not refer to any mission item.
    #[error("invalid mission item index")]
    InvalidArgument,

    /// Any other protocol-level failure.
    #[error("mission protocol error")]
    Error,
}

/// Outcome of a failed parameter get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParamError {
    /// No `PARAM_VALUE` echo within the retry budget; also the shape a
    /// request for an unknown parameter name takes.
    #[error("parameter request timed out")]
    Timeout,

    /// No vehicle discovered yet.
    #[error("no vehicle discovered yet")]
    NoDevice,

    /// Sending on the link failed.
    #[error("link send failed")]
    ConnectionError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_results() {
        assert!(CommandResult::Success.is_terminal());
        assert!(CommandResult::Timeout.is_terminal());
        assert!(CommandResult::CommandDenied.is_terminal());
        assert!(!CommandResult::InProgress(0.5).is_terminal());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            MissionError::TooManyItems.to_string(),
            "too many mission items for vehicle storage"
        );
        assert_eq!(ParamError::Timeout.to_string(), "parameter request timed out");
    }
}
