//! Error types for PNSim

use std::time::Duration;

use thiserror::Error;

use crate::{PortRole, TokenKind};

/// Core PNSim errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    // Net construction errors
    #[error("Net {0} already exists")]
    DuplicateNet(String),

    #[error("Place {place} already exists in net {net}")]
    DuplicatePlace { net: String, place: String },

    #[error("Transition {transition} already exists in net {net}")]
    DuplicateTransition { net: String, transition: String },

    #[error("Unknown net: {0}")]
    UnknownNet(String),

    #[error("Unknown place {place} in net {net}")]
    UnknownPlace { net: String, place: String },

    #[error("Unknown transition {transition} in net {net}")]
    UnknownTransition { net: String, transition: String },

    #[error("Place {place} is already {current}, cannot become {requested}")]
    ConflictingPortRole {
        place: String,
        current: PortRole,
        requested: PortRole,
    },

    #[error("Transition {transition} is already {existing}, cannot become {requested}")]
    ConflictingExtension {
        transition: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Priority should be in 0-100, got {0}")]
    PriorityOutOfRange(u8),

    #[error("Probability should be in 0-1, got {0}")]
    ProbabilityOutOfRange(f64),

    #[error("Probability of {transition} was already set to {value}")]
    ProbabilityAlreadySet { transition: String, value: f64 },

    #[error("Timeout of {0} must be positive")]
    InvalidTimeout(String),

    #[error("Full probability {total} exceeds 1.0 for transitions [{group}]")]
    ProbabilityOverflow { group: String, total: f64 },

    #[error("Probability {total} < 1.0 for transitions [{group}]")]
    ProbabilityShortfall { group: String, total: f64 },

    #[error("Transition {neighbour} has different input places from {transition}")]
    NeighbourPlacesMismatch {
        transition: String,
        neighbour: String,
    },

    #[error("Neighbour {neighbour} of {transition} is not probabilistic or does not exist")]
    InvalidNeighbour {
        transition: String,
        neighbour: String,
    },

    #[error("Transition {0} has no input arcs")]
    NoInputArcs(String),

    #[error("Output variable {variable} of {transition} is not bound by any input arc")]
    UnboundOutputVariable {
        transition: String,
        variable: String,
    },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    // Firing errors
    #[error("Transition {0} not enabled for binding")]
    NotEnabled(String),

    #[error("Variable {0} is not bound")]
    UnboundVariable(String),

    #[error("Place {place} accepts {expected} tokens, got {actual}")]
    TypeMismatch {
        place: String,
        expected: TokenKind,
        actual: TokenKind,
    },

    #[error("Expression {label} failed: {reason}")]
    Expression { label: String, reason: String },

    #[error("Transition {0} is not timed")]
    NotTimed(String),

    // Codec and protocol errors
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Malformed control message: {0:?}")]
    MalformedControl(String),

    #[error("Remote failure for {request:?}: {reason}")]
    RemoteFailure { request: String, reason: String },

    #[error("Port negotiation timed out after {waited:?} with {pending} replies outstanding")]
    PortNegotiationTimeout { waited: Duration, pending: usize },

    // Scheduling errors
    #[error("Simulation is not running")]
    NotStarted,

    #[error("Simulation was already started")]
    AlreadyStarted,

    #[error("Scheduling at a non-positive time")]
    NonPositiveTime,

    #[error("Not positive running time value")]
    NonPositiveEndTime,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Client {0} is already connected")]
    DuplicateClient(String),

    #[error("Transport is closed")]
    Disconnected,

    #[error("Place {place} of net {net} is not an input port")]
    NotAnInputPort { net: String, place: String },

    #[error("I/O error: {0}")]
    Io(String),

    // Lifecycle errors
    #[error("Simulation was killed")]
    Killed,

    #[error("Invalid node state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SimError {
    /// Errors that tear the owning node down instead of failing one call
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::MalformedControl(_)
                | SimError::RemoteFailure { .. }
                | SimError::PortNegotiationTimeout { .. }
                | SimError::Killed
        )
    }
}

/// Result type for PNSim operations
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SimError::MalformedControl("X".into()).is_fatal());
        assert!(SimError::PortNegotiationTimeout {
            waited: Duration::from_secs(1),
            pending: 2
        }
        .is_fatal());
        assert!(!SimError::DuplicateNet("room".into()).is_fatal());
        assert!(!SimError::NonPositiveTime.is_fatal());
    }

    #[test]
    fn test_role_conflict_display() {
        let e = SimError::ConflictingPortRole {
            place: "Q gain".into(),
            current: PortRole::Input,
            requested: PortRole::Output,
        };
        assert_eq!(e.to_string(), "Place Q gain is already input, cannot become output");
    }
}
