//! Common error types for Duplex.

use std::fmt;
use thiserror::Error;

/// Result type alias using Duplex's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which negotiation deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Server never confirmed the session after registration.
    Registration,
    /// No SDP answer arrived for our offer.
    OfferAnswer,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => write!(f, "registration"),
            Self::OfferAnswer => write!(f, "offer/answer"),
        }
    }
}

/// Top-level error type for Duplex operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Signalling channel failed (connect, read or write)
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound frame could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Server sent an explicit ERROR control word
    #[error("signalling server error: {0}")]
    Signalling(String),

    /// Data required to act on an event is missing (e.g. stream caps)
    #[error("negotiation precondition failed: {0}")]
    NegotiationPrecondition(String),

    /// Media engine rejected a command or reported a pipeline error
    #[error("media engine error: {0}")]
    Engine(String),

    /// A negotiation deadline expired
    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    /// Event is not valid in the current negotiation state
    #[error("invalid transition from {state} via {event}")]
    InvalidTransition { state: String, event: String },

    /// Graph mutation would violate the graph model
    #[error("graph error: {0}")]
    Graph(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (kept as text so the error stays cloneable)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl Error {
    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a malformed message error from any displayable type.
    pub fn malformed(msg: impl fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    /// Create a signalling error from any displayable type.
    pub fn signalling(msg: impl fmt::Display) -> Self {
        Self::Signalling(msg.to_string())
    }

    /// Create a precondition error from any displayable type.
    pub fn precondition(msg: impl fmt::Display) -> Self {
        Self::NegotiationPrecondition(msg.to_string())
    }

    /// Create an engine error from any displayable type.
    pub fn engine(msg: impl fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(state: impl fmt::Debug, event: impl fmt::Debug) -> Self {
        Self::InvalidTransition {
            state: format!("{state:?}"),
            event: format!("{event:?}"),
        }
    }

    /// Create a graph error from any displayable type.
    pub fn graph(msg: impl fmt::Display) -> Self {
        Self::Graph(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Whether this error ends the session.
    ///
    /// Everything else stays local to the operation that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Signalling(_) | Self::Engine(_) | Self::Timeout(_)
        )
    }
}
