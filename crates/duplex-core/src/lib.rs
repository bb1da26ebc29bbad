//! Core of the Duplex send/receive client.
//!
//! This crate provides:
//! - The signalling wire codec and WebSocket channel
//! - Negotiation state machine (registration, SDP offer/answer, ICE trickle)
//! - Media graph model, startup template and incoming-stream routing
//! - Pipeline lifecycle mapping and the session event loop that owns them all

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod graph;
pub mod lifecycle;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod streams;
pub mod template;

#[cfg(test)]
mod testing;

pub use channel::{ChannelEvent, SignallingChannel};
pub use config::{GraphConfig, SessionConfig, DEFAULT_SERVER_URL};
pub use engine::{EngineEvent, MediaEngine, MediaKind, PipelineState, StreamCaps, StreamId};
pub use graph::{Anchor, MediaGraph, MediaLink, NodeFactory, NodeKind, NodeRegistry, NodeSpec, PortRef};
pub use lifecycle::{LifecycleOutcome, PipelineLifecycle};
pub use negotiation::{
    NegotiationAction, NegotiationController, NegotiationEvent, NegotiationState,
    NegotiationStep, NegotiationTransition, PeerSession,
};
pub use protocol::{MessageCodec, OutboundMessage, SignallingMessage};
pub use session::{Session, SessionOutcome};
pub use streams::{AttachOutcome, MediaGraphController, MediaStreamHandle};
pub use template::GraphTemplate;
