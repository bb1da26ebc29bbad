//! Boundary between the session core and a media engine.
//!
//! The core only issues commands through [`MediaEngine`]; the engine reports back
//! with [`EngineEvent`]s pushed onto an ordered queue, usually from its own worker
//! threads. Implementations must never mutate session state directly.

use std::fmt;

use duplex_common::Result;

use crate::graph::{MediaLink, NodeSpec};

/// Identity of an incoming stream, stable for the life of the stream
/// (the engine's pad name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Negotiated format of an incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCaps {
    pub media: MediaKind,
    /// RTP encoding name (`VP8`, `OPUS`, ...), upper-cased.
    pub encoding_name: Option<String>,
}

impl StreamCaps {
    pub fn new(media: MediaKind, encoding_name: Option<&str>) -> Self {
        Self {
            media,
            encoding_name: encoding_name.map(str::to_ascii_uppercase),
        }
    }

    /// Classify from a caps structure: its media type name plus the RTP
    /// `media` and `encoding-name` fields when present.
    pub fn from_structure(name: &str, media: Option<&str>, encoding_name: Option<&str>) -> Self {
        let kind = if name.starts_with("video") {
            MediaKind::Video
        } else if name.starts_with("audio") {
            MediaKind::Audio
        } else if name == "application/x-rtp" {
            match media {
                Some("video") => MediaKind::Video,
                Some("audio") => MediaKind::Audio,
                _ => MediaKind::Unknown,
            }
        } else {
            MediaKind::Unknown
        };
        Self::new(kind, encoding_name)
    }
}

/// Coarse pipeline state as seen by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
}

/// Callback from the media engine, delivered through the session's engine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NegotiationNeeded,
    OfferCreated { sdp: String },
    IceCandidate { mline_index: u32, candidate: String },
    /// A new inbound stream appeared. `caps` is `None` when the engine had no
    /// negotiated format for it yet.
    IncomingStream {
        stream: StreamId,
        caps: Option<StreamCaps>,
    },
    StateChanged { from: String, to: String },
    EndOfStream,
    Error { source: String, message: String },
}

/// Commands the session issues to the media engine.
///
/// Every method is called from the session task only, so implementations may
/// assume calls are serialized.
pub trait MediaEngine: Send {
    /// Transition the whole pipeline to running.
    fn start(&mut self) -> Result<()>;

    /// Tear the pipeline down. Must tolerate repeated calls.
    fn stop(&mut self) -> Result<()>;

    /// Ask for an SDP offer; the result arrives as [`EngineEvent::OfferCreated`].
    fn create_offer(&mut self) -> Result<()>;

    fn set_local_description(&mut self, sdp: &str) -> Result<()>;

    /// Apply the remote peer's answer.
    fn set_remote_description(&mut self, sdp: &str) -> Result<()>;

    fn add_ice_candidate(&mut self, mline_index: u32, candidate: &str) -> Result<()>;

    /// Instantiate a node inside the running pipeline.
    fn add_node(&mut self, node: &NodeSpec) -> Result<()>;

    /// Bring a node to the state of its parent pipeline.
    fn sync_node_state(&mut self, node: &str) -> Result<()>;

    fn link(&mut self, link: &MediaLink) -> Result<()>;

    /// Take a node added at runtime back out of the pipeline, unlinking it.
    fn remove_node(&mut self, node: &str) -> Result<()>;

    /// The session decided not to consume `stream`.
    fn release_stream(&mut self, _stream: &StreamId) -> Result<()> {
        Ok(())
    }
}
