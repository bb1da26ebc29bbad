//! Signalling wire format.
//!
//! Control words are plain text frames (`HELLO`, `SESSION_OK`, `ERROR <reason>`);
//! SDP and ICE travel as small JSON envelopes. Offers carry the SDP text directly
//! under `sdp.sdp`, while the server's answers nest it one level deeper
//! (`sdp.sdp.sdp`). Both shapes are accepted on decode; outbound offers always
//! use the flat shape the server expects.

use duplex_common::{Error, Result};
use serde::Deserialize;
use serde_json::json;

const HELLO: &str = "HELLO";
const SESSION_OK: &str = "SESSION_OK";
const ERROR_PREFIX: &str = "ERROR";
const SESSION_PREFIX: &str = "SESSION";

/// A decoded inbound signalling frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignallingMessage {
    /// Server acknowledged our registration.
    Hello,
    /// Server paired us with the requested peer (`SESSION_OK`).
    SessionAck,
    /// Server rejected us; always fatal.
    Error { text: String },
    SdpOffer { sdp: String },
    SdpAnswer { sdp: String },
    IceCandidate { candidate: String, mline_index: u32 },
}

/// A frame this client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// `HELLO <client-token>`
    Register { client_token: String },
    /// `SESSION <peer-id>`
    SessionRequest { peer_id: String },
    SdpOffer { sdp: String },
    IceCandidate { candidate: String, mline_index: u32 },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::SessionRequest { .. } => "session-request",
            Self::SdpOffer { .. } => "sdp-offer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    sdp: Option<SdpEnvelope>,
    #[serde(default)]
    ice: Option<IcePayload>,
}

#[derive(Debug, Deserialize)]
struct SdpEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    sdp: SdpText,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SdpText {
    Flat(String),
    Nested { sdp: String },
}

impl SdpText {
    fn into_text(self) -> String {
        match self {
            Self::Flat(sdp) | Self::Nested { sdp } => sdp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IcePayload {
    candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: u32,
}

/// Stateless encoder/decoder for the signalling envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Decode one text frame. Fails only with [`Error::MalformedMessage`].
    pub fn decode(text: &str) -> Result<SignallingMessage> {
        let trimmed = text.trim();
        if trimmed == HELLO {
            return Ok(SignallingMessage::Hello);
        }
        if trimmed == SESSION_OK {
            return Ok(SignallingMessage::SessionAck);
        }
        if let Some(rest) = trimmed.strip_prefix(ERROR_PREFIX) {
            return Ok(SignallingMessage::Error {
                text: rest.trim().to_string(),
            });
        }

        let envelope: InboundEnvelope = serde_json::from_str(trimmed)
            .map_err(|e| Error::malformed(format!("not a signalling envelope: {e}")))?;

        if let Some(sdp) = envelope.sdp {
            let text = sdp.sdp.into_text();
            return match sdp.kind.as_deref() {
                Some("offer") => Ok(SignallingMessage::SdpOffer { sdp: text }),
                Some("answer") | None => Ok(SignallingMessage::SdpAnswer { sdp: text }),
                Some(other) => Err(Error::malformed(format!("unsupported sdp type {other:?}"))),
            };
        }

        if let Some(ice) = envelope.ice {
            return Ok(SignallingMessage::IceCandidate {
                candidate: ice.candidate,
                mline_index: ice.sdp_mline_index,
            });
        }

        Err(Error::malformed("envelope has neither `sdp` nor `ice`"))
    }

    /// Render an outbound frame as wire text.
    pub fn encode(message: &OutboundMessage) -> String {
        match message {
            OutboundMessage::Register { client_token } => format!("{HELLO} {client_token}"),
            OutboundMessage::SessionRequest { peer_id } => format!("{SESSION_PREFIX} {peer_id}"),
            OutboundMessage::SdpOffer { sdp } => json!({
                "sdp": { "type": "offer", "sdp": sdp }
            })
            .to_string(),
            OutboundMessage::IceCandidate {
                candidate,
                mline_index,
            } => json!({
                "ice": { "candidate": candidate, "sdpMLineIndex": mline_index }
            })
            .to_string(),
        }
    }
}
