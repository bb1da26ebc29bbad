//! Signalling and SDP negotiation state machine.
//!
//! The controller is pure: it consumes [`NegotiationEvent`]s and answers with the
//! [`NegotiationAction`]s the session must carry out, in order. It never touches
//! the engine or the socket itself.

use std::fmt;
use std::time::Duration;

use duplex_common::{Error, Result, TimeoutKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::protocol::{OutboundMessage, SignallingMessage};

/// Negotiation phase of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Registering,
    SessionEstablished,
    OfferSent,
    Connected,
    Failed { error: Error },
}

impl NegotiationState {
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Registering => 1,
            Self::SessionEstablished => 2,
            Self::OfferSent => 3,
            Self::Connected => 4,
            Self::Failed { .. } => 5,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Registering => write!(f, "registering"),
            Self::SessionEstablished => write!(f, "session-established"),
            Self::OfferSent => write!(f, "offer-sent"),
            Self::Connected => write!(f, "connected"),
            Self::Failed { error } => write!(f, "failed ({error})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    ChannelOpen,
    Inbound(SignallingMessage),
    NegotiationNeeded,
    OfferCreated { sdp: String },
    LocalCandidate { mline_index: u32, candidate: String },
    Timeout(TimeoutKind),
    /// Transport or engine failure reported by the session.
    Fatal(Error),
}

impl NegotiationEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ChannelOpen => "channel-open",
            Self::Inbound(SignallingMessage::Hello) => "hello",
            Self::Inbound(SignallingMessage::SessionAck) => "session-ok",
            Self::Inbound(SignallingMessage::Error { .. }) => "server-error",
            Self::Inbound(SignallingMessage::SdpOffer { .. }) => "sdp-offer",
            Self::Inbound(SignallingMessage::SdpAnswer { .. }) => "sdp-answer",
            Self::Inbound(SignallingMessage::IceCandidate { .. }) => "remote-ice-candidate",
            Self::NegotiationNeeded => "negotiation-needed",
            Self::OfferCreated { .. } => "offer-created",
            Self::LocalCandidate { .. } => "local-ice-candidate",
            Self::Timeout(TimeoutKind::Registration) => "registration-timeout",
            Self::Timeout(TimeoutKind::OfferAnswer) => "offer-answer-timeout",
            Self::Fatal(_) => "fatal-error",
        }
    }
}

/// Work the session must perform, in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    Send(OutboundMessage),
    StartPipeline,
    StopPipeline,
    CreateOffer,
    SetLocalDescription(String),
    SetRemoteDescription(String),
    AddIceCandidate { mline_index: u32, candidate: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationTransition {
    pub from: NegotiationState,
    pub to: NegotiationState,
    pub event: &'static str,
}

/// Result of feeding one event to the controller.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NegotiationStep {
    /// Set when the event moved the state machine, including self-transitions.
    pub transition: Option<NegotiationTransition>,
    pub actions: Vec<NegotiationAction>,
}

impl NegotiationStep {
    fn actions(actions: Vec<NegotiationAction>) -> Self {
        Self {
            transition: None,
            actions,
        }
    }

    fn with(mut self, actions: Vec<NegotiationAction>) -> Self {
        self.actions = actions;
        self
    }
}

/// The remote party of this process and how far negotiation with it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub peer_id: String,
    pub server_url: String,
    pub relay_uri: Option<String>,
    state: NegotiationState,
}

impl PeerSession {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            peer_id: config.peer_id.clone(),
            server_url: config.server_url.clone(),
            relay_uri: config.graph.relay_uri.clone(),
            state: NegotiationState::Idle,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }
}

pub struct NegotiationController {
    peer: PeerSession,
    client_token: String,
    registration_timeout: Duration,
    offer_timeout: Duration,
    entered_at: Instant,
    established_at: Option<Instant>,
    offer_requested: bool,
}

impl NegotiationController {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            peer: PeerSession::from_config(config),
            client_token: config.client_token.clone(),
            registration_timeout: config.registration_timeout,
            offer_timeout: config.offer_timeout,
            entered_at: Instant::now(),
            established_at: None,
            offer_requested: false,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.peer.state
    }

    pub fn peer(&self) -> &PeerSession {
        &self.peer
    }

    pub fn is_failed(&self) -> bool {
        self.peer.state.is_failed()
    }

    /// Error that moved the session to `Failed`, if any.
    pub fn failure(&self) -> Option<&Error> {
        match &self.peer.state {
            NegotiationState::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// When the current state times out, if it has a deadline at all.
    pub fn deadline(&self) -> Option<(Instant, TimeoutKind)> {
        match self.peer.state {
            NegotiationState::Registering => Some((
                self.entered_at + self.registration_timeout,
                TimeoutKind::Registration,
            )),
            NegotiationState::SessionEstablished | NegotiationState::OfferSent => self
                .established_at
                .map(|at| (at + self.offer_timeout, TimeoutKind::OfferAnswer)),
            _ => None,
        }
    }

    pub fn handle(&mut self, event: NegotiationEvent) -> Result<NegotiationStep> {
        use NegotiationEvent as Ev;
        use NegotiationState as St;

        let current = self.peer.state.clone();
        let name = event.name();
        match (current, event) {
            (St::Failed { .. }, _) => Err(self.invalid(name)),

            (_, Ev::Fatal(error)) => self.fail(error, name),
            (_, Ev::Inbound(SignallingMessage::Error { text })) => {
                warn!("signalling server reported an error: {}", text);
                self.fail(Error::signalling(text), name)
            }

            (St::Idle, Ev::ChannelOpen) => {
                let step = self.transition(St::Registering, name)?;
                Ok(step.with(vec![NegotiationAction::Send(OutboundMessage::Register {
                    client_token: self.client_token.clone(),
                })]))
            }
            (St::Registering, Ev::Inbound(SignallingMessage::Hello)) => {
                let step = self.transition(St::Registering, name)?;
                Ok(step.with(vec![NegotiationAction::Send(
                    OutboundMessage::SessionRequest {
                        peer_id: self.peer.peer_id.clone(),
                    },
                )]))
            }
            (St::Registering, Ev::Inbound(SignallingMessage::SessionAck)) => {
                let step = self.transition(St::SessionEstablished, name)?;
                self.established_at = Some(self.entered_at);
                Ok(step.with(vec![NegotiationAction::StartPipeline]))
            }
            (St::SessionEstablished, Ev::NegotiationNeeded) => {
                if self.offer_requested {
                    debug!("offer already requested, ignoring negotiation-needed");
                    return Ok(NegotiationStep::default());
                }
                self.offer_requested = true;
                Ok(NegotiationStep::actions(vec![NegotiationAction::CreateOffer]))
            }
            (St::SessionEstablished, Ev::OfferCreated { sdp }) => {
                let step = self.transition(St::OfferSent, name)?;
                Ok(step.with(vec![
                    NegotiationAction::SetLocalDescription(sdp.clone()),
                    NegotiationAction::Send(OutboundMessage::SdpOffer { sdp }),
                ]))
            }
            (St::OfferSent, Ev::Inbound(SignallingMessage::SdpAnswer { sdp })) => {
                let step = self.transition(St::Connected, name)?;
                Ok(step.with(vec![NegotiationAction::SetRemoteDescription(sdp)]))
            }

            // Trickle ICE flows in both directions without moving the state.
            (
                _,
                Ev::LocalCandidate {
                    mline_index,
                    candidate,
                },
            ) => Ok(NegotiationStep::actions(vec![NegotiationAction::Send(
                OutboundMessage::IceCandidate {
                    candidate,
                    mline_index,
                },
            )])),
            (
                _,
                Ev::Inbound(SignallingMessage::IceCandidate {
                    candidate,
                    mline_index,
                }),
            ) => Ok(NegotiationStep::actions(vec![
                NegotiationAction::AddIceCandidate {
                    mline_index,
                    candidate,
                },
            ])),

            (St::Registering, Ev::Timeout(kind @ TimeoutKind::Registration))
            | (
                St::SessionEstablished | St::OfferSent,
                Ev::Timeout(kind @ TimeoutKind::OfferAnswer),
            ) => {
                warn!("{} timed out in state {}", kind, self.peer.state);
                self.fail(Error::Timeout(kind), name)
            }

            (_, _) => Err(self.invalid(name)),
        }
    }

    fn fail(&mut self, error: Error, event: &'static str) -> Result<NegotiationStep> {
        let step = self.transition(NegotiationState::Failed { error }, event)?;
        Ok(step.with(vec![NegotiationAction::StopPipeline]))
    }

    fn transition(
        &mut self,
        to: NegotiationState,
        event: &'static str,
    ) -> Result<NegotiationStep> {
        if to.rank() < self.peer.state.rank() {
            return Err(self.invalid(event));
        }
        let from = std::mem::replace(&mut self.peer.state, to.clone());
        if from != to {
            self.entered_at = Instant::now();
        }
        info!("negotiation {} -> {} on {}", from, to, event);
        Ok(NegotiationStep {
            transition: Some(NegotiationTransition { from, to, event }),
            actions: Vec::new(),
        })
    }

    fn invalid(&self, event: &str) -> Error {
        Error::InvalidTransition {
            state: self.peer.state.to_string(),
            event: event.to_string(),
        }
    }
}
