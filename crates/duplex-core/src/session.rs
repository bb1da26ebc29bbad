//! Session event loop.
//!
//! One task owns the negotiation controller, the graph controller, the pipeline
//! lifecycle and the engine. Transport frames, engine callbacks and deadlines
//! are all serialized through [`Session::run`].

use std::future::Future;
use std::ops::ControlFlow;

use duplex_common::{Error, Result, TimeoutKind};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelEvent;
use crate::config::SessionConfig;
use crate::engine::{EngineEvent, MediaEngine};
use crate::graph::MediaGraph;
use crate::lifecycle::{LifecycleOutcome, PipelineLifecycle};
use crate::negotiation::{
    NegotiationAction, NegotiationController, NegotiationEvent, NegotiationState, PeerSession,
};
use crate::protocol::MessageCodec;
use crate::streams::MediaGraphController;
use crate::template::GraphTemplate;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Signalling channel closed or the user interrupted.
    Closed,
    EndOfStream,
    Failed(Error),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

type Flow = ControlFlow<SessionOutcome>;

pub struct Session<E: MediaEngine> {
    negotiation: NegotiationController,
    graph: MediaGraphController,
    lifecycle: PipelineLifecycle,
    engine: E,
    outbound: mpsc::Sender<String>,
}

impl<E: MediaEngine> Session<E> {
    pub fn new(config: &SessionConfig, engine: E, outbound: mpsc::Sender<String>) -> Result<Self> {
        let template = GraphTemplate::sendrecv(&config.graph);
        Ok(Self {
            negotiation: NegotiationController::new(config),
            graph: MediaGraphController::new(template, config.graph.clone())?,
            lifecycle: PipelineLifecycle::new(),
            engine,
            outbound,
        })
    }

    pub fn state(&self) -> &NegotiationState {
        self.negotiation.state()
    }

    pub fn peer(&self) -> &PeerSession {
        self.negotiation.peer()
    }

    pub fn graph(&self) -> &MediaGraph {
        self.graph.graph()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Drive the session until it closes, fails, drains, or `shutdown` resolves.
    pub async fn run<S>(
        &mut self,
        mut channel_events: mpsc::Receiver<ChannelEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        shutdown: S,
    ) -> SessionOutcome
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let deadline = self.negotiation.deadline();
            let flow = tokio::select! {
                event = channel_events.recv() => match event {
                    Some(event) => self.handle_channel_event(event).await,
                    None => self.fail(Error::transport("signalling channel ended unexpectedly")),
                },
                Some(event) = engine_events.recv() => self.handle_engine_event(event).await,
                kind = wait_for(deadline) => self.handle_timeout(kind).await,
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    self.stop_pipeline();
                    ControlFlow::Break(SessionOutcome::Closed)
                }
            };
            if let ControlFlow::Break(outcome) = flow {
                info!("session finished: {:?}", outcome);
                return outcome;
            }
        }
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Open => self.step(NegotiationEvent::ChannelOpen).await,
            ChannelEvent::Message(text) => match MessageCodec::decode(&text) {
                Ok(message) => self.step(NegotiationEvent::Inbound(message)).await,
                Err(e) => {
                    warn!("dropping signalling frame: {}", e);
                    ControlFlow::Continue(())
                }
            },
            ChannelEvent::Close { code, reason } => {
                info!("signalling channel closed (code {:?}): {}", code, reason);
                self.stop_pipeline();
                ControlFlow::Break(SessionOutcome::Closed)
            }
            ChannelEvent::Error(message) => self.fail(Error::transport(message)),
        }
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Flow {
        match event {
            EngineEvent::NegotiationNeeded => self.step(NegotiationEvent::NegotiationNeeded).await,
            EngineEvent::OfferCreated { sdp } => {
                self.step(NegotiationEvent::OfferCreated { sdp }).await
            }
            EngineEvent::IceCandidate {
                mline_index,
                candidate,
            } => {
                self.step(NegotiationEvent::LocalCandidate {
                    mline_index,
                    candidate,
                })
                .await
            }
            EngineEvent::IncomingStream { stream, caps } => {
                if self.negotiation.is_failed() {
                    return ControlFlow::Continue(());
                }
                match self.graph.on_incoming_stream(&mut self.engine, stream, caps) {
                    Ok(outcome) => {
                        debug!("incoming stream handled: {:?}", outcome);
                        ControlFlow::Continue(())
                    }
                    Err(e) if e.is_fatal() => self.fail(e),
                    Err(e) => {
                        warn!("incoming stream not routed: {}", e);
                        ControlFlow::Continue(())
                    }
                }
            }
            event @ (EngineEvent::StateChanged { .. }
            | EngineEvent::EndOfStream
            | EngineEvent::Error { .. }) => {
                match self.lifecycle.on_engine_event(&mut self.engine, &event) {
                    LifecycleOutcome::Continue => ControlFlow::Continue(()),
                    LifecycleOutcome::Finished => {
                        self.graph.set_running(false);
                        ControlFlow::Break(SessionOutcome::EndOfStream)
                    }
                    LifecycleOutcome::Failed(e) => self.fail(e),
                }
            }
        }
    }

    pub async fn handle_timeout(&mut self, kind: TimeoutKind) -> Flow {
        self.step(NegotiationEvent::Timeout(kind)).await
    }

    async fn step(&mut self, event: NegotiationEvent) -> Flow {
        let step = match self.negotiation.handle(event) {
            Ok(step) => step,
            Err(e) => {
                warn!("ignoring event: {}", e);
                return ControlFlow::Continue(());
            }
        };

        for action in step.actions {
            if let Err(e) = self.execute(action).await {
                if e.is_fatal() {
                    return self.fail(e);
                }
                warn!("action failed: {}", e);
            }
        }

        match self.negotiation.failure() {
            Some(error) => ControlFlow::Break(SessionOutcome::Failed(error.clone())),
            None => ControlFlow::Continue(()),
        }
    }

    async fn execute(&mut self, action: NegotiationAction) -> Result<()> {
        match action {
            NegotiationAction::Send(message) => {
                debug!("sending {}", message.kind());
                self.outbound
                    .send(MessageCodec::encode(&message))
                    .await
                    .map_err(|_| Error::transport("outbound queue closed"))
            }
            NegotiationAction::StartPipeline => {
                self.lifecycle.start(&mut self.engine)?;
                self.graph.set_running(true);
                Ok(())
            }
            NegotiationAction::StopPipeline => {
                self.stop_pipeline();
                Ok(())
            }
            NegotiationAction::CreateOffer => self.engine.create_offer(),
            NegotiationAction::SetLocalDescription(sdp) => self.engine.set_local_description(&sdp),
            NegotiationAction::SetRemoteDescription(sdp) => {
                self.engine.set_remote_description(&sdp)
            }
            NegotiationAction::AddIceCandidate {
                mline_index,
                candidate,
            } => self.engine.add_ice_candidate(mline_index, &candidate),
        }
    }

    /// Record a fatal error, tear the pipeline down and end the session.
    fn fail(&mut self, error: Error) -> Flow {
        error!("session failed: {}", error);
        if let Err(e) = self.negotiation.handle(NegotiationEvent::Fatal(error.clone())) {
            debug!("negotiation already terminal: {}", e);
        }
        self.stop_pipeline();
        let error = self.negotiation.failure().cloned().unwrap_or(error);
        ControlFlow::Break(SessionOutcome::Failed(error))
    }

    fn stop_pipeline(&mut self) {
        if let Err(e) = self.lifecycle.stop(&mut self.engine) {
            error!("failed to stop pipeline: {}", e);
        }
        self.graph.set_running(false);
    }
}

async fn wait_for(deadline: Option<(Instant, TimeoutKind)>) -> TimeoutKind {
    match deadline {
        Some((at, kind)) => {
            sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{MediaKind, StreamCaps, StreamId};
    use crate::graph::{MediaLink, PortRef};
    use crate::protocol::SignallingMessage;
    use crate::template::{
        MIXER_NODE, MIXER_REMOTE_INPUT, RELAY_SINK_NODE, RELAY_TEE_NODE, RELAY_TEE_OUTPUT,
        WEBRTC_NODE,
    };
    use crate::testing::{Command, RecordingEngine};

    struct Harness {
        session: Session<RecordingEngine>,
        sent: mpsc::Receiver<String>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, sent) = mpsc::channel(64);
            let session =
                Session::new(&SessionConfig::new("4242"), RecordingEngine::default(), tx).unwrap();
            Self { session, sent }
        }

        async fn frame(&mut self, text: &str) -> Flow {
            self.session
                .handle_channel_event(ChannelEvent::Message(text.to_string()))
                .await
        }

        async fn engine(&mut self, event: EngineEvent) -> Flow {
            self.session.handle_engine_event(event).await
        }

        fn drain(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.sent.try_recv() {
                frames.push(frame);
            }
            frames
        }

        async fn establish(&mut self) {
            let _ = self.session.handle_channel_event(ChannelEvent::Open).await;
            let _ = self.frame("HELLO").await;
            let _ = self.frame("SESSION_OK").await;
        }
    }

    fn answer(sdp: &str) -> String {
        serde_json::json!({ "sdp": { "type": "answer", "sdp": sdp } }).to_string()
    }

    fn ice(mline: u32, candidate: &str) -> String {
        serde_json::json!({ "ice": { "candidate": candidate, "sdpMLineIndex": mline } })
            .to_string()
    }

    #[tokio::test]
    async fn happy_path_registers_offers_and_applies_answer() {
        let mut h = Harness::new();

        let _ = h.session.handle_channel_event(ChannelEvent::Open).await;
        assert_eq!(h.drain(), vec!["HELLO 564322".to_string()]);

        let _ = h.frame("HELLO").await;
        assert_eq!(h.drain(), vec!["SESSION 4242".to_string()]);

        let _ = h.frame("SESSION_OK").await;
        assert_eq!(h.session.state(), &NegotiationState::SessionEstablished);
        assert_eq!(h.session.engine().count(&Command::Start), 1);
        assert!(h.session.graph().is_running());

        let _ = h.engine(EngineEvent::NegotiationNeeded).await;
        let _ = h
            .engine(EngineEvent::OfferCreated {
                sdp: "v=0 offer".to_string(),
            })
            .await;
        let frames = h.drain();
        assert_eq!(frames.len(), 1);
        let offer: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(offer["sdp"]["type"], "offer");
        assert_eq!(offer["sdp"]["sdp"], "v=0 offer");

        let _ = h.frame(&answer("v=0 answer")).await;
        assert_eq!(h.session.state(), &NegotiationState::Connected);

        let commands = &h.session.engine().commands;
        let set_local = commands
            .iter()
            .position(|c| c == &Command::SetLocal("v=0 offer".to_string()))
            .unwrap();
        let set_remote = commands
            .iter()
            .position(|c| c == &Command::SetRemote("v=0 answer".to_string()))
            .unwrap();
        assert!(set_local < set_remote);
    }

    #[tokio::test]
    async fn server_error_before_session_ack_fails_without_starting() {
        let mut h = Harness::new();
        let _ = h.session.handle_channel_event(ChannelEvent::Open).await;
        let _ = h.frame("HELLO").await;
        h.drain();

        let flow = h.frame("ERROR peer '4242' not found").await;
        assert_eq!(
            flow,
            ControlFlow::Break(SessionOutcome::Failed(Error::Signalling(
                "peer '4242' not found".to_string()
            )))
        );
        assert_eq!(h.session.engine().count(&Command::Start), 0);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn ice_is_applied_in_arrival_order() {
        let mut h = Harness::new();
        h.establish().await;

        for (mline, candidate) in [(0, "cand-a"), (1, "cand-b"), (0, "cand-c")] {
            let _ = h.frame(&ice(mline, candidate)).await;
        }
        assert_eq!(
            h.session.engine().ice_applied(),
            vec![
                (0, "cand-a".to_string()),
                (1, "cand-b".to_string()),
                (0, "cand-c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn early_ice_does_not_disturb_the_start() {
        let mut h = Harness::new();
        let _ = h.session.handle_channel_event(ChannelEvent::Open).await;
        let _ = h.frame(&ice(0, "early")).await;
        let _ = h.frame("HELLO").await;
        let _ = h.frame(&ice(1, "between")).await;
        let _ = h.frame("SESSION_OK").await;
        let _ = h.frame("SESSION_OK").await;

        assert_eq!(h.session.engine().count(&Command::Start), 1);
        assert_eq!(h.session.engine().ice_applied().len(), 2);
        assert_eq!(h.session.state(), &NegotiationState::SessionEstablished);
    }

    #[tokio::test]
    async fn local_candidates_around_the_ack_do_not_disturb_the_start() {
        let mut h = Harness::new();
        let local = |n: u32| EngineEvent::IceCandidate {
            mline_index: n,
            candidate: format!("candidate:{n} 1 UDP 1 10.0.0.1 5000 typ host"),
        };

        let _ = h.session.handle_channel_event(ChannelEvent::Open).await;
        let _ = h.engine(local(0)).await;
        let _ = h.frame("HELLO").await;
        let _ = h.frame(&ice(0, "remote")).await;
        let _ = h.engine(local(1)).await;
        let _ = h.frame("SESSION_OK").await;
        let _ = h.engine(local(0)).await;
        let _ = h.frame("SESSION_OK").await;
        let _ = h.engine(local(1)).await;

        assert_eq!(h.session.engine().count(&Command::Start), 1);
        assert_eq!(h.session.state(), &NegotiationState::SessionEstablished);
        let trickled = h
            .drain()
            .iter()
            .filter(|frame| frame.contains("\"ice\""))
            .count();
        assert_eq!(trickled, 4);
    }

    #[tokio::test]
    async fn local_candidates_are_trickled_to_the_server() {
        let mut h = Harness::new();
        h.establish().await;
        h.drain();

        let _ = h
            .engine(EngineEvent::IceCandidate {
                mline_index: 1,
                candidate: "candidate:1 1 UDP 1 10.0.0.1 5000 typ host".to_string(),
            })
            .await;
        let frames = h.drain();
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["ice"]["sdpMLineIndex"], 1);
    }

    #[tokio::test]
    async fn malformed_frames_leave_state_alone() {
        let mut h = Harness::new();
        h.establish().await;

        let flow = h.frame("{not json").await;
        assert_eq!(flow, ControlFlow::Continue(()));
        let flow = h.frame(r#"{"ice": {"sdpMLineIndex": 0}}"#).await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(h.session.state(), &NegotiationState::SessionEstablished);
    }

    #[tokio::test]
    async fn incoming_video_joins_the_running_graph() {
        let mut h = Harness::new();
        h.establish().await;

        let event = EngineEvent::IncomingStream {
            stream: StreamId::new("src_0"),
            caps: Some(StreamCaps::new(MediaKind::Video, Some("VP8"))),
        };
        assert_eq!(h.engine(event.clone()).await, ControlFlow::Continue(()));
        let _ = h.engine(event).await;

        let graph = h.session.graph();
        for node in [
            "remote-decoder-src_0",
            "remote-video-transform-src_0",
            RELAY_SINK_NODE,
        ] {
            assert!(graph.contains(node), "{node} missing");
            assert!(graph.is_synced(node), "{node} not synced");
        }
        let expected = [
            MediaLink::new(
                PortRef::new(WEBRTC_NODE, "src_0"),
                PortRef::new("remote-decoder-src_0", "sink"),
            ),
            MediaLink::chain("remote-decoder-src_0", "remote-video-transform-src_0"),
            MediaLink::new(
                PortRef::new("remote-video-transform-src_0", "src"),
                PortRef::new(MIXER_NODE, MIXER_REMOTE_INPUT),
            ),
            MediaLink::new(
                PortRef::new(RELAY_TEE_NODE, RELAY_TEE_OUTPUT),
                PortRef::new(RELAY_SINK_NODE, "sink"),
            ),
        ];
        for link in &expected {
            assert!(graph.has_link(link), "missing {link}");
        }

        let engine = h.session.engine();
        assert_eq!(engine.links(), expected.to_vec());
        assert_eq!(
            engine.count(&Command::AddNode("remote-decoder-src_0".to_string())),
            1
        );
        assert_eq!(engine.count(&Command::Release(StreamId::new("src_0"))), 0);
    }

    #[tokio::test]
    async fn refused_stream_is_released_and_session_continues() {
        let mut h = Harness::new();
        h.establish().await;

        let flow = h
            .engine(EngineEvent::IncomingStream {
                stream: StreamId::new("src_0"),
                caps: Some(StreamCaps::new(MediaKind::Video, Some("H265"))),
            })
            .await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(
            h.session.engine().count(&Command::Release(StreamId::new("src_0"))),
            1
        );
        assert!(!h.session.graph().contains("remote-decoder-src_0"));
        assert_eq!(h.session.state(), &NegotiationState::SessionEstablished);
    }

    #[tokio::test]
    async fn engine_error_is_fatal_and_stops_pipeline() {
        let mut h = Harness::new();
        h.establish().await;

        let flow = h
            .engine(EngineEvent::Error {
                source: "sendrecv".to_string(),
                message: "ICE failed".to_string(),
            })
            .await;
        assert!(matches!(
            flow,
            ControlFlow::Break(SessionOutcome::Failed(Error::Engine(_)))
        ));
        assert_eq!(h.session.engine().count(&Command::Stop), 1);
        assert!(h.session.state().is_failed());
    }

    #[tokio::test]
    async fn end_of_stream_exits_cleanly() {
        let mut h = Harness::new();
        h.establish().await;

        let flow = h.engine(EngineEvent::EndOfStream).await;
        assert_eq!(flow, ControlFlow::Break(SessionOutcome::EndOfStream));
        assert_eq!(SessionOutcome::EndOfStream.exit_code(), 0);
        assert!(!h.session.graph().is_running());
    }

    #[tokio::test]
    async fn nothing_is_sent_after_failure() {
        let mut h = Harness::new();
        h.establish().await;
        let _ = h
            .session
            .handle_channel_event(ChannelEvent::Error("connection reset".to_string()))
            .await;
        h.drain();

        let _ = h
            .engine(EngineEvent::IceCandidate {
                mline_index: 0,
                candidate: "late".to_string(),
            })
            .await;
        let _ = h
            .engine(EngineEvent::OfferCreated {
                sdp: "v=0".to_string(),
            })
            .await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_timeout_fails_the_run() {
        let (tx, _sent) = mpsc::channel(64);
        let mut session =
            Session::new(&SessionConfig::new("4242"), RecordingEngine::default(), tx).unwrap();
        let (channel_tx, channel_rx) = mpsc::channel(8);
        let (_engine_tx, engine_rx) = mpsc::unbounded_channel();

        channel_tx.send(ChannelEvent::Open).await.unwrap();
        let outcome = session
            .run(channel_rx, engine_rx, std::future::pending())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Failed(Error::Timeout(TimeoutKind::Registration))
        );
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_within_deadline_keeps_running() {
        let (tx, _sent) = mpsc::channel(64);
        let mut session =
            Session::new(&SessionConfig::new("4242"), RecordingEngine::default(), tx).unwrap();
        let (channel_tx, channel_rx) = mpsc::channel(8);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(async move {
            channel_tx.send(ChannelEvent::Open).await.unwrap();
            channel_tx
                .send(ChannelEvent::Message("HELLO".to_string()))
                .await
                .unwrap();
            channel_tx
                .send(ChannelEvent::Message("SESSION_OK".to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            engine_tx
                .send(EngineEvent::OfferCreated {
                    sdp: "v=0".to_string(),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_secs(20)).await;
            channel_tx
                .send(ChannelEvent::Message(answer("v=0 answer")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            channel_tx
                .send(ChannelEvent::Close {
                    code: Some(1000),
                    reason: "bye".to_string(),
                })
                .await
                .unwrap();
            engine_tx
        });

        let outcome = session
            .run(channel_rx, engine_rx, std::future::pending())
            .await;
        let _engine_tx = driver.await.unwrap();

        assert_eq!(outcome, SessionOutcome::Closed);
        assert_eq!(session.state(), &NegotiationState::Connected);
        assert_eq!(session.engine().count(&Command::Stop), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_closes_the_session() {
        let (tx, _sent) = mpsc::channel(64);
        let mut session =
            Session::new(&SessionConfig::new("4242"), RecordingEngine::default(), tx).unwrap();
        let (_channel_tx, channel_rx) = mpsc::channel(8);
        let (_engine_tx, engine_rx) = mpsc::unbounded_channel();

        let outcome = session
            .run(channel_rx, engine_rx, std::future::ready(()))
            .await;
        assert_eq!(outcome, SessionOutcome::Closed);
    }
}
