use std::collections::BTreeSet;

use duplex_common::{Error, Result};
use duplex_core::{
    EngineEvent, GraphTemplate, MediaEngine, MediaKind, MediaLink, NodeSpec, StreamCaps, StreamId,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Engine that never touches real media.
///
/// Starting emits `NegotiationNeeded`, offers are a fixed two-section SDP, and
/// applying an answer announces one incoming stream per media section.
pub struct DummyEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    nodes: BTreeSet<String>,
    running: bool,
}

const OFFER_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=duplex\r\n\
t=0 0\r\n\
a=group:BUNDLE video0 audio1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 97\r\n\
a=mid:video0\r\n\
a=sendrecv\r\n\
a=rtpmap:97 VP8/90000\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:audio1\r\n\
a=sendrecv\r\n\
a=rtpmap:96 OPUS/48000/2\r\n";

impl DummyEngine {
    pub fn new(template: &GraphTemplate, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            events,
            nodes: template.nodes.iter().map(|node| node.name.clone()).collect(),
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("engine event dropped, session is gone");
        }
    }

    fn require_node(&self, name: &str) -> Result<()> {
        if self.nodes.contains(name) {
            Ok(())
        } else {
            Err(Error::engine(format!("no element named {name}")))
        }
    }
}

/// Media sections of an SDP as (kind, encoding name) in m-line order.
fn media_sections(sdp: &str) -> Vec<(MediaKind, Option<String>)> {
    let mut sections: Vec<(MediaKind, Option<String>)> = Vec::new();
    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            let kind = match media.split_whitespace().next() {
                Some("video") => MediaKind::Video,
                Some("audio") => MediaKind::Audio,
                _ => MediaKind::Unknown,
            };
            sections.push((kind, None));
        } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            if let Some((_, encoding)) = sections.last_mut().filter(|(_, enc)| enc.is_none()) {
                *encoding = rtpmap
                    .split_whitespace()
                    .nth(1)
                    .and_then(|codec| codec.split('/').next())
                    .map(str::to_string);
            }
        }
    }
    sections
}

impl MediaEngine for DummyEngine {
    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        self.emit(EngineEvent::StateChanged {
            from: "Null".to_string(),
            to: "Playing".to_string(),
        });
        self.emit(EngineEvent::NegotiationNeeded);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.emit(EngineEvent::StateChanged {
                from: "Playing".to_string(),
                to: "Null".to_string(),
            });
        }
        Ok(())
    }

    fn create_offer(&mut self) -> Result<()> {
        self.emit(EngineEvent::OfferCreated {
            sdp: OFFER_SDP.to_string(),
        });
        Ok(())
    }

    fn set_local_description(&mut self, sdp: &str) -> Result<()> {
        for (index, _) in media_sections(sdp).iter().enumerate() {
            self.emit(EngineEvent::IceCandidate {
                mline_index: index as u32,
                candidate: format!("candidate:{index} 1 UDP 2122252543 127.0.0.1 9 typ host"),
            });
        }
        Ok(())
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        let sections = media_sections(sdp);
        if sections.is_empty() {
            return Err(Error::engine("remote description has no media sections"));
        }
        for (index, (kind, encoding)) in sections.into_iter().enumerate() {
            self.emit(EngineEvent::IncomingStream {
                stream: StreamId::new(format!("src_{index}")),
                caps: Some(StreamCaps::new(kind, encoding.as_deref())),
            });
        }
        Ok(())
    }

    fn add_ice_candidate(&mut self, mline_index: u32, candidate: &str) -> Result<()> {
        debug!("remote candidate for m-line {}: {}", mline_index, candidate);
        Ok(())
    }

    fn add_node(&mut self, node: &NodeSpec) -> Result<()> {
        if !self.nodes.insert(node.name.clone()) {
            return Err(Error::engine(format!("element {} already exists", node.name)));
        }
        Ok(())
    }

    fn sync_node_state(&mut self, node: &str) -> Result<()> {
        self.require_node(node)
    }

    fn link(&mut self, link: &MediaLink) -> Result<()> {
        self.require_node(&link.from.node)?;
        self.require_node(&link.to.node)
    }

    fn remove_node(&mut self, node: &str) -> Result<()> {
        if !self.nodes.remove(node) {
            return Err(Error::engine(format!("no element named {node}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::GraphConfig;

    fn engine() -> (DummyEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let template = GraphTemplate::sendrecv(&GraphConfig::default());
        (DummyEngine::new(&template, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn start_requests_negotiation_once() {
        let (mut engine, mut rx) = engine();
        engine.start().unwrap();
        engine.start().unwrap();

        let needed = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == EngineEvent::NegotiationNeeded)
            .count();
        assert_eq!(needed, 1);
        assert!(engine.is_running());
    }

    #[test]
    fn offer_has_video_then_audio() {
        let sections = media_sections(OFFER_SDP);
        assert_eq!(
            sections,
            vec![
                (MediaKind::Video, Some("VP8".to_string())),
                (MediaKind::Audio, Some("OPUS".to_string())),
            ]
        );
    }

    #[test]
    fn answer_announces_incoming_streams() {
        let (mut engine, mut rx) = engine();
        engine.set_remote_description(OFFER_SDP).unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            EngineEvent::IncomingStream {
                stream: StreamId::new("src_0"),
                caps: Some(StreamCaps::new(MediaKind::Video, Some("VP8"))),
            }
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn rejects_links_to_unknown_elements() {
        let (mut engine, _rx) = engine();
        let err = engine
            .link(&MediaLink::chain("nowhere", "mixer"))
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[test]
    fn removed_nodes_can_be_added_again() {
        let (mut engine, _rx) = engine();
        let node = NodeSpec::element("late", duplex_core::NodeKind::Sink, "fakesink");
        engine.add_node(&node).unwrap();
        engine.remove_node("late").unwrap();
        assert!(engine.sync_node_state("late").is_err());
        engine.add_node(&node).unwrap();
        assert!(engine.remove_node("nowhere").is_err());
    }

    #[test]
    fn stop_is_quiet_when_not_running() {
        let (mut engine, mut rx) = engine();
        engine.stop().unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
