//! Routing of incoming streams into the media graph.

use std::collections::HashMap;

use duplex_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::engine::{MediaEngine, MediaKind, StreamCaps, StreamId};
use crate::graph::{Anchor, MediaGraph, MediaLink, NodeSpec, PortRef};
use crate::template::{
    audio_convert_node, decoder_node, discard_sink_node, video_transform_node, GraphTemplate,
    MIXER_REMOTE_INPUT, RELAY_TEE_OUTPUT,
};

/// One incoming stream seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub id: StreamId,
    pub media_kind: MediaKind,
    attached: bool,
}

impl MediaStreamHandle {
    fn new(id: StreamId, media_kind: MediaKind) -> Self {
        Self {
            id,
            media_kind,
            attached: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(MediaKind),
    /// Stream id was already handled; nothing was built.
    Duplicate,
    /// Media kind is not routed anywhere.
    Ignored,
}

/// Owns the graph model and builds exactly one subgraph per incoming stream.
#[derive(Debug)]
pub struct MediaGraphController {
    graph: MediaGraph,
    template: GraphTemplate,
    config: GraphConfig,
    streams: HashMap<StreamId, MediaStreamHandle>,
    /// Nodes added by the attach in progress, oldest first.
    added: Vec<String>,
}

impl MediaGraphController {
    pub fn new(template: GraphTemplate, config: GraphConfig) -> Result<Self> {
        let graph = template.instantiate_model()?;
        Ok(Self {
            graph,
            template,
            config,
            streams: HashMap::new(),
            added: Vec::new(),
        })
    }

    pub fn graph(&self) -> &MediaGraph {
        &self.graph
    }

    pub fn stream(&self, id: &StreamId) -> Option<&MediaStreamHandle> {
        self.streams.get(id)
    }

    pub fn set_running(&mut self, running: bool) {
        self.graph.set_running(running);
    }

    /// Route a new incoming stream.
    ///
    /// Every exit other than `Attached` releases the stream back to the engine.
    /// A failed attach also removes whatever nodes it had already added.
    pub fn on_incoming_stream(
        &mut self,
        engine: &mut dyn MediaEngine,
        stream: StreamId,
        caps: Option<StreamCaps>,
    ) -> Result<AttachOutcome> {
        if self.streams.contains_key(&stream) {
            debug!("stream {} already handled, ignoring repeat arrival", stream);
            return Ok(AttachOutcome::Duplicate);
        }

        let kind = caps.as_ref().map_or(MediaKind::Unknown, |caps| caps.media);
        self.streams
            .insert(stream.clone(), MediaStreamHandle::new(stream.clone(), kind));

        if !self.graph.is_running() {
            self.release(engine, &stream);
            return Err(Error::precondition(format!(
                "stream {stream} arrived while the pipeline is stopped"
            )));
        }
        let Some(caps) = caps else {
            warn!("stream {} has no negotiated caps, skipping", stream);
            self.release(engine, &stream);
            return Err(Error::precondition(format!(
                "stream {stream} has no negotiated format"
            )));
        };

        self.added.clear();
        let attached = match caps.media {
            MediaKind::Video => {
                info!("incoming video stream {}", stream);
                self.attach_video(engine, &stream, &caps)
            }
            MediaKind::Audio => {
                info!("incoming audio stream {}", stream);
                self.attach_audio(engine, &stream, &caps)
            }
            MediaKind::Unknown => {
                info!("ignoring stream {} of unknown media kind", stream);
                self.release(engine, &stream);
                return Ok(AttachOutcome::Ignored);
            }
        };

        if let Err(e) = attached {
            self.roll_back(engine);
            self.release(engine, &stream);
            return Err(e);
        }
        self.added.clear();
        if let Some(handle) = self.streams.get_mut(&stream) {
            handle.attached = true;
        }
        Ok(AttachOutcome::Attached(kind))
    }

    fn attach_video(
        &mut self,
        engine: &mut dyn MediaEngine,
        stream: &StreamId,
        caps: &StreamCaps,
    ) -> Result<()> {
        let registry = &self.template.registry;
        let webrtc = registry.resolve(Anchor::WebRtc)?.to_string();
        let mixer_input = PortRef::new(registry.resolve(Anchor::Mixer)?, MIXER_REMOTE_INPUT);
        if self.graph.port_in_use(&mixer_input) {
            return Err(Error::precondition(format!(
                "{mixer_input} already carries a remote stream, not routing {stream}"
            )));
        }

        let decoder = decoder_node(&format!("remote-decoder-{stream}"), caps)?;
        let decoder_name = decoder.name.clone();
        let transform = video_transform_node(
            &format!("remote-video-transform-{stream}"),
            self.config.remote_width,
            self.config.remote_height,
        );
        let transform_name = transform.name.clone();

        self.add_active(engine, decoder)?;
        self.link(
            engine,
            MediaLink::new(
                PortRef::new(webrtc, stream.as_str()),
                PortRef::new(&decoder_name, "sink"),
            ),
        )?;
        self.add_active(engine, transform)?;
        self.link(engine, MediaLink::chain(&decoder_name, &transform_name))?;
        self.link(
            engine,
            MediaLink::new(PortRef::new(&transform_name, "src"), mixer_input),
        )?;

        self.attach_relay(engine)
    }

    /// Feed the relay tee's spare output into the relay sink, once.
    fn attach_relay(&mut self, engine: &mut dyn MediaEngine) -> Result<()> {
        let registry = &self.template.registry;
        let tee = registry.resolve(Anchor::RelayTee)?.to_string();
        let sink = registry.resolve(Anchor::RelaySink)?.to_string();

        if !self.graph.contains(&sink) {
            let spec = self
                .template
                .deferred_node(&sink)
                .cloned()
                .ok_or_else(|| Error::graph(format!("template declares no {sink} node")))?;
            self.add_active(engine, spec)?;
        }

        let link = MediaLink::new(
            PortRef::new(tee, RELAY_TEE_OUTPUT),
            PortRef::new(sink, "sink"),
        );
        if !self.graph.has_link(&link) {
            self.link(engine, link)?;
        }
        Ok(())
    }

    fn attach_audio(
        &mut self,
        engine: &mut dyn MediaEngine,
        stream: &StreamId,
        caps: &StreamCaps,
    ) -> Result<()> {
        let webrtc = self.template.registry.resolve(Anchor::WebRtc)?.to_string();

        let decoder = decoder_node(&format!("remote-decoder-{stream}"), caps)?;
        let decoder_name = decoder.name.clone();
        let convert = audio_convert_node(&format!("remote-audio-convert-{stream}"));
        let convert_name = convert.name.clone();
        let sink = discard_sink_node(&format!("remote-audio-sink-{stream}"));
        let sink_name = sink.name.clone();

        self.add_active(engine, decoder)?;
        self.link(
            engine,
            MediaLink::new(
                PortRef::new(webrtc, stream.as_str()),
                PortRef::new(&decoder_name, "sink"),
            ),
        )?;
        self.add_active(engine, convert)?;
        self.link(engine, MediaLink::chain(&decoder_name, &convert_name))?;
        self.add_active(engine, sink)?;
        self.link(engine, MediaLink::chain(&convert_name, &sink_name))
    }

    /// Add a node and bring it to the graph's state before anything links into it.
    fn add_active(&mut self, engine: &mut dyn MediaEngine, spec: NodeSpec) -> Result<()> {
        self.graph.check_add(&spec)?;
        engine.add_node(&spec)?;
        let name = spec.name.clone();
        self.graph.commit_add(spec, true);
        self.added.push(name.clone());

        self.graph.check_sync(&name)?;
        engine.sync_node_state(&name)?;
        self.graph.commit_sync(&name);
        debug!("added node {}", name);
        Ok(())
    }

    fn link(&mut self, engine: &mut dyn MediaEngine, link: MediaLink) -> Result<()> {
        self.graph.check_link(&link)?;
        engine.link(&link)?;
        debug!("linked {}", link);
        self.graph.commit_link(link);
        Ok(())
    }

    /// Remove the nodes of a failed attach, newest first.
    fn roll_back(&mut self, engine: &mut dyn MediaEngine) {
        while let Some(name) = self.added.pop() {
            if let Err(e) = engine.remove_node(&name) {
                warn!("failed to remove {}: {}", name, e);
            }
            if let Err(e) = self.graph.remove_node(&name) {
                warn!("model out of step removing {}: {}", name, e);
            }
            debug!("rolled back node {}", name);
        }
    }

    fn release(&self, engine: &mut dyn MediaEngine, stream: &StreamId) {
        if let Err(e) = engine.release_stream(stream) {
            warn!("failed to release stream {}: {}", stream, e);
        }
    }
}
