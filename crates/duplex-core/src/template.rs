//! Statically declared startup graph and the node recipes used for incoming
//! streams.
//!
//! Local video: test source → clock overlay → compositor (`sink_0`) → convert →
//! relay tee. Tee `src_0` feeds the VP8 encoder into the webrtc endpoint; tee
//! `src_1` is reserved for the relay sink, which is only attached once remote
//! video arrives. Compositor `sink_1` is reserved for the remote video.

use duplex_common::{Error, Result};

use crate::config::GraphConfig;
use crate::engine::{MediaKind, StreamCaps};
use crate::graph::{Anchor, MediaGraph, MediaLink, NodeKind, NodeRegistry, NodeSpec, PortRef};

pub const WEBRTC_NODE: &str = "sendrecv";
pub const MIXER_NODE: &str = "mixer";
pub const RELAY_TEE_NODE: &str = "relay-tee";
pub const RELAY_SINK_NODE: &str = "relay-sink";

/// Compositor input reserved for the remote video.
pub const MIXER_REMOTE_INPUT: &str = "sink_1";
/// Tee output reserved for the relay branch.
pub const RELAY_TEE_OUTPUT: &str = "src_1";

const VIDEO_PAYLOAD_TYPE: u32 = 97;
const AUDIO_PAYLOAD_TYPE: u32 = 96;

#[derive(Debug, Clone)]
pub struct GraphTemplate {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<MediaLink>,
    /// Declared up front but instantiated on demand.
    pub deferred: Vec<NodeSpec>,
    pub registry: NodeRegistry,
}

impl GraphTemplate {
    /// The send/receive topology: test sources, compositor, relay tee and a
    /// webrtc endpoint.
    pub fn sendrecv(config: &GraphConfig) -> Self {
        let mut nodes = Vec::new();
        let mut links = Vec::new();

        nodes.push(
            NodeSpec::element(WEBRTC_NODE, NodeKind::WebRtc, "webrtcbin")
                .property("bundle-policy", "max-bundle")
                .property("stun-server", &config.stun_server)
                .inputs(&["sink_0", "sink_1"])
                .outputs(&[])
                .with_dynamic_outputs(),
        );

        // Local video.
        nodes.push(
            NodeSpec::element("video-source", NodeKind::Source, "videotestsrc")
                .property("is-live", true)
                .inputs(&[]),
        );
        nodes.push(
            NodeSpec::element("video-caps", NodeKind::Transform, "capsfilter").property(
                "caps",
                format!(
                    "video/x-raw,width={},height={}",
                    config.source_width, config.source_height
                ),
            ),
        );
        nodes.push(NodeSpec::element("clock", NodeKind::Transform, "clockoverlay"));
        nodes.push(
            NodeSpec::element(MIXER_NODE, NodeKind::Mixer, "compositor")
                .inputs(&["sink_0", MIXER_REMOTE_INPUT])
                .pad_property("sink_0", "alpha", 1)
                .pad_property(MIXER_REMOTE_INPUT, "alpha", 1)
                .pad_property(MIXER_REMOTE_INPUT, "xpos", 20)
                .pad_property(MIXER_REMOTE_INPUT, "ypos", 20),
        );
        nodes.push(NodeSpec::element("video-convert", NodeKind::Transform, "videoconvert"));
        nodes.push(
            NodeSpec::element(RELAY_TEE_NODE, NodeKind::Tee, "tee")
                .outputs(&["src_0", RELAY_TEE_OUTPUT]),
        );
        nodes.push(NodeSpec::element("video-queue", NodeKind::Transform, "queue"));
        nodes.push(
            NodeSpec::element("video-encoder", NodeKind::Transform, "vp8enc")
                .property("deadline", 1),
        );
        nodes.push(NodeSpec::element("video-payloader", NodeKind::Transform, "rtpvp8pay"));
        nodes.push(NodeSpec::element("video-rtp-queue", NodeKind::Transform, "queue"));
        nodes.push(
            NodeSpec::element("video-rtp-caps", NodeKind::Transform, "capsfilter").property(
                "caps",
                format!(
                    "application/x-rtp,media=video,encoding-name=VP8,payload={VIDEO_PAYLOAD_TYPE}"
                ),
            ),
        );

        links.push(MediaLink::chain("video-source", "video-caps"));
        links.push(MediaLink::chain("video-caps", "clock"));
        links.push(MediaLink::new(
            PortRef::new("clock", "src"),
            PortRef::new(MIXER_NODE, "sink_0"),
        ));
        links.push(MediaLink::chain(MIXER_NODE, "video-convert"));
        links.push(MediaLink::chain("video-convert", RELAY_TEE_NODE));
        links.push(MediaLink::new(
            PortRef::new(RELAY_TEE_NODE, "src_0"),
            PortRef::new("video-queue", "sink"),
        ));
        links.push(MediaLink::chain("video-queue", "video-encoder"));
        links.push(MediaLink::chain("video-encoder", "video-payloader"));
        links.push(MediaLink::chain("video-payloader", "video-rtp-queue"));
        links.push(MediaLink::chain("video-rtp-queue", "video-rtp-caps"));
        links.push(MediaLink::new(
            PortRef::new("video-rtp-caps", "src"),
            PortRef::new(WEBRTC_NODE, "sink_0"),
        ));

        // Local audio.
        nodes.push(
            NodeSpec::element("audio-source", NodeKind::Source, "audiotestsrc")
                .property("is-live", true)
                .inputs(&[]),
        );
        nodes.push(NodeSpec::element("audio-convert", NodeKind::Transform, "audioconvert"));
        nodes.push(NodeSpec::element("audio-resample", NodeKind::Transform, "audioresample"));
        nodes.push(NodeSpec::element("audio-queue", NodeKind::Transform, "queue"));
        nodes.push(NodeSpec::element("audio-encoder", NodeKind::Transform, "opusenc"));
        nodes.push(NodeSpec::element("audio-payloader", NodeKind::Transform, "rtpopuspay"));
        nodes.push(NodeSpec::element("audio-rtp-queue", NodeKind::Transform, "queue"));
        nodes.push(
            NodeSpec::element("audio-rtp-caps", NodeKind::Transform, "capsfilter").property(
                "caps",
                format!(
                    "application/x-rtp,media=audio,encoding-name=OPUS,payload={AUDIO_PAYLOAD_TYPE}"
                ),
            ),
        );

        links.push(MediaLink::chain("audio-source", "audio-convert"));
        links.push(MediaLink::chain("audio-convert", "audio-resample"));
        links.push(MediaLink::chain("audio-resample", "audio-queue"));
        links.push(MediaLink::chain("audio-queue", "audio-encoder"));
        links.push(MediaLink::chain("audio-encoder", "audio-payloader"));
        links.push(MediaLink::chain("audio-payloader", "audio-rtp-queue"));
        links.push(MediaLink::chain("audio-rtp-queue", "audio-rtp-caps"));
        links.push(MediaLink::new(
            PortRef::new("audio-rtp-caps", "src"),
            PortRef::new(WEBRTC_NODE, "sink_1"),
        ));

        let deferred = vec![relay_sink_node(config.relay_uri.as_deref())];

        let mut registry = NodeRegistry::default();
        registry.register(Anchor::WebRtc, WEBRTC_NODE);
        registry.register(Anchor::Mixer, MIXER_NODE);
        registry.register(Anchor::RelayTee, RELAY_TEE_NODE);
        registry.register(Anchor::RelaySink, RELAY_SINK_NODE);

        Self {
            nodes,
            links,
            deferred,
            registry,
        }
    }

    /// Build the model of the startup graph; deferred nodes are not included.
    pub fn instantiate_model(&self) -> Result<MediaGraph> {
        let mut graph = MediaGraph::new();
        for node in &self.nodes {
            graph.insert_node(node.clone())?;
        }
        for link in &self.links {
            graph.insert_link(link.clone())?;
        }
        Ok(graph)
    }

    pub fn deferred_node(&self, name: &str) -> Option<&NodeSpec> {
        self.deferred.iter().find(|node| node.name == name)
    }
}

/// RTMP publisher when a target is configured, a discard sink otherwise.
fn relay_sink_node(relay_uri: Option<&str>) -> NodeSpec {
    let description = match relay_uri {
        Some(uri) => format!(
            "queue ! x264enc ! flvmux name=muxer ! rtmpsink location=\"{} live=1\"",
            uri.replace('"', "")
        ),
        None => "queue ! fakesink sync=false".to_string(),
    };
    NodeSpec::chain(RELAY_SINK_NODE, NodeKind::Sink, description).outputs(&[])
}

/// Depayloader + decoder for an incoming RTP stream.
pub fn decoder_node(name: &str, caps: &StreamCaps) -> Result<NodeSpec> {
    let encoding = caps.encoding_name.as_deref().ok_or_else(|| {
        Error::precondition(format!("{} stream has no encoding name", caps.media))
    })?;
    let description = match (caps.media, encoding) {
        (MediaKind::Video, "VP8") => "queue ! rtpvp8depay ! vp8dec",
        (MediaKind::Video, "VP9") => "queue ! rtpvp9depay ! vp9dec",
        (MediaKind::Video, "H264") => "queue ! rtph264depay ! h264parse ! avdec_h264",
        (MediaKind::Audio, "OPUS") => "queue ! rtpopusdepay ! opusdec",
        (media, other) => {
            return Err(Error::precondition(format!(
                "no decoder for {media} encoding {other}"
            )))
        }
    };
    Ok(NodeSpec::chain(name, NodeKind::Decoder, description))
}

/// Convert and scale decoded video to the compositor's remote input size.
pub fn video_transform_node(name: &str, width: u32, height: u32) -> NodeSpec {
    NodeSpec::chain(
        name,
        NodeKind::Transform,
        format!("queue ! videoconvert ! videoscale ! video/x-raw,width={width},height={height} ! queue"),
    )
}

pub fn audio_convert_node(name: &str) -> NodeSpec {
    NodeSpec::chain(name, NodeKind::Transform, "audioconvert ! audioresample")
}

/// Drains a stream nobody renders.
pub fn discard_sink_node(name: &str) -> NodeSpec {
    NodeSpec::element(name, NodeKind::Sink, "fakesink")
        .property("sync", false)
        .outputs(&[])
}
