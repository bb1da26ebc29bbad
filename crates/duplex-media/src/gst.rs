//! GStreamer backend built around `webrtcbin`.
//!
//! Signal handlers and the bus watcher run on GStreamer threads; they only push
//! [`EngineEvent`]s onto the session queue. All mutations go through the
//! [`MediaEngine`] methods, called from the session task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use duplex_common::{Error, Result};
use duplex_core::{
    Anchor, EngineEvent, GraphTemplate, MediaEngine, MediaLink, NodeFactory, NodeSpec, StreamCaps,
    StreamId,
};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_sdp as gst_sdp;
use gstreamer_webrtc as gst_webrtc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type Events = mpsc::UnboundedSender<EngineEvent>;

/// Incoming pads held back until the session decides where they go.
type BlockedPads = Arc<Mutex<HashMap<String, (gst::Pad, gst::PadProbeId)>>>;

fn element_available(name: &str) -> bool {
    gst::ElementFactory::find(name).is_some()
}

fn engine_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::engine(format!("{context}: {e}"))
}

fn emit(events: &Events, event: EngineEvent) {
    if events.send(event).is_err() {
        debug!("engine event dropped, session is gone");
    }
}

pub struct GstEngine {
    pipeline: gst::Pipeline,
    webrtc: gst::Element,
    webrtc_name: String,
    events: Events,
    blocked: BlockedPads,
    shutdown: Arc<AtomicBool>,
    bus_watch: Option<JoinHandle<()>>,
}

impl GstEngine {
    /// Build the startup graph of `template` into a new pipeline. The pipeline
    /// stays in `Null` until [`MediaEngine::start`].
    pub fn new(template: &GraphTemplate, events: Events) -> Result<Self> {
        gst::init().map_err(|e| engine_err("failed to initialize GStreamer", e))?;

        let mut missing: Vec<&str> = template
            .nodes
            .iter()
            .filter_map(|node| match &node.factory {
                NodeFactory::Element { factory, .. } if !element_available(factory) => {
                    Some(factory.as_str())
                }
                _ => None,
            })
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            return Err(Error::engine(format!(
                "missing GStreamer elements: {}",
                missing.join(", ")
            )));
        }

        let pipeline = gst::Pipeline::with_name("duplex");
        for node in &template.nodes {
            let element = build_node(node)?;
            pipeline
                .add(&element)
                .map_err(|e| engine_err(&format!("failed to add {}", node.name), e))?;
            apply_pad_properties(&element, node)?;
        }
        for link in &template.links {
            link_in(&pipeline, link)?;
        }

        let webrtc_name = template.registry.resolve(Anchor::WebRtc)?.to_string();
        let webrtc = pipeline
            .by_name(&webrtc_name)
            .ok_or_else(|| Error::engine(format!("pipeline has no {webrtc_name} element")))?;

        let blocked: BlockedPads = Arc::new(Mutex::new(HashMap::new()));
        connect_signals(&webrtc, &events, &blocked);

        let shutdown = Arc::new(AtomicBool::new(false));
        let bus_watch = spawn_bus_watch(&pipeline, events.clone(), shutdown.clone())?;

        info!("pipeline built with {} elements", template.nodes.len());
        Ok(Self {
            pipeline,
            webrtc,
            webrtc_name,
            events,
            blocked,
            shutdown,
            bus_watch: Some(bus_watch),
        })
    }

    fn element(&self, name: &str) -> Result<gst::Element> {
        self.pipeline
            .by_name(name)
            .ok_or_else(|| Error::engine(format!("no element named {name}")))
    }

    fn unblock(&self, pad_name: &str) {
        let entry = match self.blocked.lock() {
            Ok(mut blocked) => blocked.remove(pad_name),
            Err(_) => None,
        };
        if let Some((pad, probe)) = entry {
            pad.remove_probe(probe);
            debug!("released block on {}", pad_name);
        }
    }

    fn set_description(
        &self,
        signal: &str,
        kind: gst_webrtc::WebRTCSDPType,
        sdp: &str,
    ) -> Result<()> {
        let message = gst_sdp::SDPMessage::parse_buffer(sdp.as_bytes())
            .map_err(|e| Error::engine(format!("unparseable SDP: {e}")))?;
        let description = gst_webrtc::WebRTCSessionDescription::new(kind, message);
        self.webrtc
            .emit_by_name::<()>(signal, &[&description, &None::<gst::Promise>]);
        Ok(())
    }
}

fn build_node(spec: &NodeSpec) -> Result<gst::Element> {
    match &spec.factory {
        NodeFactory::Element {
            factory,
            properties,
        } => {
            let element = gst::ElementFactory::make(factory)
                .name(spec.name.as_str())
                .build()
                .map_err(|e| engine_err(&format!("failed to create {factory}"), e))?;
            for (key, value) in properties {
                element.set_property_from_str(key, value);
            }
            Ok(element)
        }
        NodeFactory::Chain(description) => {
            let bin = gst::parse::bin_from_description(description, true)
                .map_err(|e| engine_err(&format!("failed to parse {description:?}"), e))?;
            bin.set_property("name", spec.name.as_str());
            Ok(bin.upcast())
        }
    }
}

fn apply_pad_properties(element: &gst::Element, spec: &NodeSpec) -> Result<()> {
    for prop in &spec.pad_properties {
        let pad = element
            .static_pad(&prop.port)
            .or_else(|| element.request_pad_simple(&prop.port))
            .ok_or_else(|| Error::engine(format!("{} has no pad {}", spec.name, prop.port)))?;
        pad.set_property_from_str(&prop.key, &prop.value);
    }
    Ok(())
}

fn link_in(pipeline: &gst::Pipeline, link: &MediaLink) -> Result<()> {
    let lookup = |name: &str| {
        pipeline
            .by_name(name)
            .ok_or_else(|| Error::engine(format!("no element named {name}")))
    };
    let from = lookup(&link.from.node)?;
    let to = lookup(&link.to.node)?;
    from.link_pads(Some(&link.from.port), &to, Some(&link.to.port))
        .map_err(|e| engine_err(&format!("failed to link {link}"), e))
}

fn connect_signals(webrtc: &gst::Element, events: &Events, blocked: &BlockedPads) {
    let tx = events.clone();
    webrtc.connect("on-negotiation-needed", false, move |_| {
        emit(&tx, EngineEvent::NegotiationNeeded);
        None
    });

    let tx = events.clone();
    webrtc.connect("on-ice-candidate", false, move |values| {
        let mline_index = values.get(1)?.get::<u32>().ok()?;
        let candidate = values.get(2)?.get::<String>().ok()?;
        emit(
            &tx,
            EngineEvent::IceCandidate {
                mline_index,
                candidate,
            },
        );
        None
    });

    let tx = events.clone();
    let blocked = blocked.clone();
    webrtc.connect_pad_added(move |_, pad| {
        if pad.direction() != gst::PadDirection::Src {
            return;
        }
        let name = pad.name().to_string();
        let caps = pad.current_caps().and_then(|caps| {
            caps.structure(0).map(|s| {
                StreamCaps::from_structure(
                    s.name().as_str(),
                    s.get::<&str>("media").ok(),
                    s.get::<&str>("encoding-name").ok(),
                )
            })
        });

        // Hold data back until the session has linked or released the pad.
        if let Some(probe) = pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| {
            gst::PadProbeReturn::Ok
        }) {
            if let Ok(mut blocked) = blocked.lock() {
                blocked.insert(name.clone(), (pad.clone(), probe));
            }
        }

        emit(
            &tx,
            EngineEvent::IncomingStream {
                stream: StreamId::new(name),
                caps,
            },
        );
    });
}

fn spawn_bus_watch(
    pipeline: &gst::Pipeline,
    events: Events,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| Error::engine("failed to get pipeline bus"))?;
    let pipeline_obj = pipeline.clone().upcast::<gst::Object>();

    std::thread::Builder::new()
        .name("duplex-bus".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let Some(msg) = bus.timed_pop_filtered(
                    gst::ClockTime::from_mseconds(100),
                    &[
                        gst::MessageType::Eos,
                        gst::MessageType::Error,
                        gst::MessageType::StateChanged,
                    ],
                ) else {
                    continue;
                };

                match msg.view() {
                    gst::MessageView::Eos(_) => emit(&events, EngineEvent::EndOfStream),
                    gst::MessageView::Error(err) => {
                        let source = msg
                            .src()
                            .map(|s| s.path_string().to_string())
                            .unwrap_or_else(|| "pipeline".to_string());
                        emit(
                            &events,
                            EngineEvent::Error {
                                source,
                                message: format!(
                                    "{} ({})",
                                    err.error(),
                                    err.debug().unwrap_or_default()
                                ),
                            },
                        );
                    }
                    gst::MessageView::StateChanged(sc)
                        if msg.src().is_some_and(|s| s == &pipeline_obj) =>
                    {
                        emit(
                            &events,
                            EngineEvent::StateChanged {
                                from: format!("{:?}", sc.old()),
                                to: format!("{:?}", sc.current()),
                            },
                        );
                    }
                    _ => {}
                }
            }
        })
        .map_err(|e| engine_err("failed to spawn bus watcher", e))
}

impl MediaEngine for GstEngine {
    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| engine_err("failed to start pipeline", e))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| engine_err("failed to stop pipeline", e))?;
        Ok(())
    }

    fn create_offer(&mut self) -> Result<()> {
        let tx = self.events.clone();
        let promise = gst::Promise::with_change_func(move |reply| {
            let offer = match reply {
                Ok(Some(reply)) => reply
                    .value("offer")
                    .map_err(|e| e.to_string())
                    .and_then(|v| {
                        v.get::<gst_webrtc::WebRTCSessionDescription>()
                            .map_err(|e| e.to_string())
                    })
                    .and_then(|offer| offer.sdp().as_text().map_err(|e| e.to_string())),
                Ok(None) => Err("offer promise replied with nothing".to_string()),
                Err(e) => Err(format!("offer promise failed: {e:?}")),
            };
            match offer {
                Ok(sdp) => emit(&tx, EngineEvent::OfferCreated { sdp }),
                Err(message) => {
                    error!("could not create offer: {}", message);
                    emit(
                        &tx,
                        EngineEvent::Error {
                            source: "create-offer".to_string(),
                            message,
                        },
                    );
                }
            }
        });
        self.webrtc
            .emit_by_name::<()>("create-offer", &[&None::<gst::Structure>, &promise]);
        Ok(())
    }

    fn set_local_description(&mut self, sdp: &str) -> Result<()> {
        self.set_description(
            "set-local-description",
            gst_webrtc::WebRTCSDPType::Offer,
            sdp,
        )
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        self.set_description(
            "set-remote-description",
            gst_webrtc::WebRTCSDPType::Answer,
            sdp,
        )
    }

    fn add_ice_candidate(&mut self, mline_index: u32, candidate: &str) -> Result<()> {
        self.webrtc
            .emit_by_name::<()>("add-ice-candidate", &[&mline_index, &candidate]);
        Ok(())
    }

    fn add_node(&mut self, node: &NodeSpec) -> Result<()> {
        let element = build_node(node)?;
        self.pipeline
            .add(&element)
            .map_err(|e| engine_err(&format!("failed to add {}", node.name), e))?;
        apply_pad_properties(&element, node)
    }

    fn sync_node_state(&mut self, node: &str) -> Result<()> {
        self.element(node)?
            .sync_state_with_parent()
            .map_err(|e| engine_err(&format!("failed to sync {node}"), e))
    }

    fn link(&mut self, link: &MediaLink) -> Result<()> {
        link_in(&self.pipeline, link)?;
        if link.from.node == self.webrtc_name {
            self.unblock(&link.from.port);
        }
        Ok(())
    }

    fn remove_node(&mut self, node: &str) -> Result<()> {
        let element = self.element(node)?;
        element
            .set_state(gst::State::Null)
            .map_err(|e| engine_err(&format!("failed to stop {node}"), e))?;
        self.pipeline
            .remove(&element)
            .map_err(|e| engine_err(&format!("failed to remove {node}"), e))
    }

    fn release_stream(&mut self, stream: &StreamId) -> Result<()> {
        let sink = gst::ElementFactory::make("fakesink")
            .name(format!("released-{stream}"))
            .property("sync", false)
            .build()
            .map_err(|e| engine_err("failed to create fakesink", e))?;
        self.pipeline
            .add(&sink)
            .map_err(|e| engine_err("failed to add fakesink", e))?;
        sink.sync_state_with_parent()
            .map_err(|e| engine_err("failed to sync fakesink", e))?;
        self.webrtc
            .link_pads(Some(stream.as_str()), &sink, Some("sink"))
            .map_err(|e| engine_err(&format!("failed to drain {stream}"), e))?;
        self.unblock(stream.as_str());
        warn!("stream {} drained without rendering", stream);
        Ok(())
    }
}

impl Drop for GstEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.pipeline.set_state(gst::State::Null);
        if let Some(handle) = self.bus_watch.take() {
            let _ = handle.join();
        }
    }
}
