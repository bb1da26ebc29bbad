//! In-memory model of the media processing graph.
//!
//! The model mirrors what has been instantiated in the engine. Every mutation is
//! checked here first, applied to the engine second and committed last, so a
//! failed engine command leaves the model untouched.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use duplex_common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Source,
    Transform,
    Mixer,
    Tee,
    Sink,
    Decoder,
    WebRtc,
}

/// How the engine builds a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFactory {
    /// A single engine element with string-typed properties.
    Element {
        factory: String,
        properties: Vec<(String, String)>,
    },
    /// A chain of elements in the engine's launch syntax, exposed through one
    /// `sink` and/or one `src` port.
    Chain(String),
}

/// Property set on one of a node's ports (e.g. a compositor input position).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadProperty {
    pub port: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub factory: NodeFactory,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Output ports appear at runtime (the webrtc endpoint's stream pads).
    pub dynamic_outputs: bool,
    pub pad_properties: Vec<PadProperty>,
}

impl NodeSpec {
    /// Single element with one `sink` and one `src` port.
    pub fn element(name: impl Into<String>, kind: NodeKind, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            factory: NodeFactory::Element {
                factory: factory.into(),
                properties: Vec::new(),
            },
            inputs: vec!["sink".to_string()],
            outputs: vec!["src".to_string()],
            dynamic_outputs: false,
            pad_properties: Vec::new(),
        }
    }

    /// Element chain with one `sink` and one `src` port.
    pub fn chain(name: impl Into<String>, kind: NodeKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            factory: NodeFactory::Chain(description.into()),
            inputs: vec!["sink".to_string()],
            outputs: vec!["src".to_string()],
            dynamic_outputs: false,
            pad_properties: Vec::new(),
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        if let NodeFactory::Element { properties, .. } = &mut self.factory {
            properties.push((key.into(), value.to_string()));
        }
        self
    }

    pub fn pad_property(
        mut self,
        port: impl Into<String>,
        key: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.pad_properties.push(PadProperty {
            port: port.into(),
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn inputs(mut self, ports: &[&str]) -> Self {
        self.inputs = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn outputs(mut self, ports: &[&str]) -> Self {
        self.outputs = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_dynamic_outputs(mut self) -> Self {
        self.dynamic_outputs = true;
        self
    }

    fn has_input(&self, port: &str) -> bool {
        self.inputs.iter().any(|p| p == port)
    }

    fn has_output(&self, port: &str) -> bool {
        self.dynamic_outputs || self.outputs.iter().any(|p| p == port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Directed edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaLink {
    pub from: PortRef,
    pub to: PortRef,
}

impl MediaLink {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self { from, to }
    }

    /// Link `src` of one node to `sink` of the next.
    pub fn chain(from_node: &str, to_node: &str) -> Self {
        Self::new(PortRef::new(from_node, "src"), PortRef::new(to_node, "sink"))
    }
}

impl fmt::Display for MediaLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Roles the incoming-stream paths attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    WebRtc,
    Mixer,
    RelayTee,
    RelaySink,
}

/// Maps anchor roles to the node names chosen by the template.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    names: HashMap<Anchor, String>,
}

impl NodeRegistry {
    pub fn register(&mut self, anchor: Anchor, node: impl Into<String>) {
        self.names.insert(anchor, node.into());
    }

    pub fn resolve(&self, anchor: Anchor) -> Result<&str> {
        self.names
            .get(&anchor)
            .map(String::as_str)
            .ok_or_else(|| Error::graph(format!("no node registered for {anchor:?}")))
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    spec: NodeSpec,
    /// Added after startup instantiation.
    runtime: bool,
    synced: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MediaGraph {
    nodes: BTreeMap<String, NodeEntry>,
    links: Vec<MediaLink>,
    running: bool,
}

impl MediaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn links(&self) -> &[MediaLink] {
        &self.links
    }

    pub fn has_link(&self, link: &MediaLink) -> bool {
        self.links.contains(link)
    }

    pub fn is_synced(&self, name: &str) -> bool {
        self.nodes.get(name).is_some_and(|entry| entry.synced)
    }

    pub fn port_in_use(&self, port: &PortRef) -> bool {
        self.links
            .iter()
            .any(|link| &link.from == port || &link.to == port)
    }

    pub fn check_add(&self, spec: &NodeSpec) -> Result<()> {
        if self.nodes.contains_key(&spec.name) {
            return Err(Error::graph(format!("node {} already exists", spec.name)));
        }
        Ok(())
    }

    pub fn commit_add(&mut self, spec: NodeSpec, runtime: bool) {
        self.nodes.insert(
            spec.name.clone(),
            NodeEntry {
                spec,
                runtime,
                synced: !runtime,
            },
        );
    }

    pub fn check_sync(&self, name: &str) -> Result<()> {
        if !self.nodes.contains_key(name) {
            return Err(Error::graph(format!("cannot sync unknown node {name}")));
        }
        Ok(())
    }

    pub fn commit_sync(&mut self, name: &str) {
        if let Some(entry) = self.nodes.get_mut(name) {
            entry.synced = true;
        }
    }

    pub fn check_link(&self, link: &MediaLink) -> Result<()> {
        let from = self
            .nodes
            .get(&link.from.node)
            .ok_or_else(|| Error::graph(format!("link {link}: unknown node {}", link.from.node)))?;
        let to = self
            .nodes
            .get(&link.to.node)
            .ok_or_else(|| Error::graph(format!("link {link}: unknown node {}", link.to.node)))?;

        if link.from.node == link.to.node {
            return Err(Error::graph(format!("link {link}: node linked to itself")));
        }
        if !from.spec.has_output(&link.from.port) {
            return Err(Error::graph(format!("link {link}: no output port {}", link.from)));
        }
        if !to.spec.has_input(&link.to.port) {
            return Err(Error::graph(format!("link {link}: no input port {}", link.to)));
        }
        if self.port_in_use(&link.from) {
            return Err(Error::graph(format!("link {link}: {} already linked", link.from)));
        }
        if self.port_in_use(&link.to) {
            return Err(Error::graph(format!("link {link}: {} already linked", link.to)));
        }
        if to.runtime && !to.synced {
            return Err(Error::graph(format!(
                "link {link}: {} must be activated before linking into it",
                link.to.node
            )));
        }
        if self.reaches(&link.to.node, &link.from.node) {
            return Err(Error::graph(format!("link {link}: would create a cycle")));
        }
        Ok(())
    }

    pub fn commit_link(&mut self, link: MediaLink) {
        self.links.push(link);
    }

    /// Drop a runtime node together with every link touching it.
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        match self.nodes.get(name) {
            Some(entry) if entry.runtime => {}
            Some(_) => return Err(Error::graph(format!("startup node {name} cannot be removed"))),
            None => return Err(Error::graph(format!("cannot remove unknown node {name}"))),
        }
        self.nodes.remove(name);
        self.links
            .retain(|link| link.from.node != name && link.to.node != name);
        Ok(())
    }

    /// Add a startup node (checked and committed in one step).
    pub fn insert_node(&mut self, spec: NodeSpec) -> Result<()> {
        self.check_add(&spec)?;
        self.commit_add(spec, false);
        Ok(())
    }

    /// Add a startup link (checked and committed in one step).
    pub fn insert_link(&mut self, link: MediaLink) -> Result<()> {
        self.check_link(&link)?;
        self.commit_link(link);
        Ok(())
    }

    /// Whether data leaving `start` can flow into `target`.
    ///
    /// A webrtc endpoint's receive outputs are not fed by its send inputs, so
    /// traversal stops there.
    fn reaches(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if self
                .nodes
                .get(node)
                .is_some_and(|entry| entry.spec.kind == NodeKind::WebRtc)
            {
                continue;
            }
            stack.extend(
                self.links
                    .iter()
                    .filter(|link| link.from.node == node)
                    .map(|link| link.to.node.as_str()),
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> MediaGraph {
        let mut graph = MediaGraph::new();
        graph
            .insert_node(NodeSpec::element("a", NodeKind::Source, "videotestsrc"))
            .unwrap();
        graph
            .insert_node(NodeSpec::element("b", NodeKind::Transform, "videoconvert"))
            .unwrap();
        graph
    }

    #[test]
    fn test_rejects_duplicate_node() {
        let mut graph = two_node_graph();
        let err = graph
            .insert_node(NodeSpec::element("a", NodeKind::Sink, "fakesink"))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }

    #[test]
    fn test_rejects_double_linked_port() {
        let mut graph = two_node_graph();
        graph
            .insert_node(NodeSpec::element("c", NodeKind::Sink, "fakesink"))
            .unwrap();
        graph.insert_link(MediaLink::chain("a", "b")).unwrap();
        assert!(graph.insert_link(MediaLink::chain("a", "c")).is_err());
        assert_eq!(graph.links().len(), 1);
    }

    #[test]
    fn test_rejects_undeclared_port() {
        let mut graph = two_node_graph();
        let link = MediaLink::new(PortRef::new("a", "src"), PortRef::new("b", "sink_7"));
        assert!(graph.insert_link(link).is_err());
    }

    #[test]
    fn test_rejects_cycle() {
        let mut graph = two_node_graph();
        graph.insert_link(MediaLink::chain("a", "b")).unwrap();
        assert!(graph.insert_link(MediaLink::chain("b", "a")).is_err());
    }

    #[test]
    fn test_runtime_node_requires_sync_before_link() {
        let mut graph = two_node_graph();
        let sink = NodeSpec::element("late", NodeKind::Sink, "fakesink");
        graph.check_add(&sink).unwrap();
        graph.commit_add(sink, true);

        let link = MediaLink::chain("b", "late");
        assert!(graph.check_link(&link).is_err());

        graph.check_sync("late").unwrap();
        graph.commit_sync("late");
        assert!(graph.is_synced("late"));
        graph.check_link(&link).unwrap();
    }

    #[test]
    fn test_dynamic_outputs_accept_any_port() {
        let mut graph = MediaGraph::new();
        graph
            .insert_node(
                NodeSpec::element("rtc", NodeKind::WebRtc, "webrtcbin")
                    .inputs(&["sink_0"])
                    .outputs(&[])
                    .with_dynamic_outputs(),
            )
            .unwrap();
        graph
            .insert_node(NodeSpec::chain("dec", NodeKind::Decoder, "rtpvp8depay ! vp8dec"))
            .unwrap();
        let link = MediaLink::new(PortRef::new("rtc", "src_3"), PortRef::new("dec", "sink"));
        graph.insert_link(link.clone()).unwrap();
        assert!(graph.has_link(&link));
    }

    #[test]
    fn test_webrtc_endpoint_does_not_close_a_cycle() {
        let mut graph = MediaGraph::new();
        graph
            .insert_node(NodeSpec::element("mix", NodeKind::Mixer, "compositor"))
            .unwrap();
        graph
            .insert_node(
                NodeSpec::element("rtc", NodeKind::WebRtc, "webrtcbin")
                    .inputs(&["sink_0"])
                    .outputs(&[])
                    .with_dynamic_outputs(),
            )
            .unwrap();
        graph
            .insert_link(MediaLink::new(
                PortRef::new("mix", "src"),
                PortRef::new("rtc", "sink_0"),
            ))
            .unwrap();
        graph
            .insert_node(NodeSpec::element("dec", NodeKind::Decoder, "vp8dec"))
            .unwrap();
        graph
            .insert_link(MediaLink::new(
                PortRef::new("rtc", "src_0"),
                PortRef::new("dec", "sink"),
            ))
            .unwrap();

        graph.insert_link(MediaLink::chain("dec", "mix")).unwrap();
        assert_eq!(graph.links().len(), 3);
    }

    #[test]
    fn test_remove_node_drops_its_links() {
        let mut graph = two_node_graph();
        let late = NodeSpec::element("late", NodeKind::Sink, "fakesink");
        graph.check_add(&late).unwrap();
        graph.commit_add(late, true);
        graph.commit_sync("late");
        graph.insert_link(MediaLink::chain("b", "late")).unwrap();

        graph.remove_node("late").unwrap();
        assert!(!graph.contains("late"));
        assert!(!graph.port_in_use(&PortRef::new("b", "src")));
        assert!(graph.remove_node("a").is_err());
    }

    #[test]
    fn test_registry_resolves_anchor() {
        let mut registry = NodeRegistry::default();
        registry.register(Anchor::Mixer, "mixer");
        assert_eq!(registry.resolve(Anchor::Mixer).unwrap(), "mixer");
        assert!(registry.resolve(Anchor::RelayTee).is_err());
    }
}
