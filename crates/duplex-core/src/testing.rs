//! Engine double that records every command it receives.

use duplex_common::{Error, Result};

use crate::engine::{MediaEngine, StreamId};
use crate::graph::{MediaLink, NodeSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    CreateOffer,
    SetLocal(String),
    SetRemote(String),
    AddIce(u32, String),
    AddNode(String),
    Sync(String),
    Link(MediaLink),
    Remove(String),
    Release(StreamId),
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub commands: Vec<Command>,
    /// Reject the next `link` with an engine error.
    pub fail_next_link: bool,
}

impl RecordingEngine {
    pub fn count(&self, wanted: &Command) -> usize {
        self.commands.iter().filter(|c| *c == wanted).count()
    }

    pub fn ice_applied(&self) -> Vec<(u32, String)> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::AddIce(mline, candidate) => Some((*mline, candidate.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn links(&self) -> Vec<MediaLink> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Link(link) => Some(link.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MediaEngine for RecordingEngine {
    fn start(&mut self) -> Result<()> {
        self.commands.push(Command::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.commands.push(Command::Stop);
        Ok(())
    }

    fn create_offer(&mut self) -> Result<()> {
        self.commands.push(Command::CreateOffer);
        Ok(())
    }

    fn set_local_description(&mut self, sdp: &str) -> Result<()> {
        self.commands.push(Command::SetLocal(sdp.to_string()));
        Ok(())
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        self.commands.push(Command::SetRemote(sdp.to_string()));
        Ok(())
    }

    fn add_ice_candidate(&mut self, mline_index: u32, candidate: &str) -> Result<()> {
        self.commands
            .push(Command::AddIce(mline_index, candidate.to_string()));
        Ok(())
    }

    fn add_node(&mut self, node: &NodeSpec) -> Result<()> {
        self.commands.push(Command::AddNode(node.name.clone()));
        Ok(())
    }

    fn sync_node_state(&mut self, node: &str) -> Result<()> {
        self.commands.push(Command::Sync(node.to_string()));
        Ok(())
    }

    fn link(&mut self, link: &MediaLink) -> Result<()> {
        if std::mem::take(&mut self.fail_next_link) {
            return Err(Error::engine(format!("refused to link {link}")));
        }
        self.commands.push(Command::Link(link.clone()));
        Ok(())
    }

    fn remove_node(&mut self, node: &str) -> Result<()> {
        self.commands.push(Command::Remove(node.to_string()));
        Ok(())
    }

    fn release_stream(&mut self, stream: &StreamId) -> Result<()> {
        self.commands.push(Command::Release(stream.clone()));
        Ok(())
    }
}
