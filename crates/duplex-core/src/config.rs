use std::time::Duration;

use duplex_common::{Error, Result};
use url::Url;

/// Public test server the send/receive demo peers register with.
pub const DEFAULT_SERVER_URL: &str = "wss://webrtc.nirbheek.in:8443";
/// Token sent with `HELLO`; identifies this client to the server.
pub const DEFAULT_CLIENT_TOKEN: &str = "564322";
pub const DEFAULT_STUN_SERVER: &str = "stun://stun.l.google.com:19302";
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Shape of the local and remote video paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    pub source_width: u32,
    pub source_height: u32,
    /// Remote video is scaled to this size before entering the compositor.
    pub remote_width: u32,
    pub remote_height: u32,
    pub stun_server: String,
    /// RTMP target for the relay branch; `None` drains it into a discard sink.
    pub relay_uri: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            source_width: 320,
            source_height: 480,
            remote_width: 160,
            remote_height: 120,
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            relay_uri: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub peer_id: String,
    pub client_token: String,
    pub registration_timeout: Duration,
    pub offer_timeout: Duration,
    pub outbound_queue_depth: usize,
    pub graph: GraphConfig,
}

impl SessionConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            peer_id: peer_id.into(),
            client_token: DEFAULT_CLIENT_TOKEN.to_string(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            graph: GraphConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(Error::config("peer id must not be empty"));
        }
        if self.peer_id.chars().any(char::is_whitespace) {
            return Err(Error::config("peer id must not contain whitespace"));
        }
        if self.client_token.trim().is_empty() || self.client_token.chars().any(char::is_whitespace) {
            return Err(Error::config("client token must be a single non-empty word"));
        }

        let url = Url::parse(&self.server_url)
            .map_err(|e| Error::config(format!("invalid server url {}: {e}", self.server_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "server url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.outbound_queue_depth == 0 {
            return Err(Error::config("outbound queue depth must be at least 1"));
        }
        if self.registration_timeout.is_zero() || self.offer_timeout.is_zero() {
            return Err(Error::config("negotiation timeouts must be non-zero"));
        }
        if self.graph.remote_width == 0 || self.graph.remote_height == 0 {
            return Err(Error::config("remote video resolution must be non-zero"));
        }
        if let Some(uri) = &self.graph.relay_uri {
            if uri.trim().is_empty() {
                return Err(Error::config("relay uri must not be blank"));
            }
        }
        Ok(())
    }
}
