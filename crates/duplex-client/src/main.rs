use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_core::config::{DEFAULT_CLIENT_TOKEN, DEFAULT_STUN_SERVER};
use duplex_core::{
    EngineEvent, GraphConfig, GraphTemplate, MediaEngine, Session, SessionConfig, SessionOutcome,
    SignallingChannel, DEFAULT_SERVER_URL,
};
use duplex_media::DummyEngine;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "duplex-client",
    version,
    about = "Exchange a live test stream with a WebRTC peer over a signalling server"
)]
struct Args {
    /// Signalling server URL
    #[arg(long, env = "DUPLEX_SERVER", default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Id of the peer to call
    #[arg(long, env = "DUPLEX_PEER_ID")]
    peer_id: String,

    /// Publish the outgoing mix to this RTMP endpoint once remote video arrives
    #[arg(long, env = "DUPLEX_RTMP_URI")]
    rtmp_uri: Option<String>,

    /// Token sent with the registration greeting
    #[arg(long, default_value = DEFAULT_CLIENT_TOKEN)]
    client_token: String,

    #[arg(long, default_value_t = 15)]
    registration_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    offer_timeout_secs: u64,

    #[arg(long, default_value = DEFAULT_STUN_SERVER)]
    stun_server: String,

    /// Use the offline media engine even when GStreamer is available
    #[arg(long)]
    dummy_media: bool,
}

impl Args {
    fn into_config(self) -> SessionConfig {
        let mut config = SessionConfig::new(self.peer_id);
        config.server_url = self.server;
        config.client_token = self.client_token;
        config.registration_timeout = Duration::from_secs(self.registration_timeout_secs);
        config.offer_timeout = Duration::from_secs(self.offer_timeout_secs);
        config.graph = GraphConfig {
            stun_server: self.stun_server,
            relay_uri: self.rtmp_uri,
            ..GraphConfig::default()
        };
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    duplex_common::init_tracing();

    let args = Args::parse();
    match run(args).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<SessionOutcome> {
    let dummy_media = args.dummy_media;
    let config = args.into_config();
    config.validate().context("invalid configuration")?;

    let template = GraphTemplate::sendrecv(&config.graph);
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();

    #[cfg(feature = "gstreamer-runtime")]
    {
        if !dummy_media {
            let engine = duplex_media::GstEngine::new(&template, engine_tx)
                .context("failed to build media pipeline")?;
            return drive(&config, engine, engine_rx).await;
        }
    }

    if !dummy_media {
        warn!("built without GStreamer support, using the offline media engine");
    }
    let engine = DummyEngine::new(&template, engine_tx);
    drive(&config, engine, engine_rx).await
}

async fn drive<E: MediaEngine>(
    config: &SessionConfig,
    engine: E,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<SessionOutcome> {
    let (channel, channel_events) =
        SignallingChannel::connect(&config.server_url, config.outbound_queue_depth)
            .await
            .context("failed to reach signalling server")?;

    let mut session = Session::new(config, engine, channel.sender())?;
    info!("calling peer {}", session.peer().peer_id);

    let outcome = session
        .run(channel_events, engine_rx, interrupted())
        .await;
    channel.close();

    match &outcome {
        SessionOutcome::Failed(e) => error!("session failed: {}", e),
        other => info!("session ended: {:?}", other),
    }
    Ok(outcome)
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
