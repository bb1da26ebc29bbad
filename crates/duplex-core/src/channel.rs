//! WebSocket transport to the signalling server.
//!
//! The socket is split into a reader task, which forwards every frame as a
//! [`ChannelEvent`], and a writer task draining a bounded queue of outbound text
//! frames. Sends are therefore never issued from engine threads.

use duplex_common::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Close { code: Option<u16>, reason: String },
    Error(String),
}

pub struct SignallingChannel {
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

fn is_insecure_signalling_url(url: &str) -> bool {
    url.trim().to_ascii_lowercase().starts_with("ws://")
}

impl SignallingChannel {
    /// Connect and spawn the reader/writer tasks. The first event delivered is
    /// always [`ChannelEvent::Open`].
    pub async fn connect(
        url: &str,
        queue_depth: usize,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        if is_insecure_signalling_url(url) {
            warn!("signalling over plain ws://, traffic is not encrypted");
        }
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {url}: {e}")))?;
        info!("Connected to signalling server: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(queue_depth);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(queue_depth);

        event_tx
            .send(ChannelEvent::Open)
            .await
            .map_err(|_| Error::transport("event queue closed before open"))?;

        let writer_events = event_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                debug!("-> {}", text);
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    error!("Failed to send signalling message: {}", e);
                    let _ = writer_events.send(ChannelEvent::Error(e.to_string())).await;
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let event = match msg {
                    Ok(WsMessage::Text(text)) => {
                        debug!("<- {}", text.as_str());
                        ChannelEvent::Message(text.as_str().to_owned())
                    }
                    Ok(WsMessage::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = event_tx.send(ChannelEvent::Close { code, reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Signalling WebSocket error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            warn!("signalling stream ended without a close frame");
            let _ = event_tx
                .send(ChannelEvent::Error(
                    "signalling stream ended without a close frame".to_string(),
                ))
                .await;
        });

        Ok((
            Self {
                outbound: outbound_tx,
                reader,
                writer,
            },
            event_rx,
        ))
    }

    /// Queue for outbound text frames, drained in order by the writer task.
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outbound.clone()
    }

    /// Drop both tasks; nothing queued after this point reaches the server.
    pub fn close(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_plain_websocket_urls() {
        assert!(is_insecure_signalling_url("ws://localhost:8443"));
        assert!(is_insecure_signalling_url("  WS://host"));
        assert!(!is_insecure_signalling_url("wss://webrtc.nirbheek.in:8443"));
    }
}
