//! WebSocket transport over tokio-tungstenite.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{LedgerLinkError, Result};
use crate::transport::{Transport, TransportSink};

/// Validates and normalizes a WebSocket endpoint URL.
pub fn validate_ws_url(uri: &str) -> Result<String> {
    let parsed = Url::parse(uri.trim())
        .map_err(|e| LedgerLinkError::Configuration(format!("invalid endpoint URL: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(LedgerLinkError::Configuration(format!(
                "endpoint scheme must be ws or wss, got {other:?}"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(LedgerLinkError::Configuration(
            "endpoint URL has no host".into(),
        ));
    }
    Ok(parsed.to_string())
}

/// The stock transport: one reader/writer session per connection attempt,
/// invalidated by bumping a shared session counter so frames from torn-down
/// sessions never reach the client.
pub struct WsTransport {
    sink: Option<TransportSink>,
    writer: Option<mpsc::UnboundedSender<String>>,
    current_session: Arc<AtomicU64>,
}

impl WsTransport {
    pub fn new() -> Self {
        WsTransport {
            sink: None,
            writer: None,
            current_session: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WsTransport {
    fn attach(&mut self, sink: TransportSink) {
        self.sink = Some(sink);
    }

    fn connect(&mut self, uri: &str) -> Result<()> {
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| LedgerLinkError::Configuration("transport not attached".into()))?;
        let uri = validate_ws_url(uri)?;
        let session = self.current_session.fetch_add(1, Ordering::SeqCst) + 1;
        let sessions = self.current_session.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        sink.connecting();
        tokio::spawn(run_session(uri, sink, rx, sessions, session));
        Ok(())
    }

    fn disconnect(&mut self) {
        // Invalidate the session first so in-flight frames are dropped.
        self.current_session.fetch_add(1, Ordering::SeqCst);
        self.writer = None;
    }

    fn send(&mut self, text: String) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(LedgerLinkError::NotConnected)?;
        writer
            .send(text)
            .map_err(|_| LedgerLinkError::Transport("connection writer closed".into()))
    }
}

async fn run_session(
    uri: String,
    sink: TransportSink,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    sessions: Arc<AtomicU64>,
    session: u64,
) {
    let live = || sessions.load(Ordering::SeqCst) == session;
    let ws = match connect_async(&uri).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            if live() {
                sink.error(format!("connect to {uri} failed: {e}"));
                sink.disconnected();
            }
            return;
        }
    };
    if !live() {
        return;
    }
    sink.connected();
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(text) if live() => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !live() {
                        break;
                    }
                    sink.message(text.as_str().to_owned());
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if live() {
                        sink.error(format!("read error: {e}"));
                    }
                    break;
                }
            }
        }
    }
    if live() {
        sink.disconnected();
    }
}
