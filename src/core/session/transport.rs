//! Peer transport boundary.
//!
//! A [`Transport`] opens a duplex channel to the realtime backend: typed
//! [`ClientEvent`]s go out, raw [`TransportFrame`]s come in. The controller
//! never talks to the socket directly, so tests substitute an in-memory
//! transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::base::{SessionError, SessionResult};
use super::protocol::ClientEvent;

/// Channel capacity for outbound client events.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for inbound frames.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Default realtime endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// An inbound item from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    /// A discrete protocol frame (JSON text)
    Text(String),
    /// The peer closed the connection
    Closed { reason: String },
    /// The connection failed
    Error(String),
}

/// Both directions of an open transport.
pub struct TransportChannels {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Duplex connection to the realtime backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection.
    async fn open(&mut self) -> SessionResult<TransportChannels>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self) -> SessionResult<()>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport for the OpenAI Realtime API.
pub struct WebSocketTransport {
    url: String,
    model: String,
    api_key: String,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
            cancel: None,
            handle: None,
        }
    }

    /// Build the WebSocket URL with model parameter.
    pub fn build_ws_url(&self) -> String {
        if self.model.is_empty() {
            self.url.clone()
        } else if self.url.contains('?') {
            format!("{}&model={}", self.url, self.model)
        } else {
            format!("{}?model={}", self.url, self.model)
        }
    }

    fn build_request(&self) -> SessionResult<http::Request<()>> {
        let url = self.build_ws_url();
        let uri: http::Uri = url
            .parse()
            .map_err(|e| SessionError::InvalidConfiguration(format!("invalid URL {url}: {e}")))?;
        let host = match (uri.host(), uri.port_u16()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SessionError::InvalidConfiguration(format!(
                    "URL has no host: {url}"
                )));
            }
        };

        http::Request::builder()
            .uri(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header("Sec-WebSocket-Protocol", "realtime")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> SessionResult<TransportChannels> {
        let request = self.build_request()?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(ref response) if response.status() == 401 => {
                    SessionError::AuthenticationFailed(e.to_string())
                }
                tungstenite::Error::Protocol(_) => SessionError::WebSocketError(e.to_string()),
                other => SessionError::ConnectionFailed(other.to_string()),
            })?;

        info!("Connected to realtime endpoint");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(OUTBOUND_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(INBOUND_CHANNEL_CAPACITY);

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        debug!("WebSocket transport closed locally");
                        break;
                    }

                    Some(event) = out_rx.recv() => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize {}: {}", event.kind(), e);
                                continue;
                            }
                        };

                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            let _ = in_tx.send(TransportFrame::Error(e.to_string())).await;
                            break;
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(TransportFrame::Text(text.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_else(|| "closed by server".to_string());
                                info!("WebSocket closed by server: {}", reason);
                                let _ = in_tx.send(TransportFrame::Closed { reason }).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                let _ = in_tx.send(TransportFrame::Error(e.to_string())).await;
                                break;
                            }
                            None => {
                                let _ = in_tx
                                    .send(TransportFrame::Closed { reason: "stream ended".to_string() })
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.cancel = Some(cancel);
        self.handle = Some(handle);

        Ok(TransportChannels {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    async fn close(&mut self) -> SessionResult<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("WebSocket task ended abnormally: {}", e);
                }
            }
        }
        Ok(())
    }
}
