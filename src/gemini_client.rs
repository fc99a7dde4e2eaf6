//! Gemini Live transport over WebSockets
//!
//! Each session is its own WebSocket connection. The connection is split into
//! a write half owned by the [`GeminiSession`] and a read half drained by a
//! background task that forwards decoded events into the session's
//! [`EventSink`].

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gemini::{BidiGenerateContentSetup, ClientMessage, ServerMessage, DEFAULT_MODEL, LIVE_ENDPOINT};
use crate::transport::{CloseInfo, EventSink, LiveSession, SessionConfig, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Configuration for the Gemini transport
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub url: String,
    pub model: String,
    pub setup_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: DEFAULT_MODEL.to_string(),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens Gemini Live sessions
pub struct GeminiTransport {
    config: GeminiConfig,
}

impl GeminiTransport {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    /// Create a transport from an API key and optional configuration.
    pub fn from_api_key(api_key: &str, config: Option<GeminiConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        config.url = format!("{}?key={}", LIVE_ENDPOINT, api_key);
        Self::new(config)
    }

    async fn handshake(&self, config: &SessionConfig) -> Result<(WsSink, WsSource), TransportError> {
        let (ws_stream, resp) = connect_async(&self.config.url).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        let setup = ClientMessage::Setup(BidiGenerateContentSetup::for_session(
            &self.config.model,
            config,
        ));
        sink.send(Message::text(setup.to_json()?)).await?;
        info!("Setup message sent, waiting for acknowledgment");

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                TransportError::Timeout
            })??;

        Ok((sink, stream))
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn connect(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn LiveSession>, TransportError> {
        info!(
            "Connecting session {} (model {}, language {})",
            events.generation(),
            self.config.model,
            config.language
        );

        let (sink, stream) = match self.handshake(config).await {
            Ok(halves) => halves,
            Err(TransportError::WebSocket(e)) => {
                return Err(TransportError::Connect(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        tokio::spawn(read_loop(stream, events));
        Ok(Box::new(GeminiSession { sink }))
    }
}

/// Wait for `setupComplete`; a close before it means the service refused the setup.
async fn wait_for_setup_complete(stream: &mut WsSource) -> Result<(), TransportError> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                if ServerMessage::parse(&text)?.is_setup_complete() {
                    return Ok(());
                }
                debug!("Ignoring message before setup complete");
            }
            Message::Binary(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                if ServerMessage::parse(&text)?.is_setup_complete() {
                    return Ok(());
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "connection closed during setup".to_string());
                return Err(TransportError::Connect(reason));
            }
            _ => {}
        }
    }
    Err(TransportError::SetupNotComplete)
}

/// Forward inbound traffic of one session until its connection ends.
async fn read_loop(mut stream: WsSource, events: EventSink) {
    let generation = events.generation();
    debug!("Inbound task for session {} started", generation);

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            // The service sends JSON in binary frames as well
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason.to_string()))
                    .unwrap_or((CloseCode::Status, String::new()));
                info!("Session {} closed by peer: {} {}", generation, code, reason);
                events.closed(CloseInfo {
                    clean: matches!(code, CloseCode::Normal | CloseCode::Status),
                    code: u16::from(code),
                    reason,
                });
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Session {} WebSocket error: {:?}", generation, e);
                events.error(TransportError::WebSocket(e));
                return;
            }
        };

        match ServerMessage::parse(&text).and_then(ServerMessage::into_event) {
            Ok(Some(event)) => events.message(event),
            Ok(None) => {}
            Err(TransportError::Serialization(e)) => {
                warn!("Failed to parse server message: {}", e);
            }
            Err(e) => {
                events.error(e);
                return;
            }
        }
    }

    warn!("Session {} stream ended without a close frame", generation);
    events.closed(CloseInfo {
        clean: false,
        code: u16::from(CloseCode::Abnormal),
        reason: String::new(),
    });
}

/// Write half of one Gemini session; the read half lives in [`read_loop`]
pub struct GeminiSession {
    sink: WsSink,
}

#[async_trait]
impl LiveSession for GeminiSession {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let json = ClientMessage::audio(frame).to_json()?;
        self.sink.send(Message::text(json)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static(""),
        };
        self.sink.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}
