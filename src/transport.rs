//! Streaming transport seam
//!
//! The conversation core talks to the remote voice service through these
//! traits only. A transport opens one duplex session per [`SessionConfig`];
//! everything the session receives is pushed into the core through an
//! [`EventSink`] tagged with the generation of the handle that opened it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Connect(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout")]
    Timeout,

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Immutable configuration for one session's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Instructions governing the remote model for the current stage
    pub behavior_script: String,
    /// BCP-47 tag of the spoken output language
    pub language: String,
    /// Prebuilt voice identifier
    pub voice: String,
}

/// One inbound message from the service, reduced to what the core uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    /// Encoded PCM16 audio fragment, if the message carried one
    pub audio: Option<Vec<u8>>,
    /// The service detected user speech and dropped its current turn
    pub interrupted: bool,
}

/// How a session's connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub clean: bool,
    pub code: u16,
    pub reason: String,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// The service acknowledged the session setup
    Opened,
    /// Connecting or setting up the session failed
    OpenFailed(TransportError),
    Message(ServerEvent),
    Error(TransportError),
    Closed(CloseInfo),
}

/// A lifecycle or data event from one session handle
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Where a transport reports what happens on its connection
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(SessionEventKind::Opened);
    }

    pub fn open_failed(&self, error: TransportError) {
        self.emit(SessionEventKind::OpenFailed(error));
    }

    pub fn message(&self, event: ServerEvent) {
        self.emit(SessionEventKind::Message(event));
    }

    pub fn error(&self, error: TransportError) {
        self.emit(SessionEventKind::Error(error));
    }

    pub fn closed(&self, info: CloseInfo) {
        self.emit(SessionEventKind::Closed(info));
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("Session {} event dropped: conversation gone", self.generation);
        }
    }
}

/// An open duplex session
#[async_trait]
pub trait LiveSession: Send {
    /// Send one PCM16 frame captured from the microphone.
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Ask the service to close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions against the remote voice service
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and complete the session setup. Returns once the service has
    /// acknowledged the setup; inbound traffic is delivered through `events`.
    async fn connect(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn LiveSession>, TransportError>;
}
