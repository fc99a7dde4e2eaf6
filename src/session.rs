//! Session lifecycle manager
//!
//! Owns the single authoritative session handle. A handle is deferred: it is
//! usable the moment it is created, and audio sent through it queues behind
//! the connection's establishment. Replacing the handle closes the old one
//! without waiting for it; events from superseded handles are recognised by
//! their generation and dropped.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Boundary, Error};
use crate::transport::{
    EventSink, ServerEvent, SessionConfig, SessionEvent, SessionEventKind, Transport,
    TransportError,
};

/// Lifecycle of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

/// What a session event means for the rest of the conversation
#[derive(Debug)]
pub enum SessionUpdate {
    Opened,
    Message(ServerEvent),
    Failed(Error),
    Closed,
}

enum Command {
    Audio(Vec<u8>),
    Close,
}

/// Deferred handle to one session
struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    fn send_audio(&self, frame: Vec<u8>) {
        if self.commands.send(Command::Audio(frame)).is_err() {
            debug!("Session {} is gone; frame dropped", self.generation);
        }
    }

    fn close(&self) {
        // Fire-and-forget: the driver drains queued audio, then closes
        let _ = self.commands.send(Command::Close);
    }
}

/// Manages the one live session of the conversation
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    current: Option<SessionHandle>,
    state: SessionState,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            transport,
            events,
            current: None,
            state: SessionState::Uninitialized,
            next_generation: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a handle exists that audio can be sent through.
    pub fn has_session(&self) -> bool {
        self.current.is_some()
    }

    /// Generation of the authoritative handle, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|h| h.generation)
    }

    /// Open a session bound to `config`, superseding any existing one.
    pub fn open(&mut self, config: SessionConfig, online: bool) -> Result<(), Error> {
        self.retire_current();

        if !online {
            warn!("Not opening a session: offline");
            self.state = SessionState::Failed;
            return Err(Error::Connectivity(Boundary::Open));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(generation, self.events.clone());
        tokio::spawn(drive_session(self.transport.clone(), config, rx, sink));

        self.current = Some(SessionHandle {
            generation,
            commands: tx,
        });
        self.state = SessionState::Opening;
        info!("Session {} opening", generation);
        Ok(())
    }

    /// Swap the session for one bound to a new stage's script.
    pub fn replace(&mut self, config: SessionConfig, online: bool) -> Result<(), Error> {
        debug!("Replacing session {:?}", self.generation());
        self.open(config, online)
    }

    /// Close and reopen from scratch.
    pub fn reset(&mut self, config: SessionConfig, online: bool) -> Result<(), Error> {
        debug!("Resetting session {:?}", self.generation());
        self.open(config, online)
    }

    /// Queue one encoded frame on the newest handle.
    pub fn send_audio(&self, frame: Vec<u8>) {
        match &self.current {
            Some(handle) => handle.send_audio(frame),
            None => debug!("No session; frame dropped"),
        }
    }

    /// Ask the current session to close for good.
    pub fn shutdown(&mut self) {
        if let Some(handle) = &self.current {
            if matches!(self.state, SessionState::Opening | SessionState::Open) {
                info!("Closing session {}", handle.generation);
                handle.close();
                self.state = SessionState::Closing;
            }
        }
    }

    /// Mark the current session failed for a reason found outside the transport.
    pub fn fail(&mut self, error: TransportError) -> Error {
        if let Some(generation) = self.generation() {
            warn!("Session {} failed: {}", generation, error);
        }
        self.state = SessionState::Failed;
        self.retire_current();
        Error::Transport(error)
    }

    /// Apply an event reported by a session's transport.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        let current = match &self.current {
            Some(handle) if handle.generation == event.generation => handle.generation,
            _ => {
                debug!("Ignoring event from superseded session {}", event.generation);
                return None;
            }
        };

        match event.kind {
            SessionEventKind::Opened => {
                if self.state != SessionState::Opening {
                    return None;
                }
                info!("Session {} open", current);
                self.state = SessionState::Open;
                Some(SessionUpdate::Opened)
            }
            SessionEventKind::Message(message) => {
                if matches!(self.state, SessionState::Failed | SessionState::Closed) {
                    debug!("Dropping message from finished session {}", current);
                    return None;
                }
                Some(SessionUpdate::Message(message))
            }
            SessionEventKind::OpenFailed(error) | SessionEventKind::Error(error) => {
                if matches!(self.state, SessionState::Failed | SessionState::Closed) {
                    return None;
                }
                warn!("Session {} failed: {}", current, error);
                self.state = SessionState::Failed;
                self.retire_current();
                Some(SessionUpdate::Failed(Error::Transport(error)))
            }
            SessionEventKind::Closed(info) => {
                if matches!(self.state, SessionState::Failed | SessionState::Closed) {
                    return None;
                }
                if info.clean || self.state == SessionState::Closing {
                    info!("Session {} closed", current);
                    self.state = SessionState::Closed;
                    Some(SessionUpdate::Closed)
                } else {
                    warn!("Session {} closed uncleanly: {} {}", current, info.code, info.reason);
                    self.state = SessionState::Failed;
                    self.retire_current();
                    Some(SessionUpdate::Failed(Error::UncleanClose {
                        code: info.code,
                        reason: info.reason,
                    }))
                }
            }
        }
    }

    /// Close the current handle; later events from it count as stale.
    fn retire_current(&mut self) {
        if let Some(old) = self.current.take() {
            debug!("Closing session {}", old.generation);
            old.close();
        }
    }
}

/// Open one session, then drain its outbound queue in order until closed.
async fn drive_session(
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSink,
) {
    let generation = events.generation();
    let mut session = match transport.connect(&config, events.clone()).await {
        Ok(session) => {
            events.opened();
            session
        }
        Err(e) => {
            warn!("Session {} failed to open: {}", generation, e);
            events.open_failed(e);
            return;
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            Command::Audio(frame) => {
                if let Err(e) = session.send_audio(&frame).await {
                    warn!("Session {} send failed: {}", generation, e);
                    events.error(e);
                    return;
                }
            }
            Command::Close => break,
        }
    }

    if let Err(e) = session.close().await {
        debug!("Session {} close failed: {}", generation, e);
    }
    debug!("Session {} driver finished", generation);
}
