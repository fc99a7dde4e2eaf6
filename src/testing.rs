//! In-process fakes for the transport and microphone seams

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::capture::{MicError, Microphone};
use crate::transport::{
    CloseInfo, EventSink, LiveSession, SessionConfig, Transport, TransportError,
};

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// What the fake transport observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Connected(u64, String),
    Audio(u64, Vec<u8>),
    Closed(u64),
}

#[derive(Default)]
struct TransportState {
    log: Vec<Record>,
    sinks: HashMap<u64, EventSink>,
}

/// Transport that accepts every session in-process
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    gate: watch::Sender<bool>,
    refuse: Option<String>,
    fail_sends: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            gate: watch::channel(true).0,
            refuse: None,
            fail_sends: false,
        }
    }

    /// Connects block until [`FakeTransport::release_gate`].
    pub fn gated() -> Self {
        let transport = Self::new();
        transport.gate.send_replace(false);
        transport
    }

    /// Every connect is refused with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::new()
        }
    }

    /// Sessions open, but every send fails.
    pub fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            ..Self::new()
        }
    }

    pub fn release_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn log(&self) -> Vec<Record> {
        self.state.lock().unwrap().log.clone()
    }

    /// Behavior scripts of every connect attempt, in order.
    pub fn scripts(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|r| match r {
                Record::Connected(_, script) => Some(script),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self, generation: u64) -> Vec<Vec<u8>> {
        self.log()
            .into_iter()
            .filter_map(|r| match r {
                Record::Audio(g, frame) if g == generation => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// The event sink handed to session `generation`, to inject server traffic.
    pub fn sink(&self, generation: u64) -> EventSink {
        self.state
            .lock()
            .unwrap()
            .sinks
            .get(&generation)
            .cloned()
            .expect("no such session")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn LiveSession>, TransportError> {
        let generation = events.generation();
        {
            let mut state = self.state.lock().unwrap();
            state
                .log
                .push(Record::Connected(generation, config.behavior_script.clone()));
            state.sinks.insert(generation, events.clone());
        }

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if let Some(reason) = &self.refuse {
            return Err(TransportError::Connect(reason.clone()));
        }
        Ok(Box::new(FakeSession {
            generation,
            state: self.state.clone(),
            events,
            fail_sends: self.fail_sends,
        }))
    }
}

struct FakeSession {
    generation: u64,
    state: Arc<Mutex<TransportState>>,
    events: EventSink,
    fail_sends: bool,
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::ConnectionClosed);
        }
        self.state
            .lock()
            .unwrap()
            .log
            .push(Record::Audio(self.generation, frame.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().log.push(Record::Closed(self.generation));
        // The service answers a close handshake with a normal close
        self.events.closed(CloseInfo {
            clean: true,
            code: 1000,
            reason: String::new(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct MicState {
    next_error: Option<MicError>,
    frames: Option<mpsc::Sender<Vec<f32>>>,
    acquired: usize,
    released: usize,
}

/// Microphone whose frames are pushed by the test
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: MicError) {
        self.state.lock().unwrap().next_error = Some(error);
    }

    pub fn push(&self, frame: Vec<f32>) {
        let state = self.state.lock().unwrap();
        let frames = state.frames.as_ref().expect("microphone not held");
        frames.try_send(frame).expect("frame queue full");
    }

    /// Simulate the device going away while held.
    pub fn end_stream(&self) {
        self.state.lock().unwrap().frames = None;
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().frames.is_some()
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, MicError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.next_error.take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        state.frames = Some(tx);
        state.acquired += 1;
        Ok(rx)
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.frames.take().is_some() {
            state.released += 1;
        }
    }
}
