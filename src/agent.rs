//! Conversation engine
//!
//! One task owns the whole conversation: stage plan, session manager,
//! capture pipeline and playback scheduler. Its `select!` loop serialises
//! user commands, session events, playback completions, microphone frames
//! and connectivity changes, and publishes a [`Snapshot`] after each one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capture::{CapturePipeline, Microphone};
use crate::config::Profile;
use crate::error::{Boundary, Error};
use crate::pcm::{decode_pcm16, encode_pcm16};
use crate::playback::{PlaybackScheduler, PlaybackSink, SegmentId};
use crate::session::{SessionManager, SessionState, SessionUpdate};
use crate::stage::StagePlan;
use crate::transport::{ServerEvent, SessionConfig, SessionEvent, Transport};

const HOLD_TO_TALK: &str = "Hold to talk.";
const CONNECTED: &str = "Connection established. Hold to talk.";
const CLEARED: &str = "Session cleared. Hold to talk.";
const REQUESTING_MIC: &str = "Requesting microphone access...";
const LISTENING: &str = "Listening...";
const THINKING: &str = "Thinking...";
const SPEAKING: &str = "Speaking...";
const CLOSED: &str = "Connection closed.";
const BACK_ONLINE: &str = "You are back online.";
const BACK_ONLINE_RESET: &str = "You are back online. Reset to start a new session.";

/// What the agent appears to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Listening,
    Thinking,
    Talking,
}

/// Stored part of the activity; `Talking` is derived from playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Listening,
    Thinking,
}

/// The one line of text shown to the user: a status or an error, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Status(String),
    Error(String),
}

/// Everything a front-end needs to render the conversation
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub notice: Notice,
    pub activity: Activity,
    pub stage_index: usize,
    pub stage_count: usize,
    pub stage_name: String,
    pub session: SessionState,
    pub capturing: bool,
}

impl Snapshot {
    pub fn status(&self) -> Option<&str> {
        match &self.notice {
            Notice::Status(text) => Some(text),
            Notice::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.notice {
            Notice::Error(text) => Some(text),
            Notice::Status(_) => None,
        }
    }
}

/// User requests to the conversation
#[derive(Debug, Clone)]
pub enum Command {
    Login(Profile),
    StartTalk,
    StopTalk,
    ToggleTalk,
    NextStage,
    Reset,
    Shutdown,
}

/// What the conversation is built from
pub struct ConversationParts {
    pub plan: StagePlan,
    pub transport: Arc<dyn Transport>,
    pub microphone: Box<dyn Microphone>,
    pub playback: Box<dyn PlaybackSink>,
    /// Completion ids reported by `playback`
    pub ended: mpsc::UnboundedReceiver<SegmentId>,
    pub online: watch::Receiver<bool>,
    pub voice: String,
}

pub struct Conversation {
    plan: StagePlan,
    session: SessionManager,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    profile: Option<Profile>,
    voice: String,
    mode: Mode,
    notice: Notice,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ended: mpsc::UnboundedReceiver<SegmentId>,
    online: watch::Receiver<bool>,
    snapshots: watch::Sender<Snapshot>,
}

impl Conversation {
    pub fn new(parts: ConversationParts) -> (Self, watch::Receiver<Snapshot>) {
        let (events_tx, session_events) = mpsc::unbounded_channel();
        let online = *parts.online.borrow();
        let notice = if online {
            Notice::Status(HOLD_TO_TALK.to_string())
        } else {
            Notice::Error(Error::Connectivity(Boundary::Startup).user_message())
        };

        let conversation = Self {
            plan: parts.plan,
            session: SessionManager::new(parts.transport, events_tx),
            capture: CapturePipeline::new(parts.microphone),
            playback: PlaybackScheduler::new(parts.playback),
            profile: None,
            voice: parts.voice,
            mode: Mode::Idle,
            notice,
            session_events,
            ended: parts.ended,
            online: parts.online,
            snapshots: watch::channel(placeholder_snapshot()).0,
        };
        let snapshot = conversation.snapshot();
        conversation.snapshots.send_replace(snapshot);
        let rx = conversation.snapshots.subscribe();
        (conversation, rx)
    }

    pub fn snapshot(&self) -> Snapshot {
        let stage = self.plan.current();
        Snapshot {
            notice: self.notice.clone(),
            activity: self.activity(),
            stage_index: stage.index,
            stage_count: self.plan.len(),
            stage_name: stage.name.clone(),
            session: self.session.state(),
            capturing: self.capture.is_active(),
        }
    }

    pub fn activity(&self) -> Activity {
        if self.playback.is_talking() {
            return Activity::Talking;
        }
        match self.mode {
            Mode::Idle => Activity::Idle,
            Mode::Listening => Activity::Listening,
            Mode::Thinking => Activity::Thinking,
        }
    }

    /// Process events until `Shutdown` or until every command sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Conversation started with {} stages", self.plan.len());
        let mut watching_online = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.session_events.recv() => self.on_session_event(event),
                Some(id) = self.ended.recv() => self.on_segment_ended(id),
                frame = self.capture.next_frame() => self.on_frame(frame),
                changed = self.online.changed(), if watching_online => {
                    if changed.is_err() {
                        debug!("Connectivity signal gone");
                        watching_online = false;
                    } else {
                        self.on_connectivity_changed();
                    }
                }
            }
            self.publish();
        }

        self.shutdown().await;
    }

    pub async fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Login(profile) => self.login(profile),
            Command::StartTalk => self.start_talk().await,
            Command::StopTalk => self.stop_talk(),
            Command::ToggleTalk => {
                if self.capture.is_active() {
                    self.stop_talk();
                } else {
                    self.start_talk().await;
                }
            }
            Command::NextStage => self.next_stage(),
            Command::Reset => self.reset(),
            Command::Shutdown => self.session.shutdown(),
        }
    }

    /// Bind the profile and open a session for the current stage.
    pub fn login(&mut self, profile: Profile) {
        info!("Logged in as {} ({})", profile.user_name, profile.language);
        self.profile = Some(profile);
        self.open_session();
    }

    pub async fn start_talk(&mut self) {
        if self.profile.is_none() {
            debug!("Talk ignored: not logged in");
            return;
        }

        let online = self.is_online();
        match self.capture.prepare(&mut self.playback, online) {
            Ok(true) => {}
            Ok(false) => {
                self.set_status(LISTENING);
                return;
            }
            Err(e) => {
                self.set_error(e);
                return;
            }
        }

        self.set_status(REQUESTING_MIC);
        self.publish();
        match self.capture.acquire().await {
            Ok(()) => {
                self.mode = Mode::Listening;
                self.set_status(LISTENING);
            }
            Err(e) => {
                self.capture.stop();
                self.mode = Mode::Idle;
                self.set_error(e);
            }
        }
    }

    pub fn stop_talk(&mut self) {
        if self.capture.stop() {
            self.mode = Mode::Thinking;
            self.set_status(THINKING);
        }
    }

    pub fn next_stage(&mut self) {
        if self.plan.is_last() {
            debug!("Already at the last stage");
            return;
        }
        if self.capture.stop() {
            self.mode = Mode::Idle;
        }
        let name = match self.plan.advance() {
            Some(stage) => stage.name.clone(),
            None => return,
        };
        info!("Advancing to stage {}: {}", self.plan.index(), name);
        self.set_status(format!("Transitioning to: {}", name));

        if let Some(config) = self.session_config() {
            if let Err(e) = self.session.replace(config, self.is_online()) {
                self.set_error(e);
            }
        }
    }

    pub fn reset(&mut self) {
        info!("Resetting conversation");
        self.capture.stop();
        self.playback.interrupt();
        self.plan.reset();
        self.mode = Mode::Idle;
        self.set_status(HOLD_TO_TALK);

        if let Some(config) = self.session_config() {
            match self.session.reset(config, self.is_online()) {
                Ok(()) => self.set_status(CLEARED),
                Err(e) => self.set_error(e),
            }
        }
    }

    pub fn on_session_event(&mut self, event: SessionEvent) {
        let Some(update) = self.session.handle_event(event) else {
            return;
        };
        match update {
            SessionUpdate::Opened => {
                if !self.capture.is_active() {
                    self.set_status(CONNECTED);
                }
            }
            SessionUpdate::Message(message) => self.on_server_message(message),
            SessionUpdate::Failed(e) => self.set_error(e),
            SessionUpdate::Closed => {
                if self.capture.stop() {
                    self.mode = Mode::Idle;
                }
                self.set_status(CLOSED);
            }
        }
    }

    fn on_server_message(&mut self, message: ServerEvent) {
        if let Some(audio) = message.audio {
            match decode_pcm16(&audio) {
                Ok(samples) => {
                    let scheduled = self.playback.enqueue(samples);
                    if scheduled.started_talking {
                        self.set_status(SPEAKING);
                    }
                }
                Err(e) => {
                    let e = self.session.fail(e);
                    self.set_error(e);
                    return;
                }
            }
        }

        if message.interrupted {
            debug!("Server interrupted the agent");
            self.playback.interrupt();
            self.speech_finished();
        }
    }

    pub fn on_segment_ended(&mut self, id: SegmentId) {
        if self.playback.on_ended(id) {
            self.speech_finished();
        }
    }

    /// The agent stopped talking; fall back to whatever the user is doing.
    fn speech_finished(&mut self) {
        if self.capture.is_active() {
            self.set_status(LISTENING);
        } else {
            self.mode = Mode::Idle;
            self.set_status(HOLD_TO_TALK);
        }
    }

    pub fn on_frame(&mut self, frame: Option<Vec<f32>>) {
        match frame {
            Some(samples) => self.session.send_audio(encode_pcm16(&samples)),
            None => {
                warn!("Microphone stream ended");
                self.stop_talk();
            }
        }
    }

    pub fn on_connectivity_changed(&mut self) {
        if self.is_online() {
            let needs_reset = matches!(
                self.session.state(),
                SessionState::Failed | SessionState::Closed
            ) || (self.profile.is_some() && !self.session.has_session());
            self.set_status(if needs_reset { BACK_ONLINE_RESET } else { BACK_ONLINE });
        } else {
            if self.capture.stop() {
                self.mode = Mode::Idle;
            }
            self.set_error(Error::Connectivity(Boundary::Lost));
        }
    }

    /// Close the session and wait briefly for the close to be acknowledged.
    pub async fn shutdown(&mut self) {
        info!("Shutting down conversation");
        self.capture.stop();
        self.playback.interrupt();
        self.session.shutdown();
        self.publish();

        let deadline = tokio::time::sleep(Duration::from_secs(2));
        tokio::pin!(deadline);
        while self.session.state() == SessionState::Closing {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Session close not acknowledged");
                    break;
                }
                event = self.session_events.recv() => match event {
                    Some(event) => self.on_session_event(event),
                    None => break,
                },
            }
        }
        self.publish();
    }

    fn open_session(&mut self) {
        let Some(config) = self.session_config() else {
            return;
        };
        if let Err(e) = self.session.open(config, self.is_online()) {
            self.set_error(e);
        }
    }

    fn session_config(&self) -> Option<SessionConfig> {
        let profile = self.profile.as_ref()?;
        Some(SessionConfig {
            behavior_script: self.plan.current().behavior_script.clone(),
            language: profile.language.tag().to_string(),
            voice: self.voice.clone(),
        })
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn set_status(&mut self, text: impl Into<String>) {
        self.notice = Notice::Status(text.into());
    }

    fn set_error(&mut self, e: Error) {
        warn!("{}", e);
        if e.is_session_fatal() {
            self.capture.stop();
            self.mode = Mode::Idle;
        }
        self.notice = Notice::Error(e.user_message());
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }
}

fn placeholder_snapshot() -> Snapshot {
    Snapshot {
        notice: Notice::Status(String::new()),
        activity: Activity::Idle,
        stage_index: 0,
        stage_count: 0,
        stage_name: String::new(),
        session: SessionState::Uninitialized,
        capturing: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Language;
    use crate::playback::TimelineSink;
    use crate::testing::{settle, FakeMicrophone, FakeTransport, Record};
    use crate::transport::CloseInfo;

    struct Harness {
        conversation: Conversation,
        transport: Arc<FakeTransport>,
        mic: FakeMicrophone,
        sink: TimelineSink,
        online: watch::Sender<bool>,
    }

    fn plan() -> StagePlan {
        StagePlan::new(vec![
            ("Introduction".into(), "script zero".into()),
            ("Payment Options".into(), "script one".into()),
            ("Closing".into(), "script two".into()),
        ])
        .unwrap()
    }

    fn profile() -> Profile {
        Profile {
            user_name: "Asha".into(),
            language: Language::English,
        }
    }

    fn harness_with(transport: FakeTransport, online: bool) -> Harness {
        let transport = Arc::new(transport);
        let mic = FakeMicrophone::new();
        let (sink, ended) = TimelineSink::new();
        let (online_tx, online_rx) = watch::channel(online);
        let (conversation, _snapshots) = Conversation::new(ConversationParts {
            plan: plan(),
            transport: transport.clone(),
            microphone: Box::new(mic.clone()),
            playback: Box::new(sink.clone()),
            ended,
            online: online_rx,
            voice: "Aoede".into(),
        });
        Harness {
            conversation,
            transport,
            mic,
            sink,
            online: online_tx,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeTransport::new(), true)
    }

    impl Harness {
        /// Deliver everything the background tasks produced so far.
        async fn pump(&mut self) {
            settle().await;
            while let Ok(event) = self.conversation.session_events.try_recv() {
                self.conversation.on_session_event(event);
            }
            while let Ok(id) = self.conversation.ended.try_recv() {
                self.conversation.on_segment_ended(id);
            }
        }

        async fn logged_in(mut self) -> Self {
            self.conversation.login(profile());
            self.pump().await;
            self
        }

        fn server_audio(&self, generation: u64, seconds: f64) {
            let samples = vec![0.1; (seconds * 24_000.0) as usize];
            self.transport.sink(generation).message(ServerEvent {
                audio: Some(encode_pcm16(&samples)),
                interrupted: false,
            });
        }

        fn play(&self, seconds: f64) {
            let mut block = vec![0.0; (seconds * 24_000.0) as usize];
            self.sink.render(&mut block);
        }

        fn snapshot(&self) -> Snapshot {
            self.conversation.snapshot()
        }
    }

    #[tokio::test]
    async fn test_login_opens_first_stage() {
        let h = harness().logged_in().await;
        let snapshot = h.snapshot();

        assert_eq!(snapshot.session, SessionState::Open);
        assert_eq!(snapshot.status(), Some(CONNECTED));
        assert_eq!(snapshot.activity, Activity::Idle);
        assert_eq!(h.transport.scripts(), vec!["script zero".to_string()]);
    }

    #[tokio::test]
    async fn test_talk_before_login_is_ignored() {
        let mut h = harness();
        h.conversation.start_talk().await;

        assert_eq!(h.mic.acquired(), 0);
        assert_eq!(h.snapshot().status(), Some(HOLD_TO_TALK));
    }

    #[tokio::test]
    async fn test_offline_at_startup() {
        let h = harness_with(FakeTransport::new(), false);
        assert_eq!(
            h.snapshot().error(),
            Some("You are offline. Please check your internet connection.")
        );
    }

    #[tokio::test]
    async fn test_talk_streams_frames_then_thinks() {
        let mut h = harness().logged_in().await;

        h.conversation.start_talk().await;
        assert_eq!(h.snapshot().activity, Activity::Listening);
        assert_eq!(h.snapshot().status(), Some(LISTENING));

        h.mic.push(vec![0.5, -0.5]);
        let frame = h.conversation.capture.next_frame().await;
        h.conversation.on_frame(frame);
        h.pump().await;
        assert_eq!(h.transport.frames(1), vec![encode_pcm16(&[0.5, -0.5])]);

        h.conversation.stop_talk();
        assert_eq!(h.snapshot().activity, Activity::Thinking);
        assert_eq!(h.snapshot().status(), Some(THINKING));
        assert!(!h.mic.is_held());

        h.conversation.stop_talk();
        assert_eq!(h.mic.released(), 1);
    }

    #[tokio::test]
    async fn test_agent_speech_is_gapless_then_idle() {
        let mut h = harness().logged_in().await;

        h.server_audio(1, 1.0);
        h.server_audio(1, 0.5);
        h.pump().await;

        assert_eq!(h.conversation.playback.cursor(), 1.5);
        assert_eq!(h.snapshot().activity, Activity::Talking);
        assert_eq!(h.snapshot().status(), Some(SPEAKING));

        h.play(1.0);
        h.pump().await;
        assert_eq!(h.snapshot().activity, Activity::Talking);

        h.play(0.5);
        h.pump().await;
        assert_eq!(h.snapshot().activity, Activity::Idle);
        assert_eq!(h.snapshot().status(), Some(HOLD_TO_TALK));
    }

    #[tokio::test]
    async fn test_barge_in_while_capturing() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;
        h.server_audio(1, 1.0);
        h.pump().await;
        assert_eq!(h.snapshot().activity, Activity::Talking);

        h.conversation.start_talk().await;
        assert_eq!(h.conversation.playback.active_count(), 0);
        assert_eq!(h.conversation.playback.cursor(), 0.0);
        assert_eq!(h.snapshot().activity, Activity::Listening);
        assert_eq!(h.snapshot().status(), Some(LISTENING));
        assert_eq!(h.mic.acquired(), 1);
    }

    #[tokio::test]
    async fn test_speech_ends_while_capturing() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;
        h.server_audio(1, 0.5);
        h.pump().await;
        assert_eq!(h.snapshot().status(), Some(SPEAKING));

        h.play(0.5);
        h.pump().await;
        assert!(h.snapshot().capturing);
        assert_eq!(h.snapshot().activity, Activity::Listening);
        assert_eq!(h.snapshot().status(), Some(LISTENING));
    }

    #[tokio::test]
    async fn test_server_interrupt_while_capturing() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;
        h.server_audio(1, 1.0);
        h.pump().await;

        h.transport.sink(1).message(ServerEvent {
            audio: None,
            interrupted: true,
        });
        h.pump().await;

        assert_eq!(h.snapshot().activity, Activity::Listening);
        assert_eq!(h.snapshot().status(), Some(LISTENING));
    }

    #[tokio::test]
    async fn test_stopped_segment_end_does_not_idle() {
        let mut h = harness().logged_in().await;
        h.server_audio(1, 0.1);
        h.pump().await;
        let stale = 1;

        h.conversation.playback.interrupt();
        h.server_audio(1, 1.0);
        h.pump().await;
        h.conversation.on_segment_ended(stale);

        assert_eq!(h.snapshot().activity, Activity::Talking);
        assert_eq!(h.snapshot().status(), Some(SPEAKING));
    }

    #[tokio::test]
    async fn test_server_interrupt_while_idle() {
        let mut h = harness().logged_in().await;
        h.server_audio(1, 1.0);
        h.pump().await;

        h.transport.sink(1).message(ServerEvent {
            audio: None,
            interrupted: true,
        });
        h.pump().await;

        assert_eq!(h.snapshot().activity, Activity::Idle);
        assert_eq!(h.snapshot().status(), Some(HOLD_TO_TALK));
        assert_eq!(h.conversation.playback.cursor(), 0.0);
    }

    #[tokio::test]
    async fn test_audio_and_interrupt_in_same_message() {
        let mut h = harness().logged_in().await;
        h.transport.sink(1).message(ServerEvent {
            audio: Some(encode_pcm16(&[0.1; 2400])),
            interrupted: true,
        });
        h.pump().await;

        assert_eq!(h.conversation.playback.active_count(), 0);
        assert_eq!(h.snapshot().activity, Activity::Idle);
    }

    #[tokio::test]
    async fn test_advance_replaces_session() {
        let mut h = harness().logged_in().await;

        h.conversation.next_stage();
        assert_eq!(h.snapshot().status(), Some("Transitioning to: Payment Options"));
        assert_eq!(h.snapshot().session, SessionState::Opening);

        h.pump().await;
        assert_eq!(h.snapshot().stage_index, 1);
        assert_eq!(h.snapshot().session, SessionState::Open);
        assert_eq!(
            h.transport.scripts(),
            vec!["script zero".to_string(), "script one".to_string()]
        );
        assert!(h.transport.log().contains(&Record::Closed(1)));
    }

    #[tokio::test]
    async fn test_replace_while_capturing_stops_capture_first() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;

        h.conversation.next_stage();
        assert!(!h.mic.is_held());
        assert!(!h.snapshot().capturing);
        assert!(!h.transport.log().contains(&Record::Closed(1)));

        h.pump().await;
        assert!(h.transport.log().contains(&Record::Closed(1)));
        assert!(h.transport.frames(1).is_empty());
        assert!(h.transport.frames(2).is_empty());
    }

    #[tokio::test]
    async fn test_offline_advance_increments_and_fails() {
        let mut h = harness().logged_in().await;
        h.online.send_replace(false);

        h.conversation.next_stage();
        h.pump().await;

        let snapshot = h.snapshot();
        assert_eq!(snapshot.stage_index, 1);
        assert_eq!(snapshot.session, SessionState::Failed);
        assert_eq!(
            snapshot.error(),
            Some("Cannot initialize session. You are offline.")
        );
        assert_eq!(h.transport.scripts().len(), 1);
    }

    #[tokio::test]
    async fn test_advance_at_last_stage_is_noop() {
        let mut h = harness().logged_in().await;
        h.conversation.next_stage();
        h.conversation.next_stage();
        h.pump().await;
        assert_eq!(h.snapshot().stage_index, 2);

        h.conversation.next_stage();
        h.pump().await;
        assert_eq!(h.snapshot().stage_index, 2);
        assert_eq!(h.transport.scripts().len(), 3);
    }

    #[tokio::test]
    async fn test_reset_mid_capture() {
        let mut h = harness().logged_in().await;
        h.conversation.next_stage();
        h.pump().await;
        h.conversation.start_talk().await;
        h.server_audio(2, 1.0);
        h.pump().await;
        h.conversation.set_error(Error::Capture("glitch".into()));
        assert!(h.snapshot().capturing);

        h.conversation.reset();

        let snapshot = h.snapshot();
        assert!(!snapshot.capturing);
        assert!(!h.mic.is_held());
        assert_eq!(snapshot.stage_index, 0);
        assert!(snapshot.error().is_none());
        assert_eq!(snapshot.status(), Some(CLEARED));
        assert_eq!(snapshot.activity, Activity::Idle);
        assert_eq!(snapshot.session, SessionState::Opening);

        h.pump().await;
        assert_eq!(h.snapshot().session, SessionState::Open);
        assert_eq!(h.transport.scripts().last().map(String::as_str), Some("script zero"));
    }

    #[tokio::test]
    async fn test_offline_talk_is_refused() {
        let mut h = harness().logged_in().await;
        h.online.send_replace(false);

        h.conversation.start_talk().await;
        assert_eq!(
            h.snapshot().error(),
            Some("Cannot start recording. You are offline.")
        );
        assert!(!h.snapshot().capturing);
        assert_eq!(h.mic.acquired(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let mut h = harness().logged_in().await;
        h.mic.fail_next(crate::capture::MicError::PermissionDenied);

        h.conversation.start_talk().await;
        assert_eq!(
            h.snapshot().error(),
            Some("Microphone access denied. Please allow microphone access to continue.")
        );
        assert!(!h.snapshot().capturing);
        assert_eq!(h.snapshot().activity, Activity::Idle);
    }

    #[tokio::test]
    async fn test_unclean_close_stops_capture() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;

        h.transport.sink(1).closed(CloseInfo {
            clean: false,
            code: 1006,
            reason: String::new(),
        });
        h.pump().await;

        let snapshot = h.snapshot();
        assert_eq!(snapshot.session, SessionState::Failed);
        assert!(!snapshot.capturing);
        assert_eq!(snapshot.activity, Activity::Idle);
        assert_eq!(
            snapshot.error(),
            Some("The connection was closed unexpectedly. Reset to start a new session.")
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_session_fatal() {
        let mut h = harness_with(FakeTransport::failing_sends(), true).logged_in().await;
        h.conversation.start_talk().await;

        h.conversation.on_frame(Some(vec![0.0; 256]));
        h.pump().await;

        assert_eq!(h.snapshot().session, SessionState::Failed);
        assert!(!h.snapshot().capturing);
        assert_eq!(
            h.snapshot().error(),
            Some("A real-time connection error occurred. Please check your internet and try again.")
        );
    }

    #[tokio::test]
    async fn test_failed_session_audio_is_not_played() {
        let mut h = harness_with(FakeTransport::failing_sends(), true).logged_in().await;
        h.conversation.start_talk().await;
        h.conversation.on_frame(Some(vec![0.0; 256]));
        h.pump().await;
        assert_eq!(h.snapshot().session, SessionState::Failed);

        h.server_audio(1, 1.0);
        h.pump().await;

        assert!(!h.conversation.playback.is_talking());
        assert_eq!(h.snapshot().activity, Activity::Idle);
        assert_eq!(
            h.snapshot().error(),
            Some("A real-time connection error occurred. Please check your internet and try again.")
        );
    }

    #[tokio::test]
    async fn test_odd_length_audio_is_session_fatal() {
        let mut h = harness().logged_in().await;
        h.transport.sink(1).message(ServerEvent {
            audio: Some(vec![1, 2, 3]),
            interrupted: false,
        });
        h.pump().await;

        assert_eq!(h.snapshot().session, SessionState::Failed);
        assert!(h.snapshot().error().is_some());
        assert!(!h.conversation.playback.is_talking());
    }

    #[tokio::test]
    async fn test_open_refusal_shows_detail() {
        let h = harness_with(FakeTransport::failing("Unsupported language"), true)
            .logged_in()
            .await;
        assert_eq!(h.snapshot().error(), Some("Session error: Unsupported language"));
        assert_eq!(h.snapshot().session, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_clean_close_by_peer() {
        let mut h = harness().logged_in().await;
        h.transport.sink(1).closed(CloseInfo {
            clean: true,
            code: 1000,
            reason: String::new(),
        });
        h.pump().await;

        assert_eq!(h.snapshot().session, SessionState::Closed);
        assert_eq!(h.snapshot().status(), Some(CLOSED));
    }

    #[tokio::test]
    async fn test_connectivity_lost_and_restored() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;

        h.online.send_replace(false);
        h.conversation.on_connectivity_changed();
        assert_eq!(
            h.snapshot().error(),
            Some("Connection lost. Please check your internet connection.")
        );
        assert!(!h.snapshot().capturing);

        h.online.send_replace(true);
        h.conversation.on_connectivity_changed();
        assert_eq!(h.snapshot().status(), Some(BACK_ONLINE));
    }

    #[tokio::test]
    async fn test_back_online_after_failure_suggests_reset() {
        let mut h = harness_with(FakeTransport::new(), false);
        h.conversation.login(profile());
        h.pump().await;
        assert_eq!(h.snapshot().session, SessionState::Failed);

        h.online.send_replace(true);
        h.conversation.on_connectivity_changed();
        assert_eq!(h.snapshot().status(), Some(BACK_ONLINE_RESET));
    }

    #[tokio::test]
    async fn test_microphone_stream_end_stops_capture() {
        let mut h = harness().logged_in().await;
        h.conversation.start_talk().await;

        h.mic.end_stream();
        let frame = h.conversation.capture.next_frame().await;
        h.conversation.on_frame(frame);

        assert!(!h.snapshot().capturing);
        assert_eq!(h.snapshot().activity, Activity::Thinking);
    }

    #[tokio::test]
    async fn test_run_loop_login_and_shutdown() {
        let h = harness();
        let transport = h.transport.clone();
        let mut snapshots = h.conversation.snapshots.subscribe();
        let (commands, rx) = mpsc::channel(8);
        let task = tokio::spawn(h.conversation.run(rx));

        commands.send(Command::Login(profile())).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            snapshots.wait_for(|s| s.session == SessionState::Open),
        )
        .await
        .expect("session never opened")
        .unwrap();

        commands.send(Command::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("run loop did not stop")
            .unwrap();

        assert!(transport.log().contains(&Record::Closed(1)));
        assert_eq!(snapshots.borrow().session, SessionState::Closed);
    }
}
