//! PulseAudio device backends
//!
//! Capture and playback each run on a dedicated OS thread using PulseAudio's
//! simple API; they talk to the async side only through channels and the
//! shared [`TimelineSink`].

use anyhow::anyhow;
use async_trait::async_trait;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::capture::{MicError, Microphone};
use crate::pcm::{FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::playback::TimelineSink;

/// Frames rendered per playback write (20 ms).
const RENDER_BLOCK: usize = OUTPUT_SAMPLE_RATE as usize / 50;

fn classify(e: PAErr) -> MicError {
    let code = e.0.abs();
    if code == Code::Access as i32 {
        MicError::PermissionDenied
    } else if code == Code::NoEntity as i32 {
        MicError::NotFound
    } else {
        MicError::Other(e.to_string().unwrap_or_else(|| format!("PulseAudio error {}", e.0)))
    }
}

struct CaptureWorker {
    shutdown: Arc<AtomicBool>,
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Microphone on a PulseAudio source
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
    worker: Option<CaptureWorker>,
}

impl PulseMicrophone {
    pub fn new(app_name: &str, device: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device,
            worker: None,
        }
    }
}

#[async_trait]
impl Microphone for PulseMicrophone {
    async fn acquire(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, MicError> {
        self.release();

        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let app_name = self.app_name.clone();
        let device = self.device.clone();
        let flag = shutdown.clone();
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture(app_name, device, frames_tx, ready_tx, flag))
            .map_err(|e| MicError::Other(format!("capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { shutdown });
                Ok(frames_rx)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MicError::Other("capture thread exited".to_string())),
        }
    }

    fn release(&mut self) {
        if self.worker.take().is_some() {
            debug!("Microphone released");
        }
    }
}

fn run_capture(
    app_name: String,
    device: Option<String>,
    frames: mpsc::Sender<Vec<f32>>,
    ready: oneshot::Sender<Result<(), MicError>>,
    shutdown: Arc<AtomicBool>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: INPUT_SAMPLE_RATE,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Record,
        device.as_deref(),
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(e) => {
            let _ = ready.send(Err(classify(e)));
            return;
        }
    };
    info!("Recording from {}", device.as_deref().unwrap_or("default source"));
    let _ = ready.send(Ok(()));

    let mut buffer = vec![0u8; FRAME_SIZE * 4];
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut buffer) {
            error!("Microphone read failed: {}", e);
            break;
        }
        let frame = buffer
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if frames.blocking_send(frame).is_err() {
            break;
        }
    }
    debug!("Capture thread finished");
}

/// Render thread feeding a [`TimelineSink`] to the default PulseAudio sink.
/// Dropping it stops the thread.
pub struct PulsePlayback {
    shutdown: Arc<AtomicBool>,
}

impl PulsePlayback {
    pub fn start(app_name: &str, sink: TimelineSink) -> anyhow::Result<Self> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: OUTPUT_SAMPLE_RATE,
        };
        // About 60 ms of device buffering
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: (RENDER_BLOCK * 2 * 3) as u32,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let app_name = app_name.to_string();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    None,
                    "agent speech",
                    &spec,
                    None,
                    Some(&attr),
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(classify(e)));
                        return;
                    }
                };
                render_loop(simple, sink, flag);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { shutdown }),
            Ok(Err(e)) => Err(anyhow!("opening playback device: {}", e)),
            Err(_) => Err(anyhow!("playback thread exited")),
        }
    }
}

impl Drop for PulsePlayback {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn render_loop(simple: Simple, sink: TimelineSink, shutdown: Arc<AtomicBool>) {
    let mut block = vec![0.0f32; RENDER_BLOCK];
    let mut bytes = Vec::with_capacity(RENDER_BLOCK * 2);

    while !shutdown.load(Ordering::Relaxed) {
        if sink.render(&mut block) {
            if let Err(e) = simple.flush() {
                warn!("Playback flush failed: {}", e);
            }
        }
        bytes.clear();
        for &sample in &block {
            let value = (sample * 32767.0) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        // Blocks until the device has room, which paces the timeline
        if let Err(e) = simple.write(&bytes) {
            error!("Playback write failed: {}", e);
            break;
        }
    }
    if let Err(e) = simple.drain() {
        debug!("Playback drain failed: {}", e);
    }
    debug!("Playback thread finished");
}

/// A PulseAudio capture source
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub is_monitor: bool,
}

/// List capture sources, monitors included.
pub fn list_input_devices() -> anyhow::Result<Vec<InputDevice>> {
    let mut proplist = Proplist::new().ok_or_else(|| anyhow!("failed to create proplist"))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "stagecall-device-lister")
        .map_err(|()| anyhow!("failed to set application name"))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| anyhow!("failed to create mainloop"))?;
    let mut context = Context::new_with_proplist(&mainloop, "stagecall-context", &proplist)
        .ok_or_else(|| anyhow!("failed to create context"))?;
    context.connect(None, ContextFlagSet::NOFLAGS, None)?;

    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(anyhow!("connection to PulseAudio failed"));
            }
            _ => {}
        }
    }

    let devices = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(RefCell::new(false));
    let (devices_cb, done_cb) = (devices.clone(), done.clone());

    let _op = context.introspect().get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                devices_cb.borrow_mut().push(InputDevice {
                    name: name.to_string(),
                    description: description.to_string(),
                    sample_rate: info.sample_spec.rate,
                    channels: info.sample_spec.channels,
                    is_monitor: info.monitor_of_sink.is_some() || name.contains("monitor"),
                });
            }
        }
        ListResult::End => *done_cb.borrow_mut() = true,
        ListResult::Error => {
            error!("Error listing audio devices");
            *done_cb.borrow_mut() = true;
        }
    });

    while !*done.borrow() {
        iterate(&mut mainloop)?;
    }

    context.disconnect();
    mainloop.quit(Retval(0));
    let devices = devices.borrow().clone();
    Ok(devices)
}

fn iterate(mainloop: &mut Mainloop) -> anyhow::Result<()> {
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => Err(anyhow!("mainloop iterate failed")),
        IterateResult::Success(_) => Ok(()),
    }
}
