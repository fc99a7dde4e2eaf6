//! Gapless playback of streamed speech
//!
//! Fragments arrive one at a time and are laid end to end on a shared audio
//! clock. The scheduler only decides *when* each segment plays; a
//! [`PlaybackSink`] does the rendering and reports when segments finish.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::pcm::{duration_secs, OUTPUT_SAMPLE_RATE};

/// Identifies one scheduled segment
pub type SegmentId = u64;

/// Audio output driven by a clock measured in seconds
pub trait PlaybackSink: Send {
    /// Seconds of audio the device has played since it was created.
    fn current_time(&self) -> f64;

    /// Schedule `samples` to start at `at` seconds on the sink clock.
    /// Completion is reported through the sink's ended channel.
    fn start(&mut self, id: SegmentId, samples: Vec<f32>, at: f64);

    /// Force-stop a segment. No completion is reported for it.
    fn stop(&mut self, id: SegmentId);
}

/// Where a segment landed on the clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: SegmentId,
    pub start: f64,
    pub duration: f64,
    /// The active set was empty before this segment
    pub started_talking: bool,
}

/// Schedules decoded segments back-to-back and tracks which are still playing
pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    cursor: f64,
    active: BTreeSet<SegmentId>,
    next_id: SegmentId,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            cursor: 0.0,
            active: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Schedule a segment directly after the previous one, or now if the
    /// previous one already finished.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Scheduled {
        let id = self.next_id;
        self.next_id += 1;

        let now = self.sink.current_time();
        self.cursor = self.cursor.max(now);
        let start = self.cursor;
        let duration = duration_secs(samples.len(), OUTPUT_SAMPLE_RATE);
        let started_talking = self.active.is_empty();

        self.active.insert(id);
        self.sink.start(id, samples, start);
        self.cursor += duration;

        trace!("Segment {} at {:.3}s for {:.3}s", id, start, duration);
        Scheduled {
            id,
            start,
            duration,
            started_talking,
        }
    }

    /// Force-stop everything and rewind the cursor. Returns whether any
    /// segment was playing.
    pub fn interrupt(&mut self) -> bool {
        let was_talking = !self.active.is_empty();
        for id in std::mem::take(&mut self.active) {
            self.sink.stop(id);
        }
        self.cursor = 0.0;
        if was_talking {
            debug!("Playback interrupted");
        }
        was_talking
    }

    /// A segment finished. Returns true when it was the last active one.
    /// Unknown ids, including force-stopped segments, are ignored.
    pub fn on_ended(&mut self, id: SegmentId) -> bool {
        if !self.active.remove(&id) {
            trace!("Ignoring end of inactive segment {}", id);
            return false;
        }
        self.active.is_empty()
    }

    pub fn is_talking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

struct TimelineSegment {
    id: SegmentId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl TimelineSegment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sample-accurate mixer; its clock advances only as audio is rendered
pub struct Timeline {
    rate: u32,
    position: u64,
    segments: Vec<TimelineSegment>,
    flush: bool,
}

impl Timeline {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            position: 0,
            segments: Vec::new(),
            flush: false,
        }
    }

    pub fn now(&self) -> f64 {
        self.position as f64 / self.rate as f64
    }

    pub fn schedule(&mut self, id: SegmentId, samples: Vec<f32>, at: f64) {
        let start_frame = ((at * self.rate as f64).round() as u64).max(self.position);
        self.segments.push(TimelineSegment {
            id,
            start_frame,
            samples,
        });
    }

    /// Drop a segment without reporting it; the device buffer should be flushed.
    pub fn cancel(&mut self, id: SegmentId) {
        let before = self.segments.len();
        self.segments.retain(|s| s.id != id);
        if self.segments.len() != before {
            self.flush = true;
        }
    }

    /// Mix the next `out.len()` frames and advance the clock. Returns the
    /// ids of segments that finished within this block.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<SegmentId> {
        out.fill(0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for segment in &self.segments {
            let from = segment.start_frame.max(block_start);
            let to = segment.end_frame().min(block_end);
            for frame in from..to {
                let sample = segment.samples[(frame - segment.start_frame) as usize];
                out[(frame - block_start) as usize] += sample;
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = block_end;
        let mut ended = Vec::new();
        self.segments.retain(|s| {
            if s.end_frame() <= block_end {
                ended.push(s.id);
                false
            } else {
                true
            }
        });
        ended
    }

    /// Whether a cancel happened since the last call.
    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.flush)
    }

    pub fn pending(&self) -> usize {
        self.segments.len()
    }
}

/// [`PlaybackSink`] over a shared [`Timeline`]
///
/// Clones share the timeline: the scheduler holds one, the render thread
/// another.
#[derive(Clone)]
pub struct TimelineSink {
    timeline: Arc<Mutex<Timeline>>,
    ended: mpsc::UnboundedSender<SegmentId>,
}

impl TimelineSink {
    /// Create a sink at the output rate, and the channel its completions arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SegmentId>) {
        Self::with_rate(OUTPUT_SAMPLE_RATE)
    }

    pub fn with_rate(rate: u32) -> (Self, mpsc::UnboundedReceiver<SegmentId>) {
        let (ended, rx) = mpsc::unbounded_channel();
        let sink = Self {
            timeline: Arc::new(Mutex::new(Timeline::new(rate))),
            ended,
        };
        (sink, rx)
    }

    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render one block and report finished segments. Returns whether the
    /// device should drop what it has buffered.
    pub fn render(&self, out: &mut [f32]) -> bool {
        let (ended, flush) = {
            let mut timeline = self.timeline();
            let ended = timeline.render(out);
            (ended, timeline.take_flush())
        };
        for id in ended {
            let _ = self.ended.send(id);
        }
        flush
    }
}

impl PlaybackSink for TimelineSink {
    fn current_time(&self) -> f64 {
        self.timeline().now()
    }

    fn start(&mut self, id: SegmentId, samples: Vec<f32>, at: f64) {
        if samples.is_empty() {
            let _ = self.ended.send(id);
            return;
        }
        self.timeline().schedule(id, samples, at);
    }

    fn stop(&mut self, id: SegmentId) {
        self.timeline().cancel(id);
    }
}
