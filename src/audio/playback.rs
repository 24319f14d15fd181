//! # Playback Pipeline
//!
//! Plays the agent's PCM16 speech chunks gaplessly as they stream in.
//!
//! ## Scheduling Model:
//! The pipeline keeps a `scheduled_end` cursor in clock seconds. Every chunk
//! is scheduled to start at `max(now, scheduled_end)` and the cursor advances
//! by the chunk's duration, so consecutive chunks are stitched back to back
//! with no gap and no overlap regardless of network arrival jitter.
//!
//! ## Lazy Initialization:
//! Opening an output device is asynchronous in practice. The pipeline starts
//! in a detached state and queues chunks that arrive before the sink is
//! attached; attachment replays them in order. Audio is never dropped on the
//! startup path.
//!
//! ## Rate Fallback:
//! The agent speaks at 24 kHz; output devices rarely run at that rate. A
//! resampler converts to the sink rate. If the resampler cannot be built the
//! pipeline logs the failure and plays at the native rate instead of
//! dropping audio.

use std::time::Instant;
use tracing::{debug, warn};

use crate::audio::resample::FftResampler;
use crate::codec;

/// Monotonic time source for scheduling, in seconds.
///
/// A trait so tests can drive the schedule with a fake clock.
pub trait Clock: Send {
    fn now(&self) -> f64;
}

/// Wall clock backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// The device seam for speaker output.
///
/// ## Contract:
/// - `write` appends samples to the device queue; the device consumes them
///   in order and plays silence on underrun
/// - `close` releases the device exactly once and is safe to call repeatedly
pub trait PlaybackSink: Send {
    fn sample_rate(&self) -> u32;
    fn write(&mut self, samples: &[f32]);
    fn close(&mut self);
}

enum PipelineState {
    /// Sink not attached yet; chunks are queued for replay.
    Detached { queued: Vec<Vec<u8>> },
    Running {
        sink: Box<dyn PlaybackSink>,
        resampler: Option<FftResampler>,
    },
    Stopped,
}

/// Gapless streaming playback of PCM16 chunks.
pub struct PlaybackPipeline {
    state: PipelineState,
    clock: Box<dyn Clock>,
    /// Sample rate of incoming chunks (nominally 24 kHz).
    source_rate: u32,
    /// Clock time at which the last scheduled chunk finishes.
    scheduled_end: f64,
}

impl PlaybackPipeline {
    pub fn new(source_rate: u32, clock: Box<dyn Clock>) -> Self {
        Self {
            state: PipelineState::Detached { queued: Vec::new() },
            clock,
            source_rate,
            scheduled_end: 0.0,
        }
    }

    /// Attach the output sink and replay any chunks queued while detached.
    ///
    /// Builds a resampler when the sink rate differs from the source rate;
    /// if that fails the pipeline falls back to playing at the native rate.
    pub fn attach(&mut self, sink: Box<dyn PlaybackSink>) {
        let queued = match &mut self.state {
            PipelineState::Detached { queued } => std::mem::take(queued),
            PipelineState::Running { .. } => {
                debug!("playback sink already attached");
                return;
            }
            PipelineState::Stopped => {
                // The call ended while the device was opening.
                let mut sink = sink;
                sink.close();
                return;
            }
        };

        let resampler = if sink.sample_rate() != self.source_rate {
            match FftResampler::new(self.source_rate, sink.sample_rate()) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("{}; playing at native rate", e);
                    None
                }
            }
        } else {
            None
        };

        debug!(
            sink_rate = sink.sample_rate(),
            source_rate = self.source_rate,
            replayed = queued.len(),
            "playback sink attached"
        );

        self.state = PipelineState::Running { sink, resampler };
        for chunk in queued {
            self.enqueue(&chunk);
        }
    }

    /// Schedule a PCM16 chunk for gapless playback.
    ///
    /// ## Returns:
    /// The scheduled start time in clock seconds, or `None` when the chunk
    /// was queued (sink not attached yet) or discarded (pipeline stopped).
    pub fn enqueue(&mut self, bytes: &[u8]) -> Option<f64> {
        match &mut self.state {
            PipelineState::Detached { queued } => {
                queued.push(bytes.to_vec());
                None
            }
            PipelineState::Running { sink, resampler } => {
                let samples = codec::pcm16_to_float(bytes);
                if samples.is_empty() {
                    return None;
                }

                // Duration comes from the source stream; the resampler
                // preserves it even though the sample count changes.
                let duration = samples.len() as f64 / self.source_rate as f64;
                let now = self.clock.now();
                let start = now.max(self.scheduled_end);
                self.scheduled_end = start + duration;

                let output = match resampler {
                    Some(r) => r.process(&samples),
                    None => samples,
                };
                if !output.is_empty() {
                    sink.write(&output);
                }
                Some(start)
            }
            PipelineState::Stopped => {
                debug!("enqueue on stopped playback pipeline ignored");
                None
            }
        }
    }

    /// End-of-turn hint from the server.
    ///
    /// Scheduled audio keeps playing; this only reports when it will finish.
    pub fn flush(&mut self) -> f64 {
        debug!(scheduled_end = self.scheduled_end, "playback flush");
        self.scheduled_end
    }

    /// Close the sink and discard anything not yet scheduled.
    /// Safe to call repeatedly.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, PipelineState::Stopped) {
            PipelineState::Running { mut sink, .. } => {
                sink.close();
                debug!("playback pipeline stopped");
            }
            PipelineState::Detached { queued } if !queued.is_empty() => {
                debug!(discarded = queued.len(), "playback stopped before start");
            }
            _ => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, PipelineState::Stopped)
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Generate the end-of-call confirmation tone.
///
/// A 300 ms, 440 Hz sine with a fast exponential attack (to 0.2 over 20 ms)
/// and a longer exponential decay (back to silence by 250 ms).
pub fn end_call_tone(sample_rate: u32) -> Vec<f32> {
    const FREQ: f32 = 440.0;
    const PEAK: f32 = 0.2;
    const FLOOR: f32 = 0.0001;
    const ATTACK: f32 = 0.02;
    const DECAY_END: f32 = 0.25;
    const LENGTH: f32 = 0.3;

    let total = (sample_rate as f32 * LENGTH) as usize;
    let mut samples = Vec::with_capacity(total);
    for i in 0..total {
        let t = i as f32 / sample_rate as f32;
        let amp = if t < ATTACK {
            FLOOR * (PEAK / FLOOR).powf(t / ATTACK)
        } else if t < DECAY_END {
            PEAK * (FLOOR / PEAK).powf((t - ATTACK) / (DECAY_END - ATTACK))
        } else {
            0.0
        };
        samples.push(amp * (2.0 * std::f32::consts::PI * FREQ * t).sin());
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Settable clock shared between test and pipeline.
    #[derive(Clone)]
    struct FakeClock {
        now: Arc<Mutex<f64>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(0.0)),
            }
        }

        fn set(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    /// Sink that records written samples and counts closes.
    struct RecordingSink {
        rate: u32,
        written: Arc<Mutex<Vec<f32>>>,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingSink {
        fn new(rate: u32) -> (Self, Arc<Mutex<Vec<f32>>>, Arc<AtomicUsize>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let closes = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    rate,
                    written: written.clone(),
                    closes: closes.clone(),
                },
                written,
                closes,
            )
        }
    }

    impl PlaybackSink for RecordingSink {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn write(&mut self, samples: &[f32]) {
            self.written.lock().unwrap().extend_from_slice(samples);
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// PCM16 silence of the given sample count.
    fn silence(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    #[test]
    fn test_gapless_scheduling() {
        let clock = FakeClock::new();
        let (sink, _, _) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock.clone()));
        pipeline.attach(Box::new(sink));

        // Three 100 ms chunks arriving in a burst at t=1.0: they must be
        // scheduled back to back, not stacked on top of each other.
        clock.set(1.0);
        let s1 = pipeline.enqueue(&silence(2400)).unwrap();
        let s2 = pipeline.enqueue(&silence(2400)).unwrap();
        let s3 = pipeline.enqueue(&silence(2400)).unwrap();

        assert!((s1 - 1.0).abs() < 1e-9);
        assert!((s2 - 1.1).abs() < 1e-9);
        assert!((s3 - 1.2).abs() < 1e-9);
        assert!((pipeline.flush() - 1.3).abs() < 1e-9);

        // A chunk arriving after the scheduled audio has drained starts at
        // the current time, not at the stale cursor.
        clock.set(5.0);
        let s4 = pipeline.enqueue(&silence(2400)).unwrap();
        assert!((s4 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_enqueue_before_attach_is_replayed() {
        let clock = FakeClock::new();
        let (sink, written, _) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock));

        // Chunks arrive while the device is still opening.
        assert!(pipeline.enqueue(&silence(240)).is_none());
        assert!(pipeline.enqueue(&silence(240)).is_none());
        assert!(written.lock().unwrap().is_empty());

        pipeline.attach(Box::new(sink));
        assert_eq!(written.lock().unwrap().len(), 480);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let clock = FakeClock::new();
        let (sink, _, closes) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock));
        pipeline.attach(Box::new(sink));

        pipeline.stop();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enqueue_after_stop_is_ignored() {
        let clock = FakeClock::new();
        let (sink, written, _) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock));
        pipeline.attach(Box::new(sink));
        pipeline.stop();

        assert!(pipeline.enqueue(&silence(240)).is_none());
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_attach_after_stop_closes_sink() {
        let clock = FakeClock::new();
        let (sink, _, closes) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock));

        pipeline.stop();
        pipeline.attach(Box::new(sink));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_does_not_stop_playback() {
        let clock = FakeClock::new();
        let (sink, written, closes) = RecordingSink::new(24000);
        let mut pipeline = PlaybackPipeline::new(24000, Box::new(clock));
        pipeline.attach(Box::new(sink));

        pipeline.enqueue(&silence(2400));
        pipeline.flush();
        // Still running: more audio can be scheduled and nothing was closed.
        assert!(pipeline.enqueue(&silence(2400)).is_some());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(written.lock().unwrap().len(), 4800);
    }

    #[test]
    fn test_end_call_tone_shape() {
        let tone = end_call_tone(24000);
        assert_eq!(tone.len(), 7200); // 300 ms at 24 kHz

        let peak = tone.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.2 + 1e-3);
        assert!(peak > 0.1);

        // Tail is silent.
        assert!(tone[7000].abs() < 1e-3);
    }
}
