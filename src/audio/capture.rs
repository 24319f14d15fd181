//! # Microphone Capture Pipeline
//!
//! Turns device audio blocks into wire-ready PCM16 chunks and keeps a
//! smoothed loudness level for UI animation.
//!
//! ## Pipeline Stages:
//! 1. **Device seam**: a `CaptureBackend` delivers mono f32 blocks at 16 kHz
//!    in arrival order (the cpal backend in `device.rs` handles downmixing
//!    and resampling before blocks get here)
//! 2. **Level metering**: per-block RMS, exponentially smoothed
//! 3. **Encoding**: blocks become little-endian PCM16 via the codec
//!
//! The pipeline itself does no batching; the session state machine
//! accumulates chunks and flushes them on its 200 ms timer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec;
use crate::error::ClientResult;

/// Callback receiving mono f32 blocks from the device.
pub type BlockHandler = Box<dyn FnMut(&[f32]) + Send>;

/// The device seam for microphone input.
///
/// ## Contract:
/// - `open` acquires the device and starts delivering blocks to the handler;
///   blocks arrive in order and none are dropped while the backend is open.
/// - `close` releases every acquired handle exactly once and is safe to call
///   repeatedly, including after a failed or partial `open`.
pub trait CaptureBackend: Send {
    fn open(&mut self, on_block: BlockHandler) -> ClientResult<()>;
    fn close(&mut self);
}

/// Shared, lock-free loudness meter.
///
/// ## Smoothing:
/// `level = 0.7 * previous + 0.3 * rms`, clamped to [0, 1]. The smoothed
/// value is stored as f32 bits in an `AtomicU32` so the audio callback can
/// publish it without locking.
#[derive(Clone)]
pub struct AudioLevel {
    bits: Arc<AtomicU32>,
}

impl AudioLevel {
    pub fn new() -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(0.0f32.to_bits())),
        }
    }

    /// Fold a new RMS measurement into the smoothed level and return it.
    pub fn update(&self, rms: f32) -> f32 {
        let previous = self.get();
        let smoothed = (previous * 0.7 + rms * 0.3).clamp(0.0, 1.0);
        self.bits.store(smoothed.to_bits(), Ordering::Relaxed);
        smoothed
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.bits.store(0.0f32.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AudioLevel {
    fn default() -> Self {
        Self::new()
    }
}

/// Root-mean-square of a block of normalized samples.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Microphone capture pipeline.
///
/// Owns the capture backend and wires device blocks through metering and
/// encoding to the chunk handler. One pipeline per call; `stop` is the
/// single release point for the device handles.
pub struct CapturePipeline {
    backend: Box<dyn CaptureBackend>,
    level: AudioLevel,
    running: bool,
}

impl CapturePipeline {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            level: AudioLevel::new(),
            running: false,
        }
    }

    /// Handle to the shared loudness meter.
    pub fn level(&self) -> AudioLevel {
        self.level.clone()
    }

    /// Open the device and start delivering encoded chunks.
    ///
    /// ## Parameters:
    /// - `on_chunk`: called once per device block with the PCM16 bytes and
    ///   the current smoothed loudness level
    ///
    /// ## Errors:
    /// `DeviceUnavailable` when the microphone cannot be acquired. Any
    /// partially acquired handle is released before the error is returned.
    pub fn start(
        &mut self,
        mut on_chunk: impl FnMut(Vec<u8>, f32) + Send + 'static,
    ) -> ClientResult<()> {
        if self.running {
            debug!("capture pipeline already running");
            return Ok(());
        }

        let level = self.level.clone();
        let result = self.backend.open(Box::new(move |block| {
            let rms = calculate_rms(block);
            let smoothed = level.update(rms);
            on_chunk(codec::float_to_pcm16(block), smoothed);
        }));

        match result {
            Ok(()) => {
                self.running = true;
                debug!("capture pipeline started");
                Ok(())
            }
            Err(e) => {
                // Release whatever the backend managed to acquire.
                self.backend.close();
                warn!("capture start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop capture and release the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.backend.close();
        self.level.reset();
        self.running = false;
        debug!("capture pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Backend stub that counts opens/closes and lets tests push blocks.
    struct StubBackend {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_open: bool,
        handler: Arc<Mutex<Option<BlockHandler>>>,
    }

    impl StubBackend {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<Mutex<Option<BlockHandler>>>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            let handler = Arc::new(Mutex::new(None));
            (
                Self {
                    opens: opens.clone(),
                    closes: closes.clone(),
                    fail_open: false,
                    handler: handler.clone(),
                },
                opens,
                closes,
                handler,
            )
        }
    }

    impl CaptureBackend for StubBackend {
        fn open(&mut self, on_block: BlockHandler) -> ClientResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(ClientError::DeviceUnavailable("stub".to_string()));
            }
            *self.handler.lock().unwrap() = Some(on_block);
            Ok(())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.handler.lock().unwrap() = None;
        }
    }

    #[test]
    fn test_blocks_become_pcm_chunks() {
        let (backend, _, _, handler) = StubBackend::new();
        let mut pipeline = CapturePipeline::new(Box::new(backend));

        let chunks: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        pipeline
            .start(move |bytes, _level| sink.lock().unwrap().push(bytes))
            .unwrap();

        // 160 samples of 16 kHz audio = one 10 ms block = 320 bytes.
        let block = vec![0.25f32; 160];
        (handler.lock().unwrap().as_mut().unwrap())(&block);

        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 320);
    }

    #[test]
    fn test_failed_open_releases_partial_handles() {
        let (mut backend, _, closes, _) = StubBackend::new();
        backend.fail_open = true;
        let mut pipeline = CapturePipeline::new(Box::new(backend));

        let result = pipeline.start(|_, _| {});
        assert!(matches!(result, Err(ClientError::DeviceUnavailable(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (backend, opens, closes, _) = StubBackend::new();
        let mut pipeline = CapturePipeline::new(Box::new(backend));

        pipeline.start(|_, _| {}).unwrap();
        pipeline.stop();
        pipeline.stop();
        pipeline.stop();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        // One close from stop; later stops are no-ops, drop adds none.
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_device() {
        let (backend, _, closes, _) = StubBackend::new();
        {
            let mut pipeline = CapturePipeline::new(Box::new(backend));
            pipeline.start(|_, _| {}).unwrap();
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_level_smoothing() {
        let level = AudioLevel::new();
        // First update from zero: 0.0 * 0.7 + 1.0 * 0.3 = 0.3
        let first = level.update(1.0);
        assert!((first - 0.3).abs() < 1e-6);
        // Second: 0.3 * 0.7 + 1.0 * 0.3 = 0.51
        let second = level.update(1.0);
        assert!((second - 0.51).abs() < 1e-6);
        // Clamped to [0, 1] even for out-of-range RMS.
        for _ in 0..100 {
            level.update(10.0);
        }
        assert!(level.get() <= 1.0);
    }

    #[test]
    fn test_rms() {
        assert_eq!(calculate_rms(&[]), 0.0);
        assert!((calculate_rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
