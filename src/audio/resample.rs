//! # Sample Rate Conversion
//!
//! Two resamplers for the two directions audio flows through the client:
//!
//! - **Playback** (24 kHz agent speech → output device rate): `FftResampler`,
//!   a high-quality FFT-based converter. A fixed input chunk of latency is
//!   acceptable here because playback is already scheduled ahead of the clock.
//! - **Capture** (input device rate → 16 kHz): `LinearResampler`, stateful
//!   linear interpolation with zero algorithmic latency, so microphone chunks
//!   reach the wire as soon as they arrive.
//!
//! Both are streaming: state carries across calls so chunk boundaries do not
//! produce discontinuities.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// High-quality streaming resampler for the playback path.
///
/// Wraps rubato's `FftFixedIn` (fixed input chunk size, variable output
/// size), buffering input internally until a full chunk is available.
pub struct FftResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<Vec<f32>>,
    output_buffer: Vec<Vec<f32>>,
}

impl FftResampler {
    const CHUNK_SIZE: usize = 1024;

    pub fn new(input_rate: u32, output_rate: u32) -> ClientResult<Self> {
        let resampler = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            Self::CHUNK_SIZE,
            2, // sub-chunks
            1, // mono
        )
        .map_err(|e| ClientError::PlaybackInit(format!("resampler setup failed: {}", e)))?;

        debug!(input_rate, output_rate, "created playback resampler");

        Ok(Self {
            resampler,
            input_buffer: vec![Vec::new()],
            output_buffer: vec![Vec::new()],
        })
    }

    /// Resample a chunk of mono f32 audio.
    ///
    /// Input shorter than the internal chunk size is buffered; the output of
    /// a single call may therefore be empty or cover more than one input
    /// call's worth of audio.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        self.input_buffer[0].extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let frames_needed = self.resampler.input_frames_next();
            if self.input_buffer[0].len() < frames_needed {
                break;
            }

            let chunk: Vec<f32> = self.input_buffer[0].drain(0..frames_needed).collect();
            let input_chunk = vec![chunk];

            let output_frames = self.resampler.output_frames_next();
            self.output_buffer[0].resize(output_frames, 0.0);

            match self
                .resampler
                .process_into_buffer(&input_chunk, &mut self.output_buffer, None)
            {
                Ok((_, out_len)) => output.extend_from_slice(&self.output_buffer[0][..out_len]),
                Err(e) => warn!("resampler process error: {}", e),
            }
        }

        output
    }
}

/// Zero-latency streaming resampler for the capture path.
///
/// Linear interpolation with a fractional read position preserved across
/// calls, so a microphone stream can be converted chunk by chunk without
/// lookahead or buffering.
pub struct LinearResampler {
    /// Input rate over output rate, e.g. 48000/16000 = 3.0.
    ratio: f64,
    /// Fractional position in the input stream, carried across calls.
    fractional_pos: f64,
    /// Last sample of the previous chunk, for interpolation at boundaries.
    prev_sample: f32,
    initialized: bool,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            ratio: input_rate as f64 / output_rate as f64,
            fractional_pos: 0.0,
            prev_sample: 0.0,
            initialized: false,
        }
    }

    /// Resample a chunk of mono f32 audio, maintaining state across calls.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let estimated = (input.len() as f64 / self.ratio) as usize + 2;
        let mut output = Vec::with_capacity(estimated);

        if !self.initialized {
            self.prev_sample = input[0];
            self.initialized = true;
        }

        while self.fractional_pos < input.len() as f64 {
            let pos = self.fractional_pos;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;

            let sample_a = if idx == 0 && frac < 0.001 {
                self.prev_sample
            } else if idx < input.len() {
                input[idx]
            } else {
                break;
            };

            let sample_b = if idx + 1 < input.len() {
                input[idx + 1]
            } else if idx < input.len() {
                input[idx]
            } else {
                break;
            };

            output.push(sample_a + frac * (sample_b - sample_a));
            self.fractional_pos += self.ratio;
        }

        self.fractional_pos -= input.len() as f64;
        if let Some(&last) = input.last() {
            self.prev_sample = last;
        }

        output
    }
}
