//! # Audio Device Backends
//!
//! cpal implementations of the capture and playback device seams.
//!
//! ## Threading Model:
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it for its whole life. The thread is told to exit through an
//! atomic run flag; dropping the flag holder never blocks the audio callback.
//!
//! ## Format Handling:
//! Devices run at their native sample rate and channel count. Capture is
//! downmixed to mono and linearly resampled to 16 kHz before blocks leave the
//! backend; playback receives already-resampled samples and only duplicates
//! mono across the device's channels. F32, I16 and U16 device formats are
//! supported, which covers the common hosts.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

use crate::audio::capture::{BlockHandler, CaptureBackend};
use crate::audio::playback::PlaybackSink;
use crate::audio::resample::LinearResampler;
use crate::error::{ClientError, ClientResult};

/// How long to wait for the device thread to report open success/failure.
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Microphone backend: default input device → mono 16 kHz f32 blocks.
pub struct CpalCaptureBackend {
    target_rate: u32,
    running: Arc<AtomicBool>,
    /// Monotonic token invalidating superseded stream threads, so a
    /// close/reopen race can never leave an old thread holding the device.
    run_token: Arc<AtomicU64>,
}

impl CpalCaptureBackend {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            running: Arc::new(AtomicBool::new(false)),
            run_token: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl CaptureBackend for CpalCaptureBackend {
    fn open(&mut self, on_block: BlockHandler) -> ClientResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let run_token = self.run_token.clone();
        let current_token = run_token.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let target_rate = self.target_rate;
        let (ready_tx, ready_rx) = std_mpsc::channel::<ClientResult<()>>();
        let handler = Arc::new(Mutex::new(on_block));

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(
                        "no default input device".to_string(),
                    )));
                    return;
                }
            };

            let config = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "no usable input config: {}",
                        e
                    ))));
                    return;
                }
            };

            let sample_format = config.sample_format();
            let stream_config: StreamConfig = config.into();
            let channels = stream_config.channels as usize;
            let input_rate = stream_config.sample_rate.0;

            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                ?sample_format,
                channels,
                input_rate,
                "opening input device"
            );

            let resampler = Arc::new(Mutex::new(LinearResampler::new(input_rate, target_rate)));

            let stream_result = match sample_format {
                SampleFormat::F32 => {
                    let handler = handler.clone();
                    let resampler = resampler.clone();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[f32], _info| {
                            let mono = downmix_f32(data, channels);
                            deliver(&mono, &resampler, &handler);
                        },
                        |err| error!("capture stream error: {}", err),
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let handler = handler.clone();
                    let resampler = resampler.clone();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[i16], _info| {
                            let mono = downmix_i16_to_f32(data, channels);
                            deliver(&mono, &resampler, &handler);
                        },
                        |err| error!("capture stream error: {}", err),
                        None,
                    )
                }
                SampleFormat::U16 => {
                    let handler = handler.clone();
                    let resampler = resampler.clone();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[u16], _info| {
                            let mono = downmix_u16_to_f32(data, channels);
                            deliver(&mono, &resampler, &handler);
                        },
                        |err| error!("capture stream error: {}", err),
                        None,
                    )
                }
                other => {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "unsupported input sample format: {:?}",
                        other
                    ))));
                    return;
                }
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "failed to build input stream: {}",
                        e
                    ))));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                running.store(false, Ordering::SeqCst);
                let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                    "failed to start input stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // The stream stays alive as long as this thread holds it. A
            // newer open() bumps the token, which retires this thread even
            // if the flag has already been flipped back on.
            while running.load(Ordering::SeqCst)
                && run_token.load(Ordering::SeqCst) == current_token
            {
                thread::sleep(Duration::from_millis(100));
            }
        });

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(result) => result,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(ClientError::DeviceUnavailable(
                    "timed out opening input device".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.run_token.fetch_add(1, Ordering::SeqCst);
    }
}

fn deliver(
    mono: &[f32],
    resampler: &Arc<Mutex<LinearResampler>>,
    handler: &Arc<Mutex<BlockHandler>>,
) {
    let resampled = match resampler.lock() {
        Ok(mut r) => r.process(mono),
        Err(_) => return,
    };
    if resampled.is_empty() {
        return;
    }
    if let Ok(mut h) = handler.lock() {
        (*h)(&resampled);
    }
}

/// Speaker sink: shared sample queue drained by the device callback.
///
/// `write` appends mono f32 samples; the output callback pulls them in order
/// and plays silence on underrun, which is exactly the behavior the gapless
/// scheduler relies on during wall-clock gaps between turns.
pub struct CpalPlaybackSink {
    rate: u32,
    queue: Arc<Mutex<VecDeque<f32>>>,
    running: Arc<AtomicBool>,
}

impl CpalPlaybackSink {
    /// Open the default output device at its native configuration.
    pub fn open() -> ClientResult<Self> {
        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<ClientResult<u32>>();

        let thread_queue = queue.clone();
        let thread_running = running.clone();

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(
                        "no default output device".to_string(),
                    )));
                    return;
                }
            };

            let config = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "no usable output config: {}",
                        e
                    ))));
                    return;
                }
            };

            let sample_format = config.sample_format();
            let stream_config: StreamConfig = config.into();
            let channels = stream_config.channels as usize;
            let rate = stream_config.sample_rate.0;

            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                ?sample_format,
                channels,
                rate,
                "opening output device"
            );

            let stream_result = match sample_format {
                SampleFormat::F32 => {
                    let queue = thread_queue.clone();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _info| fill_output_f32(data, channels, &queue),
                        |err| error!("playback stream error: {}", err),
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let queue = thread_queue.clone();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _info| fill_output_i16(data, channels, &queue),
                        |err| error!("playback stream error: {}", err),
                        None,
                    )
                }
                SampleFormat::U16 => {
                    let queue = thread_queue.clone();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [u16], _info| fill_output_u16(data, channels, &queue),
                        |err| error!("playback stream error: {}", err),
                        None,
                    )
                }
                other => {
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "unsupported output sample format: {:?}",
                        other
                    ))));
                    return;
                }
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                        "failed to build output stream: {}",
                        e
                    ))));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(ClientError::DeviceUnavailable(format!(
                    "failed to start output stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(rate));

            while thread_running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
        });

        let rate = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(ClientError::DeviceUnavailable(
                    "timed out opening output device".to_string(),
                ));
            }
        };

        Ok(Self {
            rate,
            queue,
            running,
        })
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn write(&mut self, samples: &[f32]) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples.iter().copied());
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn downmix_f32(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }

    input
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn downmix_i16_to_f32(input: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.iter().map(|&s| s as f32 / 32768.0).collect();
    }

    input
        .chunks_exact(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s as f32 / 32768.0).sum();
            sum / channels as f32
        })
        .collect()
}

fn downmix_u16_to_f32(input: &[u16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input
            .iter()
            .map(|&s| (s as f32 / 65535.0) * 2.0 - 1.0)
            .collect();
    }

    input
        .chunks_exact(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| (s as f32 / 65535.0) * 2.0 - 1.0).sum();
            sum / channels as f32
        })
        .collect()
}

fn next_sample(queue: &mut VecDeque<f32>) -> f32 {
    queue.pop_front().unwrap_or(0.0)
}

fn fill_output_f32(data: &mut [f32], channels: usize, queue: &Arc<Mutex<VecDeque<f32>>>) {
    let mut queue = match queue.lock() {
        Ok(q) => q,
        Err(_) => return,
    };

    if channels <= 1 {
        for sample in data.iter_mut() {
            *sample = next_sample(&mut queue);
        }
        return;
    }

    for frame in data.chunks_mut(channels) {
        let value = next_sample(&mut queue);
        for out in frame.iter_mut() {
            *out = value;
        }
    }
}

fn fill_output_i16(data: &mut [i16], channels: usize, queue: &Arc<Mutex<VecDeque<f32>>>) {
    let mut queue = match queue.lock() {
        Ok(q) => q,
        Err(_) => return,
    };

    if channels <= 1 {
        for sample in data.iter_mut() {
            *sample = (next_sample(&mut queue).clamp(-1.0, 1.0) * 32767.0) as i16;
        }
        return;
    }

    for frame in data.chunks_mut(channels) {
        let value = (next_sample(&mut queue).clamp(-1.0, 1.0) * 32767.0) as i16;
        for out in frame.iter_mut() {
            *out = value;
        }
    }
}

fn fill_output_u16(data: &mut [u16], channels: usize, queue: &Arc<Mutex<VecDeque<f32>>>) {
    let mut queue = match queue.lock() {
        Ok(q) => q,
        Err(_) => return,
    };

    if channels <= 1 {
        for sample in data.iter_mut() {
            let value = (next_sample(&mut queue).clamp(-1.0, 1.0) * 32767.0) as i32;
            *sample = (value + 32768) as u16;
        }
        return;
    }

    for frame in data.chunks_mut(channels) {
        let value = (next_sample(&mut queue).clamp(-1.0, 1.0) * 32767.0) as i32;
        let value = (value + 32768) as u16;
        for out in frame.iter_mut() {
            *out = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo_to_mono() {
        let stereo = vec![1.0f32, -1.0, 0.5, 0.5];
        let mono = downmix_f32(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.0).abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fill_output_duplicates_mono_to_stereo() {
        let queue = Arc::new(Mutex::new(VecDeque::from(vec![0.5f32, -0.5])));
        let mut out = vec![0.0f32; 4]; // 2 frames, 2 channels
        fill_output_f32(&mut out, 2, &queue);

        assert!((out[0] - out[1]).abs() < 1e-6);
        assert!((out[2] - out[3]).abs() < 1e-6);
        assert!(out[0] > 0.0);
        assert!(out[2] < 0.0);
    }

    #[test]
    fn test_fill_output_silence_on_underrun() {
        let queue = Arc::new(Mutex::new(VecDeque::from(vec![0.5f32])));
        let mut out = vec![1.0f32; 4];
        fill_output_f32(&mut out, 1, &queue);

        assert!((out[0] - 0.5).abs() < 1e-6);
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_i16_downmix_scaling() {
        let mono = downmix_i16_to_f32(&[16384, -16384], 1);
        assert!((mono[0] - 0.5).abs() < 1e-3);
        assert!((mono[1] + 0.5).abs() < 1e-3);
    }
}
