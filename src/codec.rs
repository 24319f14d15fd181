//! # PCM Codec
//!
//! Pure, synchronous conversions between the three audio representations the
//! client deals with:
//! - normalized f32 samples in [-1.0, 1.0] (what the capture and playback
//!   pipelines work in)
//! - little-endian 16-bit signed PCM bytes (what crosses the WebSocket)
//! - base64 text (how PCM is embedded in JSON frames)
//!
//! ## Wire Format:
//! Mono PCM16LE. Capture is sent at 16 kHz; the agent replies at 24 kHz.
//! Sample rate is a property of the stream, not the encoding, so nothing in
//! this module depends on it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::ClientResult;

/// Convert normalized f32 samples to little-endian PCM16 bytes.
///
/// ## Conversion:
/// Each sample is scaled by 32767 (0x7fff) and cast to i16. Callers supply
/// in-range samples; out-of-range input saturates at the i16 bounds (the
/// behavior of Rust's float-to-int cast) rather than wrapping.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32767.0) as i16;
        // Writing to a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Convert little-endian PCM16 bytes to normalized f32 samples.
///
/// ## Conversion:
/// Scales from the 16-bit integer range [-32768, 32767] to [-1.0, 1.0).
/// An odd trailing byte is ignored: the result always has
/// `floor(bytes.len() / 2)` samples.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push(value as f32 / 32768.0);
    }
    samples
}

/// Encode bytes as standard-alphabet base64 without line wrapping.
pub fn bytes_to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode standard-alphabet base64 into bytes.
pub fn base64_to_bytes(text: &str) -> ClientResult<Vec<u8>> {
    Ok(BASE64.decode(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_lsb() {
        let samples = vec![0.0f32, 0.5, -0.5, 0.999, -1.0, 0.25, -0.75];
        let bytes = float_to_pcm16(&samples);
        let decoded = pcm16_to_float(&bytes);

        assert_eq!(decoded.len(), samples.len());
        for (original, recovered) in samples.iter().zip(decoded.iter()) {
            let diff = (original - recovered).abs();
            // One LSB at 16 bits is 1/32768.
            assert!(
                diff <= 1.0 / 32768.0 + f32::EPSILON,
                "round trip error too large: {} vs {}",
                original,
                recovered
            );
        }
    }

    #[test]
    fn test_encode_is_little_endian() {
        let bytes = float_to_pcm16(&[0.5]);
        let expected = ((0.5f32 * 32767.0) as i16).to_le_bytes();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_truncates_odd_tail() {
        // 5 bytes is two complete samples plus a dangling byte.
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0x7F];
        let samples = pcm16_to_float(&bytes);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 1e-4);
        assert!((samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_decode_empty() {
        assert!(pcm16_to_float(&[]).is_empty());
    }

    #[test]
    fn test_base64_round_trip() {
        let bytes = vec![0u8, 1, 2, 250, 255];
        let text = bytes_to_base64(&bytes);
        assert_eq!(base64_to_bytes(&text).unwrap(), bytes);
    }

    #[test]
    fn test_base64_rejects_garbage() {
        assert!(base64_to_bytes("not base64!!").is_err());
    }
}
