//! PCM conversions between device samples and the wire format
//!
//! The service takes 16-bit little-endian PCM at 16 kHz and answers with the
//! same encoding at 24 kHz. Devices work in `f32` samples in [-1, 1].

use crate::transport::TransportError;

/// Microphone sample rate sent to the service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech coming back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture frame.
pub const FRAME_SIZE: usize = 256;
/// MIME type attached to every outbound audio frame.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Convert float samples to 16-bit little-endian PCM bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// Decode 16-bit little-endian PCM bytes into float samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, TransportError> {
    if bytes.len() % 2 != 0 {
        return Err(TransportError::Decode(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Duration in seconds of `samples` at `sample_rate`.
pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}
