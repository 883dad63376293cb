//! # PCM Conversion
//!
//! Pure, stateless sample-format helpers shared by the capture and playback
//! halves of the pipeline.
//!
//! ## Wire Format:
//! Both directions of the socket carry 16-bit little-endian signed PCM, mono.
//! Capture produces it from device-rate f32 samples; playback consumes it
//! back into f32 for scheduling.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{AgentError, AgentResult};

/// Resample by nearest-sample selection at the rate ratio.
///
/// Output length is `round(len * to_rate / from_rate)`. There is no
/// anti-aliasing filter in this path: nearest-sample selection keeps latency
/// and CPU cost at a minimum, which matters more than fidelity for speech
/// frames headed to a recognizer.
pub fn downsample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f32 / to_rate as f32;
    let out_len = (samples.len() as f32 / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src = (i as f32 * ratio).round() as usize;
        output.push(samples[src.min(samples.len() - 1)]);
    }

    output
}

/// Encode f32 samples in [-1, 1] as 16-bit little-endian PCM bytes.
///
/// Each sample is clamped first; negative values scale by 0x8000 and
/// positive by 0x7FFF so that neither end of the range can overflow i16.
pub fn convert_f32_to_i16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = if clamped < 0.0 {
            (clamped * 0x8000 as f32) as i16
        } else {
            (clamped * 0x7FFF as f32) as i16
        };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode 16-bit little-endian PCM bytes into normalized f32 samples.
///
/// ## Error Handling:
/// Empty input and odd byte counts are decode errors; the caller drops the
/// chunk and carries on. This is the non-fatal path for malformed audio
/// arriving over the socket.
pub fn decode_i16le_to_f32(bytes: &[u8]) -> AgentResult<Vec<f32>> {
    if bytes.is_empty() {
        return Err(AgentError::Decode("empty audio chunk".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(AgentError::Decode(format!(
            "audio chunk length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32_768.0);
    }

    Ok(samples)
}

/// Downmix interleaved multi-channel f32 audio to mono by averaging each
/// frame. Single-channel input is passed through untouched.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let mut output = Vec::with_capacity(samples.len() / channels + 1);
    for frame in samples.chunks(channels) {
        let sum: f32 = frame.iter().sum();
        output.push(sum / frame.len() as f32);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_scales_length_by_rate_ratio() {
        let input = vec![0.0f32; 4096];
        let output = downsample(&input, 48_000, 16_000);
        assert_eq!(output.len(), (4096.0f32 * 16_000.0 / 48_000.0).round() as usize);
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn downsample_then_encode_keeps_silence_silent() {
        // all-zero input of any length stays all-zero through the full
        // capture transform, at the rate-scaled length
        for len in [1usize, 7, 160, 4096] {
            let input = vec![0.0f32; len];
            let resampled = downsample(&input, 44_100, 16_000);
            let expected = (len as f32 * 16_000.0 / 44_100.0).round() as usize;
            assert_eq!(resampled.len(), expected);

            let encoded = convert_f32_to_i16le(&resampled);
            assert_eq!(encoded.len(), expected * 2);
            assert!(encoded.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn downsample_handles_degenerate_inputs() {
        assert!(downsample(&[], 48_000, 16_000).is_empty());
        let input = vec![0.5f32, -0.5];
        assert_eq!(downsample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn encode_scales_negative_and_positive_asymmetrically() {
        let bytes = convert_f32_to_i16le(&[-1.0, 1.0, 0.0]);
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), -0x8000);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 0x7FFF);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 0);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let bytes = convert_f32_to_i16le(&[-2.5, 2.5]);
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), -0x8000);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 0x7FFF);
    }

    #[test]
    fn decode_rejects_empty_and_odd_input() {
        assert!(decode_i16le_to_f32(&[]).is_err());
        assert!(decode_i16le_to_f32(&[0u8, 1, 2]).is_err());
    }

    #[test]
    fn decode_normalizes_into_unit_range() {
        let bytes = convert_f32_to_i16le(&[-1.0, 0.5]);
        let samples = decode_i16le_to_f32(&bytes).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] + 1.0).abs() < 1e-4);
        assert!((samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn downmix_averages_interleaved_frames() {
        let stereo = [1.0f32, -1.0, 0.5, 0.5];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.0, 0.5]);

        let mono = [0.1f32, 0.2, 0.3];
        assert_eq!(downmix_to_mono(&mono, 1), mono.to_vec());
    }
}
