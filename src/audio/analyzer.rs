//! # Playback Analysis Tap
//!
//! Maintains a rolling window over the most recently rendered output samples
//! and computes visualization snapshots from it on demand.
//!
//! ## Snapshot Contract:
//! Every accessor recomputes from the live window on each call; nothing is
//! cached between calls and no smoothing state is kept. Callers are expected
//! to be a rendering loop, which naturally throttles call frequency. The
//! byte encodings match what visualization consumers conventionally read:
//! time-domain samples centered at 128, and spectrum magnitudes mapped from
//! a fixed decibel range onto 0..=255.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex};

/// Decibel range mapped onto the 0..=255 spectrum bytes. Magnitudes at or
/// below the floor render as 0, at or above the ceiling as 255.
const DB_FLOOR: f32 = -100.0;
const DB_CEILING: f32 = -30.0;

/// Fixed-size ring over the most recently rendered samples.
struct SampleWindow {
    buf: Vec<f32>,
    pos: usize,
}

impl SampleWindow {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0.0; size],
            pos: 0,
        }
    }

    fn push_slice(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.buf[self.pos] = sample;
            self.pos = (self.pos + 1) % self.buf.len();
        }
    }

    /// Copy out the window ordered oldest to newest.
    fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.pos..]);
        out.extend_from_slice(&self.buf[..self.pos]);
        out
    }
}

/// Computes waveform, spectrum, and volume snapshots from rendered audio.
///
/// Shared between the playback sink thread (which feeds it) and any number
/// of read-only visualization consumers.
pub struct AudioAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    fft_scratch: Mutex<Vec<Complex<f32>>>,
    window_size: usize,
    window: Mutex<SampleWindow>,
}

impl AudioAnalyzer {
    /// Create an analyzer over a window of `window_size` samples.
    /// `window_size` is also the FFT size and must be a power of two.
    pub fn new(window_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_size);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            fft,
            fft_scratch: Mutex::new(vec![Complex::new(0.0, 0.0); scratch_len]),
            window_size,
            window: Mutex::new(SampleWindow::new(window_size)),
        }
    }

    /// Feed samples the sink just rendered. Called from the output stream
    /// thread; visualization reads interleave freely.
    pub(crate) fn record_rendered(&self, samples: &[f32]) {
        self.window.lock().unwrap().push_slice(samples);
    }

    /// Time-domain snapshot of the window, one byte per sample, centered at
    /// 128 (silence renders as a flat line of 128s).
    pub fn waveform_data(&self) -> Vec<u8> {
        let snapshot = self.window.lock().unwrap().snapshot();
        snapshot
            .iter()
            .map(|&s| ((s.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8)
            .collect()
    }

    /// Magnitude spectrum of the window, `window_size / 2` bytes, scaled
    /// from the [`DB_FLOOR`], [`DB_CEILING`] range onto 0..=255.
    pub fn frequency_data(&self) -> Vec<u8> {
        let snapshot = self.window.lock().unwrap().snapshot();

        let mut buffer: Vec<Complex<f32>> =
            snapshot.iter().map(|&s| Complex::new(s, 0.0)).collect();
        {
            let mut scratch = self.fft_scratch.lock().unwrap();
            self.fft
                .process_with_scratch(&mut buffer, scratch.as_mut_slice());
        }

        let norm = 1.0 / self.window_size as f32;
        buffer[..self.window_size / 2]
            .iter()
            .map(|c| {
                let magnitude = c.norm() * norm;
                let db = 20.0 * magnitude.max(1e-10).log10();
                let scaled = (db - DB_FLOOR) / (DB_CEILING - DB_FLOOR);
                (scaled.clamp(0.0, 1.0) * 255.0).round() as u8
            })
            .collect()
    }

    /// Scalar volume in [0, 1]: the mean of the frequency bins normalized
    /// by the byte range.
    pub fn volume_level(&self) -> f32 {
        let bins = self.frequency_data();
        if bins.is_empty() {
            return 0.0;
        }
        let sum: u32 = bins.iter().map(|&b| b as u32).sum();
        sum as f32 / bins.len() as f32 / 255.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn silence_renders_flat_waveform_and_zero_volume() {
        let analyzer = AudioAnalyzer::new(256);

        let waveform = analyzer.waveform_data();
        assert_eq!(waveform.len(), 256);
        assert!(waveform.iter().all(|&b| b == 128));

        let spectrum = analyzer.frequency_data();
        assert_eq!(spectrum.len(), 128);
        assert!(spectrum.iter().all(|&b| b == 0));

        assert_eq!(analyzer.volume_level(), 0.0);
    }

    #[test]
    fn full_scale_tone_saturates_its_bin() {
        let analyzer = AudioAnalyzer::new(256);
        // a tone landing exactly on bin 8 of a 256-point FFT
        let tone: Vec<f32> = (0..256)
            .map(|n| (2.0 * PI * 8.0 * n as f32 / 256.0).sin())
            .collect();
        analyzer.record_rendered(&tone);

        let spectrum = analyzer.frequency_data();
        assert_eq!(spectrum[8], 255, "tone bin should hit the byte ceiling");
        assert!(spectrum[64] < 32, "far bins should stay near the floor");
        assert!(analyzer.volume_level() > 0.0);
    }

    #[test]
    fn waveform_reflects_most_recent_samples() {
        let analyzer = AudioAnalyzer::new(64);
        analyzer.record_rendered(&vec![0.0; 64]);
        analyzer.record_rendered(&vec![1.0; 32]);

        let waveform = analyzer.waveform_data();
        // oldest half is silence, newest half is the full-scale burst
        assert!(waveform[..32].iter().all(|&b| b == 128));
        assert!(waveform[32..].iter().all(|&b| b == 255));
    }

    #[test]
    fn snapshots_recompute_without_carryover() {
        let analyzer = AudioAnalyzer::new(64);
        analyzer.record_rendered(&vec![0.9; 64]);
        let loud = analyzer.volume_level();
        assert!(loud > 0.0);

        // once silence has flushed the window, no trace of the burst remains
        analyzer.record_rendered(&vec![0.0; 64]);
        assert_eq!(analyzer.volume_level(), 0.0);
    }
}
