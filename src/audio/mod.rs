//! # Audio Pipeline
//!
//! Everything between the operating system's audio devices and the session's
//! socket frames lives here.
//!
//! ## Key Components:
//! - **Encode**: pure PCM conversions (resample, f32 to 16-bit LE and back,
//!   mono downmix) shared by both directions
//! - **Capture**: microphone acquisition and fixed-size frame dispatch
//! - **Playback**: gapless scheduling of received chunks onto a monotonic
//!   sample clock, rendered through the default output device
//! - **Analyzer**: pull-based waveform/spectrum/volume snapshots over the
//!   most recently rendered audio, for visualization consumers
//!
//! ## Audio Format:
//! The socket carries 16-bit little-endian PCM, mono, at the sample rates
//! negotiated in the settings frame (capture is resampled to the input rate;
//! playback runs at the output rate).

pub mod analyzer;
pub mod capture;
pub mod encode;
pub mod playback;
