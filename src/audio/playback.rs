//! # Playback Scheduling
//!
//! Turns independently-arriving binary PCM chunks into one continuous audio
//! stream. Chunks arrive whenever the network delivers them; the scheduler
//! absorbs that jitter by assigning each decoded buffer a start position on
//! a monotonic sample clock and never letting two buffers overlap.
//!
//! ## Scheduling Invariant:
//! Every chunk starts at `max(cursor, play head)` and advances the cursor by
//! its own length. A chunk that arrives while the previous one is still
//! playing is placed flush against its end (zero gap); a chunk that arrives
//! after the stream ran dry starts immediately at the play head.
//!
//! ## Clock Model:
//! The play head only advances while the engine is running. `stop` freezes
//! the clock rather than touching the scheduled cursor, so `resume` picks up
//! with alignment intact.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::audio::analyzer::AudioAnalyzer;
use crate::audio::encode::decode_i16le_to_f32;
use crate::error::{AgentError, AgentResult};

/// Monotonic scheduled-end-time tracker, in samples.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    cursor: u64,
}

impl Timeline {
    /// Assign a start position for a buffer of `len` samples given the
    /// current play head, and advance the cursor past it.
    pub(crate) fn schedule(&mut self, now: u64, len: u64) -> u64 {
        let start = self.cursor.max(now);
        self.cursor = start + len;
        start
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// A decoded buffer waiting on (or partway through) the timeline.
struct ScheduledChunk {
    start: u64,
    samples: Vec<f32>,
    offset: usize,
}

/// Everything the output callback and the scheduling side share.
struct PlaybackState {
    timeline: Timeline,
    queue: VecDeque<ScheduledChunk>,
    play_head: u64,
    running: bool,
    destroyed: bool,
}

impl PlaybackState {
    fn new() -> Self {
        Self {
            timeline: Timeline::default(),
            queue: VecDeque::new(),
            play_head: 0,
            running: true,
            destroyed: false,
        }
    }

    /// Render `frames` mono samples into `out`, consuming the queue.
    ///
    /// Returns false when the clock is suspended: the output gets silence
    /// and the play head does not move, so nothing counts as rendered.
    fn render_mono(&mut self, frames: usize, out: &mut Vec<f32>) -> bool {
        out.clear();
        if !self.running || self.destroyed {
            out.resize(frames, 0.0);
            return false;
        }

        for _ in 0..frames {
            let sample = loop {
                match self.queue.front_mut() {
                    None => break 0.0,
                    Some(chunk) if chunk.start > self.play_head => break 0.0,
                    Some(chunk) if chunk.offset < chunk.samples.len() => {
                        let s = chunk.samples[chunk.offset];
                        chunk.offset += 1;
                        break s;
                    }
                    // front chunk exhausted; the next may start this sample
                    Some(_) => {}
                }
                self.queue.pop_front();
            };
            out.push(sample);
            self.play_head += 1;
        }
        true
    }
}

/// Schedules received PCM chunks into gapless output and exposes the
/// analysis tap that visualization consumers read.
///
/// One engine is owned per session, constructed at connect time with the
/// session's negotiated output sample rate and torn down on disconnect. If
/// the machine has no usable output device the engine still schedules
/// (cursor math, queue, analysis window) and simply renders nowhere.
pub struct PlaybackEngine {
    sample_rate: u32,
    state: Arc<Mutex<PlaybackState>>,
    analyzer: Arc<AudioAnalyzer>,
    sink_stop: Arc<AtomicBool>,
    sink: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PlaybackEngine {
    /// Create an engine rendering at `sample_rate`, with an analysis window
    /// of `window_size` samples (a power of two; see `AnalysisConfig`).
    pub fn new(sample_rate: u32, window_size: usize) -> Self {
        let state = Arc::new(Mutex::new(PlaybackState::new()));
        let analyzer = Arc::new(AudioAnalyzer::new(window_size));
        let sink_stop = Arc::new(AtomicBool::new(false));

        let sink = spawn_sink(
            state.clone(),
            analyzer.clone(),
            sink_stop.clone(),
            sample_rate,
        );

        Self {
            sample_rate,
            state,
            analyzer,
            sink_stop,
            sink: Mutex::new(sink),
        }
    }

    /// Decode a binary PCM chunk and schedule it for gapless output.
    ///
    /// A chunk that fails to decode is dropped and the failure returned;
    /// the engine and its cursor are untouched, so the session carries on.
    pub fn play(&self, chunk: &[u8]) -> AgentResult<()> {
        let samples = decode_i16le_to_f32(chunk)?;

        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(AgentError::InvalidState(
                "play called on a destroyed playback engine".to_string(),
            ));
        }

        let head = state.play_head;
        let start = state.timeline.schedule(head, samples.len() as u64);
        debug!(
            start,
            len = samples.len(),
            cursor = state.timeline.cursor(),
            "scheduled audio chunk"
        );
        state.queue.push_back(ScheduledChunk {
            start,
            samples,
            offset: 0,
        });
        Ok(())
    }

    /// Suspend the playback clock. Idempotent; the scheduled cursor is left
    /// alone so a later `resume` keeps every pending chunk aligned.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.running {
            state.running = false;
            debug!("playback suspended");
        }
    }

    /// Resume a suspended clock. Idempotent; a no-op after `destroy`.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.running && !state.destroyed {
            state.running = true;
            debug!("playback resumed");
        }
    }

    /// Release the output device and mark the engine unusable. Any further
    /// `play` is an error; the owning session drops its handle right after
    /// calling this so that cannot happen in practice.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.running = false;
            state.queue.clear();
        }
        self.sink_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sink.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("playback engine destroyed");
    }

    /// Output sample rate the engine was constructed with.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the playback clock is currently advancing.
    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.running && !state.destroyed
    }

    /// Time-domain snapshot of the most recently rendered audio; see
    /// [`AudioAnalyzer::waveform_data`]. Recomputed on every call.
    pub fn waveform_data(&self) -> Vec<u8> {
        self.analyzer.waveform_data()
    }

    /// Spectrum snapshot; see [`AudioAnalyzer::frequency_data`].
    pub fn frequency_data(&self) -> Vec<u8> {
        self.analyzer.frequency_data()
    }

    /// Scalar volume in [0, 1]; see [`AudioAnalyzer::volume_level`].
    pub fn volume_level(&self) -> f32 {
        self.analyzer.volume_level()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Open the default output device on its own thread and pump the timeline
/// into it. The `cpal::Stream` is not `Send`, so it must live and die on
/// this thread; a missing device or unsupported format is logged and leaves
/// the engine scheduling without a sink.
fn spawn_sink(
    state: Arc<Mutex<PlaybackState>>,
    analyzer: Arc<AudioAnalyzer>,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
) -> Option<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("playback-sink".to_string())
        .spawn(move || run_sink(state, analyzer, stop, sample_rate))
        .map_err(|err| error!("failed to spawn playback sink thread: {}", err))
        .ok()
}

fn run_sink(
    state: Arc<Mutex<PlaybackState>>,
    analyzer: Arc<AudioAnalyzer>,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        warn!("no output device available; playback will schedule without rendering");
        return;
    };

    let (format, channels) = match device.default_output_config() {
        Ok(config) => (config.sample_format(), usize::from(config.channels().max(1))),
        Err(err) => {
            warn!("failed to query output device config: {}", err);
            return;
        }
    };
    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| warn!("output stream error: {}", err);
    let mut mono = Vec::new();
    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let frames = data.len() / channels;
                let rendered = state.lock().unwrap().render_mono(frames, &mut mono);
                for (frame, &sample) in mono.iter().enumerate() {
                    for slot in &mut data[frame * channels..(frame + 1) * channels] {
                        *slot = sample;
                    }
                }
                if rendered {
                    analyzer.record_rendered(&mono);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                let frames = data.len() / channels;
                let rendered = state.lock().unwrap().render_mono(frames, &mut mono);
                for (frame, &sample) in mono.iter().enumerate() {
                    let value = (sample.clamp(-1.0, 1.0) * 32_767.0) as i16;
                    for slot in &mut data[frame * channels..(frame + 1) * channels] {
                        *slot = value;
                    }
                }
                if rendered {
                    analyzer.record_rendered(&mono);
                }
            },
            err_fn,
            None,
        ),
        other => {
            warn!("unsupported output sample format: {:?}", other);
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to open output stream at {} Hz: {}", sample_rate, err);
            return;
        }
    };
    if let Err(err) = stream.play() {
        error!("failed to start output stream: {}", err);
        return;
    }

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode::convert_f32_to_i16le;

    fn chunk_of(len: usize) -> Vec<u8> {
        convert_f32_to_i16le(&vec![0.25; len])
    }

    #[test]
    fn timeline_schedules_back_to_back_without_gap_or_overlap() {
        let mut timeline = Timeline::default();
        let mut prev_end = 0u64;
        // chunks arriving while earlier ones still play (head stays at 0)
        for len in [100u64, 50, 1, 300] {
            let start = timeline.schedule(0, len);
            assert_eq!(start, prev_end, "each chunk starts flush at the previous end");
            prev_end = start + len;
        }
        assert_eq!(timeline.cursor(), 451);
    }

    #[test]
    fn timeline_starts_at_play_head_after_running_dry() {
        let mut timeline = Timeline::default();
        timeline.schedule(0, 100);
        // stream ran dry: the head moved past the cursor before arrival
        let start = timeline.schedule(250, 40);
        assert_eq!(start, 250);
        assert_eq!(timeline.cursor(), 290);
    }

    #[test]
    fn timeline_start_never_precedes_previous_end() {
        let mut timeline = Timeline::default();
        let mut prev_end = 0u64;
        let arrivals = [(0u64, 80u64), (30, 10), (500, 60), (400, 25), (620, 5)];
        for (head, len) in arrivals {
            let start = timeline.schedule(head, len);
            assert!(start >= prev_end, "overlap: {} < {}", start, prev_end);
            assert!(start >= head);
            prev_end = start + len;
        }
    }

    #[test]
    fn play_advances_cursor_by_decoded_length() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.play(&chunk_of(100)).unwrap();
        engine.play(&chunk_of(50)).unwrap();

        let state = engine.state.lock().unwrap();
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.queue[0].start, 0);
        assert_eq!(state.queue[1].start, 100);
        assert_eq!(state.timeline.cursor(), 150);
    }

    #[test]
    fn render_fills_scheduled_gap_with_silence() {
        let engine = PlaybackEngine::new(24_000, 256);
        {
            let mut state = engine.state.lock().unwrap();
            let start = state.timeline.schedule(10, 4);
            state.queue.push_back(ScheduledChunk {
                start,
                samples: vec![0.5; 4],
                offset: 0,
            });
        }

        let mut out = Vec::new();
        let mut state = engine.state.lock().unwrap();
        assert!(state.render_mono(16, &mut out));
        assert!(out[..10].iter().all(|&s| s == 0.0));
        assert!(out[10..14].iter().all(|&s| s == 0.5));
        assert!(out[14..].iter().all(|&s| s == 0.0));
        assert_eq!(state.play_head, 16);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn render_plays_adjacent_chunks_seamlessly() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.play(&convert_f32_to_i16le(&vec![0.5; 8])).unwrap();
        engine.play(&convert_f32_to_i16le(&vec![-0.5; 8])).unwrap();

        let mut out = Vec::new();
        let mut state = engine.state.lock().unwrap();
        state.render_mono(16, &mut out);
        assert!(out[..8].iter().all(|&s| (s - 0.5).abs() < 1e-3));
        assert!(out[8..].iter().all(|&s| (s + 0.5).abs() < 1e-3));
    }

    #[test]
    fn stop_resume_pair_leaves_cursor_unchanged() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.play(&chunk_of(100)).unwrap();
        let cursor_before = engine.state.lock().unwrap().timeline.cursor();

        engine.stop();
        engine.stop(); // idempotent
        engine.resume();
        engine.resume(); // idempotent

        assert_eq!(engine.state.lock().unwrap().timeline.cursor(), cursor_before);

        // the next chunk starts exactly where it would have without the pair
        engine.play(&chunk_of(10)).unwrap();
        let state = engine.state.lock().unwrap();
        assert_eq!(state.queue.back().unwrap().start, cursor_before);
    }

    #[test]
    fn suspended_clock_renders_silence_without_advancing() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.play(&chunk_of(32)).unwrap();
        engine.stop();

        let mut out = Vec::new();
        let mut state = engine.state.lock().unwrap();
        assert!(!state.render_mono(16, &mut out));
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(state.play_head, 0, "suspended clock must not advance");
        assert_eq!(state.queue.len(), 1, "pending audio stays queued");
    }

    #[test]
    fn undecodable_chunk_is_dropped_without_moving_cursor() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.play(&chunk_of(10)).unwrap();

        let result = engine.play(&[0u8, 1, 2]); // odd byte count
        assert!(matches!(result, Err(AgentError::Decode(_))));
        assert_eq!(engine.state.lock().unwrap().timeline.cursor(), 10);
    }

    #[test]
    fn play_after_destroy_is_an_error() {
        let engine = PlaybackEngine::new(24_000, 256);
        engine.destroy();
        engine.destroy(); // idempotent

        assert!(!engine.is_running());
        assert!(matches!(
            engine.play(&chunk_of(4)),
            Err(AgentError::InvalidState(_))
        ));
    }
}
