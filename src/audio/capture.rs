//! # Microphone Capture
//!
//! Wraps the system input device so the session can consume fixed-size mono
//! f32 frames without touching cpal or thinking about sample formats.
//!
//! ## Threading:
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated capture
//! thread for the life of the recording. Device callbacks downmix to mono,
//! slice into frames, and `try_send` them over a bounded channel; when the
//! consumer lags, frames are dropped and counted instead of ever blocking
//! the device callback.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::encode::downmix_to_mono;
use crate::config::CaptureConfig;
use crate::error::{AgentError, AgentResult};

/// List input device names so callers can expose a microphone selector.
pub fn list_devices() -> AgentResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|err| AgentError::Device(format!("failed to enumerate input devices: {}", err)))?;

    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// A running microphone capture: owns the device stream (via its thread) and
/// the drop counter. Frames come out of the `Receiver` returned by `start`.
pub struct CapturePipeline {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    dropped: Arc<AtomicUsize>,
    device_rate: u32,
}

impl CapturePipeline {
    /// Acquire the microphone and start streaming frames.
    ///
    /// ## Error Handling:
    /// Everything that can fail does so here, before the caller considers
    /// recording started: no device, an unsupported sample format, or a
    /// stream that refuses to build or play. The capture thread reports its
    /// build result back over a handshake channel so those errors surface
    /// from this call rather than getting lost on the thread.
    pub fn start(config: &CaptureConfig) -> AgentResult<(Self, Receiver<Vec<f32>>)> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_input_device()
                .ok_or_else(|| AgentError::Device("no default input device".to_string()))?,
        };
        let device_name = device.name().unwrap_or_else(|_| "unknown device".to_string());

        let supported = device
            .default_input_config()
            .map_err(|err| AgentError::Device(format!("failed to query input config: {}", err)))?;
        let format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();
        let device_rate = stream_config.sample_rate.0;
        let channels = usize::from(stream_config.channels.max(1));

        let (frame_tx, frame_rx) = bounded(config.channel_capacity.max(1));
        let dropped = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let slicer = FrameSlicer::new(config.frame_samples.max(1), frame_tx, dropped.clone());
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                run_capture(device, format, stream_config, channels, slicer, thread_stop, ready_tx)
            })
            .map_err(|err| AgentError::Device(format!("failed to spawn capture thread: {}", err)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(AgentError::Device(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AgentError::Device("capture thread exited before starting".to_string()));
            }
        }

        info!(
            device = %device_name,
            rate = device_rate,
            channels,
            format = ?format,
            "microphone capture started"
        );

        Ok((
            Self {
                stop,
                thread: Some(thread),
                dropped,
                device_rate,
            },
            frame_rx,
        ))
    }

    /// Native sample rate of the device; frames come out at this rate and
    /// the session resamples them to the negotiated input rate.
    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Frames discarded because the consumer fell behind the device.
    pub fn dropped_frames(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Release the microphone. Idempotent; also runs on drop so an owner
    /// teardown never leaks an open device stream.
    pub fn stop(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        let dropped = self.dropped_frames();
        if dropped > 0 {
            warn!(dropped, "capture frames were dropped during this recording");
        }
        debug!("microphone capture stopped");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_device(host: &cpal::Host, name: &str) -> AgentResult<Device> {
    let mut devices = host
        .input_devices()
        .map_err(|err| AgentError::Device(format!("failed to enumerate input devices: {}", err)))?;
    devices
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AgentError::Device(format!("input device '{}' not found", name)))
}

/// Accumulates downmixed samples and emits fixed-size frames.
struct FrameSlicer {
    frame_samples: usize,
    pending: Vec<f32>,
    sender: Sender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
}

impl FrameSlicer {
    fn new(frame_samples: usize, sender: Sender<Vec<f32>>, dropped: Arc<AtomicUsize>) -> Self {
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            sender,
            dropped,
        }
    }

    fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: Fn(T) -> f32,
    {
        let converted: Vec<f32> = data.iter().copied().map(convert).collect();
        self.pending.extend(downmix_to_mono(&converted, channels));

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            match self.sender.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Body of the capture thread: build the stream for whatever sample format
/// the device speaks, report the outcome, then hold the stream alive until
/// asked to stop.
fn run_capture(
    device: Device,
    format: SampleFormat,
    config: StreamConfig,
    channels: usize,
    slicer: FrameSlicer,
    stop: Arc<AtomicBool>,
    ready: Sender<Result<(), String>>,
) {
    let slicer = Arc::new(Mutex::new(slicer));
    let err_fn = |err| warn!("input stream error: {}", err);

    let stream = match format {
        SampleFormat::F32 => {
            let slicer = slicer.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if let Ok(mut slicer) = slicer.lock() {
                        slicer.push(data, channels, |sample| sample);
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let slicer = slicer.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if let Ok(mut slicer) = slicer.lock() {
                        slicer.push(data, channels, |sample| sample as f32 / 32_768.0);
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let slicer = slicer.clone();
            device.build_input_stream(
                &config,
                move |data: &[u16], _| {
                    if let Ok(mut slicer) = slicer.lock() {
                        slicer.push(data, channels, |sample| {
                            (sample as f32 - 32_768.0) / 32_768.0
                        });
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready.send(Err(format!("unsupported input sample format: {:?}", other)));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(format!("failed to open input stream: {}", err)));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(format!("failed to start input stream: {}", err)));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
}
