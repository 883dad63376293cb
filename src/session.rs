//! # Agent Session
//!
//! Owns one connection to the remote voice agent: the socket, the microphone
//! capture pipeline, and the playback engine. Everything the session holds
//! is torn down together on `disconnect`, and nothing is shared across
//! sessions.
//!
//! ## Socket Protocol:
//! 1. **Connect**: WebSocket upgrade carrying the bearer token as a
//!    subprotocol value
//! 2. **Settings**: the serialized [`AgentSettings`] is the first control
//!    frame after open; the playback engine is constructed before the read
//!    loop starts so no audio frame can ever arrive without a place to go
//! 3. **Upstream audio**: binary 16-bit PCM frames, sent only while the
//!    socket is open and recording is active
//! 4. **Downstream**: binary PCM chunks routed to the playback engine, or
//!    JSON control messages appended to the session's ordered message log
//!
//! ## Lifecycle:
//! `Disconnected -> Connecting -> Connected -> Disconnected`. A transport
//! error or server close drops the session back to disconnected and is
//! never retried here; reconnecting is the caller's decision.

use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::capture::CapturePipeline;
use crate::audio::encode::{convert_f32_to_i16le, downsample};
use crate::audio::playback::PlaybackEngine;
use crate::config::{AccessToken, AgentSettings, ClientConfig};
use crate::error::{AgentError, AgentResult};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A control frame received from the agent, tagged by its `type` field.
///
/// `role` and `content` are lifted out because conversation turns are what
/// consumers filter for; everything else the service sends rides along in
/// `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,

    /// Speaker for conversation turns ("user" or "assistant")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub role: Option<String>,

    /// Text for conversation turns
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,

    /// Any remaining fields of the frame, preserved as-is
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// Local arrival timestamp; not part of the wire frame
    #[serde(skip_serializing, skip_deserializing, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// One session against the remote agent endpoint.
///
/// All methods take `&self`; the session is intended to be wrapped in an
/// `Arc` and shared between the application and its rendering layer. The
/// rendering layer should only ever touch [`Session::playback`] and the
/// message accessors.
pub struct Session {
    id: String,
    config: ClientConfig,
    settings: AgentSettings,
    token: AccessToken,

    state: Arc<RwLock<ConnectionState>>,
    /// True exactly while the socket is open; the capture pump reads this
    /// for every frame
    socket_open: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,

    /// Append-only log of received control messages, in arrival order
    messages: Arc<Mutex<Vec<ControlMessage>>>,
    playback: Arc<RwLock<Option<Arc<PlaybackEngine>>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    capture: Mutex<Option<CapturePipeline>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Create a session. Nothing is opened until [`Session::connect`].
    pub fn new(
        config: ClientConfig,
        settings: AgentSettings,
        token: impl Into<AccessToken>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            settings,
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            socket_open: Arc::new(AtomicBool::new(false)),
            recording: Arc::new(AtomicBool::new(false)),
            messages: Arc::new(Mutex::new(Vec::new())),
            playback: Arc::new(RwLock::new(None)),
            outbound: Arc::new(Mutex::new(None)),
            capture: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Open the socket, stand up the playback engine, and send the settings
    /// frame. On any failure the session is back in `Disconnected` with
    /// nothing leaked, and calling `connect` again is valid.
    pub async fn connect(&self) -> AgentResult<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != ConnectionState::Disconnected {
                return Err(AgentError::InvalidState(format!(
                    "connect called while {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        // serialize up front so a bad settings object cannot leave a
        // half-open socket behind
        let settings_frame = match serde_json::to_string(&self.settings) {
            Ok(json) => json,
            Err(err) => {
                self.enter_disconnected();
                return Err(err.into());
            }
        };

        info!(session = %self.id, endpoint = %self.config.endpoint, "connecting");
        let request = match self.build_request() {
            Ok(request) => request,
            Err(err) => {
                self.enter_disconnected();
                return Err(err);
            }
        };
        let (socket, _response) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(err) => {
                self.enter_disconnected();
                return Err(AgentError::Transport(err.to_string()));
            }
        };

        // the engine must exist before the read loop can deliver audio
        let engine = Arc::new(PlaybackEngine::new(
            self.settings.audio.output.sample_rate,
            self.config.analysis.window_size,
        ));
        *self.playback.write().unwrap() = Some(engine.clone());

        let (mut sink, stream) = socket.split();
        if let Err(err) = sink.send(Message::Text(settings_frame)).await {
            self.teardown_playback();
            self.enter_disconnected();
            return Err(AgentError::Transport(err.to_string()));
        }
        debug!(session = %self.id, "settings frame sent");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().unwrap() = Some(outbound_tx);
        let writer = tokio::spawn(async move {
            let outbound = UnboundedReceiverStream::new(outbound_rx).map(Ok);
            if let Err(err) = outbound.forward(sink).await {
                debug!("outbound writer finished: {}", err);
            }
        });
        *self.writer.lock().unwrap() = Some(writer);

        self.socket_open.store(true, Ordering::SeqCst);
        *self.state.write().unwrap() = ConnectionState::Connected;
        info!(session = %self.id, "connected");

        let reader = tokio::spawn(read_loop(
            stream,
            engine,
            self.messages.clone(),
            self.state.clone(),
            self.socket_open.clone(),
            self.id.clone(),
        ));
        *self.reader.lock().unwrap() = Some(reader);

        Ok(())
    }

    /// Close the socket, stop recording if active, and destroy the playback
    /// engine. Safe to call any number of times, in any lifecycle state,
    /// including while a `connect` is still failing its way back down.
    pub fn disconnect(&self) {
        let was_active = *self.state.read().unwrap() != ConnectionState::Disconnected;

        self.stop_recording();
        self.socket_open.store(false, Ordering::SeqCst);

        if let Some(outbound) = self.outbound.lock().unwrap().take() {
            let _ = outbound.send(Message::Close(None));
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        // the writer drains the close frame and finishes once its channel
        // sender is gone; nothing to wait on
        self.writer.lock().unwrap().take();

        self.teardown_playback();
        *self.state.write().unwrap() = ConnectionState::Disconnected;

        if was_active {
            info!(session = %self.id, "session disconnected");
        }
    }

    /// Acquire the microphone and start streaming audio frames. Frames are
    /// resampled to the negotiated input rate, encoded as 16-bit PCM, and
    /// sent only while the socket is open; anything captured while it is
    /// not open is discarded rather than queued, so the service never
    /// receives stale audio late.
    pub fn start_recording(&self) -> AgentResult<()> {
        if self.recording.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (pipeline, frames) = match CapturePipeline::start(&self.config.capture) {
            Ok(started) => started,
            Err(err) => {
                self.recording.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let device_rate = pipeline.device_rate();
        let mut pump = FramePump::new(
            self.socket_open.clone(),
            self.outbound.clone(),
            device_rate,
            self.settings.audio.input.sample_rate,
        );
        let recording = self.recording.clone();
        let session_id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            while recording.load(Ordering::SeqCst) {
                match frames.recv_timeout(Duration::from_millis(100)) {
                    Ok(frame) => {
                        pump.push(&frame);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(
                session = %session_id,
                sent = pump.sent(),
                discarded = pump.discarded(),
                "capture pump finished"
            );
        });

        *self.capture.lock().unwrap() = Some(pipeline);
        info!(session = %self.id, device_rate, "recording started");
        Ok(())
    }

    /// Release the microphone. Idempotent.
    pub fn stop_recording(&self) {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut pipeline) = self.capture.lock().unwrap().take() {
            pipeline.stop();
        }
        info!(session = %self.id, "recording stopped");
    }

    /// Flip between recording and not, based on the current flag.
    pub fn toggle_recording(&self) -> AgentResult<()> {
        if self.is_recording() {
            self.stop_recording();
            Ok(())
        } else {
            self.start_recording()
        }
    }

    /// Suspend the playback clock without losing scheduled audio.
    pub fn pause_playback(&self) {
        if let Some(engine) = self.playback.read().unwrap().as_ref() {
            engine.stop();
        }
    }

    /// Resume a suspended playback clock.
    pub fn resume_playback(&self) {
        if let Some(engine) = self.playback.read().unwrap().as_ref() {
            engine.resume();
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Shared handle to the live playback engine, for visualization reads.
    /// `None` outside a connected session's lifetime.
    pub fn playback(&self) -> Option<Arc<PlaybackEngine>> {
        self.playback.read().unwrap().clone()
    }

    /// Snapshot of every control message received so far, in arrival order.
    pub fn messages(&self) -> Vec<ControlMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// The subsequence of received messages whose `type` equals `kind`,
    /// preserving arrival order.
    pub fn messages_by_type(&self, kind: &str) -> Vec<ControlMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.kind == kind)
            .cloned()
            .collect()
    }

    fn build_request(&self) -> AgentResult<Request> {
        let mut request = self.config.endpoint.as_str().into_client_request()?;
        let protocols = format!("token, {}", self.token.expose());
        let value = HeaderValue::from_str(&protocols).map_err(|err| {
            AgentError::Config(format!("token is not a valid subprotocol value: {}", err))
        })?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        Ok(request)
    }

    fn teardown_playback(&self) {
        if let Some(engine) = self.playback.write().unwrap().take() {
            engine.destroy();
        }
    }

    fn enter_disconnected(&self) {
        *self.state.write().unwrap() = ConnectionState::Disconnected;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Route inbound frames until the socket ends: binary to the playback
/// engine, text to the message log. Frame-level failures are logged and
/// skipped; only transport failure or a close frame ends the loop.
async fn read_loop(
    mut stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    playback: Arc<PlaybackEngine>,
    messages: Arc<Mutex<Vec<ControlMessage>>>,
    state: Arc<RwLock<ConnectionState>>,
    socket_open: Arc<AtomicBool>,
    session_id: String,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if let Err(err) = playback.play(&data) {
                    warn!(session = %session_id, "dropped audio chunk: {}", err);
                }
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(message) => {
                    debug!(session = %session_id, kind = %message.kind, "control message");
                    messages.lock().unwrap().push(message);
                }
                Err(err) => {
                    warn!(session = %session_id, "dropped unparseable control frame: {}", err);
                }
            },
            Ok(Message::Close(reason)) => {
                info!(session = %session_id, ?reason, "server closed the session");
                break;
            }
            // pings are answered by the transport; pongs need no action
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Frame(_)) => {}
            Err(err) => {
                error!(session = %session_id, "socket error: {}", err);
                break;
            }
        }
    }

    socket_open.store(false, Ordering::SeqCst);
    *state.write().unwrap() = ConnectionState::Disconnected;
    info!(session = %session_id, "socket read loop ended");
}

/// Moves captured frames toward the socket, enforcing the no-stale-audio
/// rule: a frame produced while the socket is not open is discarded on the
/// spot, never queued for later.
struct FramePump {
    socket_open: Arc<AtomicBool>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    device_rate: u32,
    input_rate: u32,
    sent: usize,
    discarded: usize,
}

impl FramePump {
    fn new(
        socket_open: Arc<AtomicBool>,
        outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
        device_rate: u32,
        input_rate: u32,
    ) -> Self {
        Self {
            socket_open,
            outbound,
            device_rate,
            input_rate,
            sent: 0,
            discarded: 0,
        }
    }

    /// Resample, encode, and forward one frame. Returns whether it was sent.
    fn push(&mut self, frame: &[f32]) -> bool {
        if !self.socket_open.load(Ordering::SeqCst) {
            self.discarded += 1;
            return false;
        }
        let sender = match self.outbound.lock().unwrap().clone() {
            Some(sender) => sender,
            None => {
                self.discarded += 1;
                return false;
            }
        };

        let resampled = downsample(frame, self.device_rate, self.input_rate);
        let encoded = convert_f32_to_i16le(&resampled);
        if sender.send(Message::Binary(encoded)).is_err() {
            self.discarded += 1;
            return false;
        }
        self.sent += 1;
        true
    }

    fn sent(&self) -> usize {
        self.sent
    }

    fn discarded(&self) -> usize {
        self.discarded
    }
}
