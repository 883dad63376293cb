//! # Voice Agent Client
//!
//! A client library for real-time voice-agent services. It owns one
//! bidirectional WebSocket per session, streams microphone audio up as
//! 16-bit PCM, schedules synthesized speech coming back into gapless local
//! playback, and keeps an ordered log of the JSON control messages the
//! agent sends alongside the audio.
//!
//! ## Application Architecture:
//! - **config**: local client tuning plus the settings frame sent on connect
//! - **error**: the failure taxonomy (transport, decode, parse, device)
//! - **audio**: capture, PCM conversion, gapless playback, analysis tap
//! - **session**: the connection lifecycle and frame routing
//!
//! ## Typical Use:
//! ```no_run
//! use voice_agent_client::{AgentSettings, ClientConfig, Session};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = Session::new(ClientConfig::load()?, AgentSettings::default(), "token");
//! session.connect().await?;
//! session.start_recording()?;
//! // ... render session.playback() data, read session.messages() ...
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod session;

pub use audio::capture::list_devices;
pub use audio::playback::PlaybackEngine;
pub use config::{AccessToken, AgentSettings, ClientConfig};
pub use error::{AgentError, AgentResult};
pub use session::{ConnectionState, ControlMessage, Session};
