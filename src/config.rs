//! # Configuration Management
//!
//! Two kinds of configuration live here and they travel different paths:
//!
//! - [`ClientConfig`] is local tuning for this process (endpoint URL, capture
//!   and analysis knobs). It is loaded from multiple sources in priority
//!   order: built-in defaults, then an optional `config.toml`, then
//!   environment variables with an `APP_` prefix.
//! - [`AgentSettings`] is the wire payload: the JSON object serialized and
//!   sent as the first control frame after the socket opens. It declares the
//!   audio encodings and sample rates for both directions, the agent
//!   behavior parameters, and optionally a conversation context to replay.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_ENDPOINT, APP_CAPTURE_DEVICE, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

use crate::error::{AgentError, AgentResult};

/// Local client configuration: where to connect and how to tune the audio
/// pipeline on this machine. Nothing in here is sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Agent endpoint URL (`ws://` or `wss://`)
    pub endpoint: String,
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
}

/// Microphone capture tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Input device name; `None` selects the system default microphone
    pub device: Option<String>,

    /// Samples per capture frame handed to the session (at the device rate)
    pub frame_samples: usize,

    /// Bounded frame channel capacity; frames beyond it are dropped and
    /// counted rather than letting the device callback block
    pub channel_capacity: usize,
}

/// Analysis snapshot tuning for the playback engine's visualization tap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Rolling window over the most recently rendered samples; also the FFT
    /// size, so it must be a power of two
    pub window_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/agent".to_string(),
            capture: CaptureConfig {
                device: None,
                frame_samples: 4096,
                channel_capacity: 32,
            },
            analysis: AnalysisConfig { window_size: 2048 },
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, then `config.toml` (if present),
    /// then `APP_`-prefixed environment variables.
    ///
    /// `ENDPOINT` is also honored without the prefix since deployment
    /// platforms commonly inject it that way.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(endpoint) = env::var("ENDPOINT") {
            settings = settings.set_override("endpoint", endpoint)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text. Used by tests and by callers
    /// that manage their own files instead of the `load()` search path.
    pub fn from_toml_str(text: &str) -> AgentResult<Self> {
        toml::from_str(text).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Check that the configuration values make sense before any device or
    /// socket is touched.
    pub fn validate(&self) -> AgentResult<()> {
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(AgentError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            )));
        }

        if self.capture.frame_samples == 0 {
            return Err(AgentError::Config(
                "capture.frame_samples must be greater than 0".to_string(),
            ));
        }

        if self.capture.channel_capacity == 0 {
            return Err(AgentError::Config(
                "capture.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.analysis.window_size < 32 || !self.analysis.window_size.is_power_of_two() {
            return Err(AgentError::Config(format!(
                "analysis.window_size must be a power of two >= 32, got {}",
                self.analysis.window_size
            )));
        }

        Ok(())
    }
}

/// Bearer token presented to the endpoint as a WebSocket subprotocol value.
///
/// Debug output is redacted so session logs never leak credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&"[REDACTED]").finish()
    }
}

impl From<String> for AccessToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for AccessToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// The settings object sent as the first control frame after the socket
/// opens. The remote service will not accept audio until it has seen one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Message tag, always "Settings"
    #[serde(rename = "type", default = "default_settings_kind")]
    pub kind: String,
    pub audio: AudioSettings,
    pub agent: AgentBehavior,
    /// Optional prior conversation to replay into the agent on connect
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<ConversationContext>,
}

fn default_settings_kind() -> String {
    "Settings".to_string()
}

/// Audio formats for both directions of the socket.
///
/// The input block is a promise about what this client will send (and is the
/// rate the capture pipeline resamples to); the output block tells the
/// service what to synthesize and fixes the playback engine's sample rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: OutputFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    /// PCM encoding name, e.g. "linear16"
    pub encoding: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormat {
    pub encoding: String,
    pub sample_rate: u32,
    /// Container for the synthesized stream; "none" means raw PCM chunks
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub container: Option<String>,
}

/// Agent behavior parameters: which models listen, think, and speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBehavior {
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkSettings {
    pub provider: ThinkProvider,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkProvider {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakSettings {
    pub model: String,
}

/// Prior conversation turns handed to the agent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
    pub replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            kind: default_settings_kind(),
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: 16_000,
                },
                output: OutputFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: 24_000,
                    container: Some("none".to_string()),
                },
            },
            agent: AgentBehavior {
                listen: ListenSettings {
                    model: "nova-2".to_string(),
                },
                think: ThinkSettings {
                    provider: ThinkProvider {
                        kind: "open_ai".to_string(),
                    },
                    model: "gpt-4o-mini".to_string(),
                    instructions: None,
                },
                speak: SpeakSettings {
                    model: "aura-asteria-en".to_string(),
                },
            },
            context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.capture.frame_samples, 4096);
        assert_eq!(config.analysis.window_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        config.endpoint = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.analysis.window_size = 1000; // not a power of two
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.capture.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            endpoint = "wss://agent.example.com/v1/converse"

            [capture]
            frame_samples = 2048
            channel_capacity = 16

            [analysis]
            window_size = 1024
        "#;
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.endpoint, "wss://agent.example.com/v1/converse");
        assert_eq!(config.capture.frame_samples, 2048);
        assert_eq!(config.capture.device, None);
        assert_eq!(config.analysis.window_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn settings_frame_matches_wire_schema() {
        let settings = AgentSettings::default();
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&settings).unwrap()).unwrap();

        assert_eq!(json["type"], "Settings");
        assert_eq!(json["audio"]["input"]["encoding"], "linear16");
        assert_eq!(json["audio"]["input"]["sample_rate"], 16_000);
        assert_eq!(json["audio"]["output"]["sample_rate"], 24_000);
        assert_eq!(json["agent"]["think"]["provider"]["type"], "open_ai");
        // absent context must be omitted entirely, not serialized as null
        assert!(json.get("context").is_none());
        assert!(json["agent"]["think"].get("instructions").is_none());
    }

    #[test]
    fn settings_context_round_trips() {
        let mut settings = AgentSettings::default();
        settings.context = Some(ConversationContext {
            messages: vec![ContextMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            replay: true,
        });

        let json = serde_json::to_string(&settings).unwrap();
        let back: AgentSettings = serde_json::from_str(&json).unwrap();
        let context = back.context.unwrap();
        assert!(context.replay);
        assert_eq!(context.messages[0].role, "user");
    }

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken::new("sk-very-secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("REDACTED"));
        assert_eq!(token.expose(), "sk-very-secret");
    }
}
