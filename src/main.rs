//! # Voice Agent Client - Demo Driver
//!
//! A headless driver around the library: connect to the configured agent
//! endpoint, stream the default microphone, play the agent's replies, and
//! print conversation turns as they arrive. Useful for exercising an
//! endpoint without any UI in front of the session.
//!
//! ## Environment:
//! - `AGENT_TOKEN`: bearer token presented at connect time
//! - `ENDPOINT` / `APP_ENDPOINT`: agent endpoint URL override
//! - `RUST_LOG`: log filter (defaults to `voice_agent_client=debug,info`)

use anyhow::Result;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_agent_client::{AgentSettings, ClientConfig, Session};

/// Global shutdown signal set by the signal handler task and polled by the
/// main loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = ClientConfig::load()?;
    config.validate()?;
    let token = env::var("AGENT_TOKEN").unwrap_or_default();
    if token.is_empty() {
        warn!("AGENT_TOKEN is not set; connecting without credentials");
    }

    info!("starting voice-agent-client v{}", env!("CARGO_PKG_VERSION"));
    info!("endpoint: {}", config.endpoint);

    let session = Session::new(config, AgentSettings::default(), token);
    session.connect().await?;

    // a missing microphone should not kill a listen-only session
    if let Err(err) = session.start_recording() {
        warn!("recording unavailable, continuing listen-only: {}", err);
    }

    setup_signal_handlers();

    // print conversation turns as the agent produces them
    let mut printed = 0;
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) && session.is_connected() {
        tokio::time::sleep(Duration::from_millis(250)).await;

        let turns = session.messages_by_type("ConversationText");
        for turn in turns.iter().skip(printed) {
            info!(
                "[{}] {}",
                turn.role.as_deref().unwrap_or("unknown"),
                turn.content.as_deref().unwrap_or_default()
            );
        }
        printed = turns.len();
    }

    info!("shutting down");
    session.disconnect();
    Ok(())
}

/// Set up structured logging with an environment-driven filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_agent_client=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and flip the shutdown flag so the main
/// loop can tear the session down instead of dying mid-stream.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}
