//! termcast daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use termcast::content::HttpContentSource;
use termcast::encoder::EncoderManager;
use termcast::{gateway, Engine, EngineEvent, EncoderSettings, RunConfig};

/// Grace period for the engine to drain at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "termcast", version, about = "Live terminal broadcast engine")]
struct Cli {
    /// Port for the WebSocket listener (overridden by $PORT).
    #[arg(short, long, default_value_t = 10000)]
    port: u16,

    /// Content generation endpoint URL.
    #[arg(long, default_value = "http://127.0.0.1:8080/generate")]
    content_url: String,

    /// Bearer token for the content endpoint.
    #[arg(long)]
    api_key: Option<String>,

    /// Ingest endpoint for the encoder (e.g. rtmp://...). Streaming is
    /// refused when neither this nor $TERMCAST_INGEST_URL is set.
    #[arg(long)]
    ingest_url: Option<String>,

    /// Encoder executable.
    #[arg(long)]
    encoder_path: Option<String>,

    /// Wall-clock run limit in seconds (0 = unlimited).
    #[arg(long)]
    duration: Option<u64>,

    /// Cycles per run (0 = unlimited).
    #[arg(long)]
    cycles: Option<u64>,

    /// Delay between typed characters in milliseconds.
    #[arg(long)]
    typing_delay_ms: Option<u64>,

    /// Terminal width in characters.
    #[arg(long)]
    terminal_width: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // Platform conventions (Render, Heroku) inject the port as $PORT.
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(cli.port);

    // Env overrides first, explicit flags last.
    let mut config = RunConfig::default();
    config.apply_env_overrides();
    if let Some(duration) = cli.duration {
        config.duration = duration;
    }
    if let Some(cycles) = cli.cycles {
        config.cycles = cycles;
    }
    if let Some(delay) = cli.typing_delay_ms {
        config.typing_delay_ms = delay;
    }
    if let Some(width) = cli.terminal_width.filter(|w| *w > 0) {
        config.terminal_width = width;
    }

    let mut encoder_settings = EncoderSettings::default();
    encoder_settings.apply_env_overrides();
    if let Some(path) = cli.encoder_path {
        encoder_settings.encoder_path = path;
    }
    if let Some(url) = cli.ingest_url {
        encoder_settings.ingest_url = Some(url);
    }

    // Fail fast when streaming is configured but the encoder is missing;
    // otherwise run without it and let start-stream report the problem.
    match EncoderManager::probe(&encoder_settings.encoder_path) {
        Ok(version) => log::info!("encoder available: {version}"),
        Err(e) if encoder_settings.ingest_url.is_some() && config.enable_streaming => {
            return Err(e.context("streaming is configured but the encoder is unavailable"));
        }
        Err(e) => log::warn!("encoder unavailable, streaming disabled: {e:#}"),
    }

    let content_url = std::env::var("TERMCAST_CONTENT_URL").unwrap_or(cli.content_url);
    let api_key = cli
        .api_key
        .or_else(|| std::env::var("TERMCAST_API_KEY").ok());
    let source = Arc::new(HttpContentSource::new(content_url, api_key)?);
    log::info!("content endpoint: {}", source.url());

    let (engine, engine_tx) = Engine::new(config, encoder_settings, source);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    log::info!("listening for viewers on port {port}");

    let engine_task = tokio::spawn(engine.run());
    tokio::spawn(gateway::run(listener, engine_tx.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    log::info!("interrupt received, shutting down");

    let _ = engine_tx.send(EngineEvent::Shutdown);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, engine_task)
        .await
        .is_err()
    {
        log::warn!("engine did not stop within {SHUTDOWN_TIMEOUT:?}");
    }
    Ok(())
}
