//! Runtime configuration for the broadcast engine.
//!
//! [`RunConfig`] is owned by the engine and replaced only through
//! [`RunConfig::apply`], which merges a partial [`ConfigUpdate`] atomically:
//! fields absent from the update keep their current values. Serialized field
//! names use camelCase to match the viewer wire protocol.

use serde::{Deserialize, Serialize};

/// Active engine configuration.
///
/// Broadcast to viewers verbatim as the payload of a `configUpdate` event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Wall-clock run limit in seconds. 0 = unlimited.
    pub duration: u64,
    /// Number of generate-then-type cycles per run. 0 = unlimited.
    pub cycles: u64,
    /// Delay between typed characters in milliseconds. Historically named
    /// `typingSpeed` on the wire.
    #[serde(rename = "typingSpeed")]
    pub typing_delay_ms: u64,
    /// Terminal width in characters; rendered lines never exceed this.
    pub terminal_width: usize,
    /// Scrollback depth in rendered lines.
    pub max_lines: usize,
    /// Whether to render a `[THINKING...]` marker while a request is pending.
    pub show_thinking: bool,
    /// Whether `start-stream` commands may launch the encoder.
    pub enable_streaming: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration: 300,
            cycles: 15,
            typing_delay_ms: 60,
            terminal_width: 70,
            max_lines: crate::frame_buffer::DEFAULT_MAX_LINES,
            show_thinking: true,
            enable_streaming: true,
        }
    }
}

impl RunConfig {
    /// Merge a partial update into this configuration.
    ///
    /// Only fields present in `update` are replaced; everything else keeps
    /// its current value. Zero-valued width/depth fields are rejected
    /// (logged and skipped) so the frame buffer invariants always hold.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(duration) = update.duration {
            self.duration = duration;
        }
        if let Some(cycles) = update.cycles {
            self.cycles = cycles;
        }
        if let Some(delay) = update.typing_delay_ms {
            self.typing_delay_ms = delay;
        }
        if let Some(width) = update.terminal_width {
            if width > 0 {
                self.terminal_width = width;
            } else {
                log::warn!("[config] ignoring terminalWidth=0 in update");
            }
        }
        if let Some(max_lines) = update.max_lines {
            if max_lines > 0 {
                self.max_lines = max_lines;
            } else {
                log::warn!("[config] ignoring maxLines=0 in update");
            }
        }
        if let Some(show_thinking) = update.show_thinking {
            self.show_thinking = show_thinking;
        }
        if let Some(enable_streaming) = update.enable_streaming {
            self.enable_streaming = enable_streaming;
        }
    }

    /// Per-character typing delay as a `Duration`.
    #[must_use]
    pub fn typing_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.typing_delay_ms)
    }

    /// Wall-clock run limit, or `None` when unlimited.
    #[must_use]
    pub fn duration_limit(&self) -> Option<std::time::Duration> {
        (self.duration > 0).then(|| std::time::Duration::from_secs(self.duration))
    }

    /// Apply `TERMCAST_*` environment variable overrides.
    ///
    /// Unparseable values are ignored, matching flag-style leniency.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(duration) = std::env::var("TERMCAST_DURATION_SECS") {
            if let Ok(value) = duration.parse::<u64>() {
                self.duration = value;
            }
        }
        if let Ok(cycles) = std::env::var("TERMCAST_CYCLES") {
            if let Ok(value) = cycles.parse::<u64>() {
                self.cycles = value;
            }
        }
        if let Ok(delay) = std::env::var("TERMCAST_TYPING_DELAY_MS") {
            if let Ok(value) = delay.parse::<u64>() {
                self.typing_delay_ms = value;
            }
        }
        if let Ok(width) = std::env::var("TERMCAST_TERMINAL_WIDTH") {
            if let Ok(value) = width.parse::<usize>() {
                if value > 0 {
                    self.terminal_width = value;
                }
            }
        }
    }
}

/// Partial configuration carried by a `configure` command.
///
/// Every field is optional; see [`RunConfig::apply`] for merge semantics.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub duration: Option<u64>,
    pub cycles: Option<u64>,
    #[serde(rename = "typingSpeed")]
    pub typing_delay_ms: Option<u64>,
    pub terminal_width: Option<usize>,
    pub max_lines: Option<usize>,
    pub show_thinking: Option<bool>,
    pub enable_streaming: Option<bool>,
}

/// Launch parameters for the external encoder subprocess.
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    /// Encoder executable; resolved via `PATH` when not absolute.
    pub encoder_path: String,
    /// Ingest endpoint the encoder pushes to. Streaming is refused when unset.
    pub ingest_url: Option<String>,
    /// Output resolution, e.g. `1280x720`.
    pub resolution: String,
    /// Output frame rate.
    pub frame_rate: u32,
    /// Video bitrate cap, e.g. `3000k`.
    pub video_bitrate: String,
    /// Audio bitrate, e.g. `160k`.
    pub audio_bitrate: String,
    /// Verbatim argument override for non-ffmpeg encoders; bypasses the
    /// built-in argument template when set.
    pub args_override: Option<Vec<String>>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            encoder_path: "ffmpeg".to_string(),
            ingest_url: None,
            resolution: "1280x720".to_string(),
            frame_rate: 30,
            video_bitrate: "3000k".to_string(),
            audio_bitrate: "160k".to_string(),
            args_override: None,
        }
    }
}

impl EncoderSettings {
    /// Apply `TERMCAST_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TERMCAST_ENCODER_PATH") {
            self.encoder_path = path;
        }
        if let Ok(url) = std::env::var("TERMCAST_INGEST_URL") {
            if !url.is_empty() {
                self.ingest_url = Some(url);
            }
        }
    }
}
