//! Live terminal broadcast engine.
//!
//! Generates AI text server-side, types it into a virtual terminal one
//! character at a time, and fans every keystroke out to WebSocket viewers.
//! Optionally pipes rendered frames into an external encoder subprocess
//! (ffmpeg) pushing to an RTMP ingest.
//!
//! # Architecture
//!
//! - [`engine`]: single-owner event loop holding all mutable state
//! - [`gateway`]: WebSocket accept loop and per-viewer socket tasks
//! - [`frame_buffer`]: bounded, width-wrapped terminal scrollback
//! - [`content`]: HTTP text-generation client behind a trait
//! - [`encoder`]: encoder subprocess lifecycle and shutdown ladder
//! - [`protocol`]: JSON wire messages in both directions
//! - [`config`]: runtime configuration and partial updates

pub mod config;
pub mod content;
pub mod encoder;
pub mod engine;
pub mod frame_buffer;
pub mod gateway;
pub mod protocol;

pub use config::{ConfigUpdate, EncoderSettings, RunConfig};
pub use engine::{Engine, EngineEvent};
