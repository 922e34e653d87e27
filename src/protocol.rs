//! Viewer wire protocol.
//!
//! JSON text frames in both directions, internally tagged on `"type"`.
//! Client commands use kebab-case tags (`start-stream`); server events use
//! camelCase tags (`streamStatus`) to match what the web client renders.
//!
//! # Message Flow
//!
//! ```text
//! Viewer ──► ClientMessage ──► engine command routing
//! Engine ──► ServerEvent   ──► every registered viewer session
//! ```
//!
//! Unknown or malformed client messages are logged and dropped by the
//! engine; they never terminate the connection or the event loop.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigUpdate, RunConfig};

/// Inbound control command from a viewer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Begin a typing run.
    #[serde(rename = "start")]
    Start,
    /// Stop the current typing run.
    #[serde(rename = "stop")]
    Stop,
    /// Launch the encoder subprocess and begin pushing frames.
    #[serde(rename = "start-stream")]
    StartStream,
    /// Stop the encoder subprocess.
    #[serde(rename = "stop-stream")]
    StopStream,
    /// Liveness acknowledgement; resets the session's heartbeat state.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    /// Partial configuration replacement.
    #[serde(rename = "configure")]
    Configure(ConfigUpdate),
}

/// Outbound event broadcast to viewer sessions.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Scheduler status line (`Ready`, `Generating...`, `Stopped`).
    Status { message: String },
    /// Encoder status line (`Off`, `Connecting...`, `Live`, `Error`).
    StreamStatus { message: String },
    /// Full scrollback snapshot, oldest line first.
    TerminalContent { lines: Vec<String> },
    /// Monotonic typed-character counter for the current run.
    FrameUpdate { count: u64 },
    /// Current cycle number for the current run.
    CycleUpdate { count: u64 },
    /// Complete active configuration after an atomic replace.
    ConfigUpdate(RunConfig),
    /// Operational log line for the viewer's console pane.
    Log { message: String },
    /// Response to a client `heartbeat` command.
    HeartbeatAck,
}

impl ServerEvent {
    /// Convenience constructor for `Status`.
    #[must_use]
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Convenience constructor for `StreamStatus`.
    #[must_use]
    pub fn stream_status(message: impl Into<String>) -> Self {
        Self::StreamStatus {
            message: message.into(),
        }
    }

    /// Convenience constructor for `Log`.
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }
}
