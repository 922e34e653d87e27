//! Engine event types.
//!
//! Everything that can happen to the engine arrives as an [`EngineEvent`]
//! on a single unbounded channel: viewer lifecycle from the gateway,
//! completed generation tasks, and process shutdown. Encoder child events
//! travel on their own channel so the encoder tasks never need a handle
//! to the engine.

use uuid::Uuid;

use super::sessions::SessionHandle;

/// Input to the engine's event loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// A viewer completed the WebSocket handshake.
    ViewerConnected { id: Uuid, handle: SessionHandle },
    /// A viewer sent a text frame; `raw` is the unparsed payload.
    ViewerMessage { id: Uuid, raw: String },
    /// A viewer answered a protocol-level ping.
    ViewerPong { id: Uuid },
    /// A viewer's connection closed or errored.
    ViewerDisconnected { id: Uuid },
    /// A generation task finished. `generation` tags the run that spawned
    /// it; stale results are discarded.
    ContentReady { generation: u64, text: String },
    /// Begin graceful shutdown of the whole engine.
    Shutdown,
}
