//! Broadcast engine: the single-owner event loop.
//!
//! One task owns all mutable state (buffer, scheduler, sessions, encoder
//! manager) and serializes every state change through one event channel.
//! Nothing else holds a lock or a shared reference; the gateway, the
//! generation tasks, and the encoder's background tasks only ever send
//! events here.
//!
//! # Architecture
//!
//! ```text
//! gateway ───► EngineEvent ──┐
//! generation ► ContentReady ─┼──► Engine::run() ──► SessionRegistry ──► viewers
//! encoder ───► EncoderEvent ─┘          │
//!                                       └──► EncoderManager ──► ffmpeg stdin
//! ```
//!
//! Timers are deadlines, not sleeps: the loop selects over an optional
//! typing deadline and an optional duration deadline, so a `configure`
//! or `stop` arriving mid-run takes effect on the very next tick.

pub mod events;
pub mod sessions;
pub mod typing;

pub use events::EngineEvent;
pub use sessions::{SessionHandle, SessionPayload, SessionRegistry};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{ConfigUpdate, EncoderSettings, RunConfig};
use crate::content::{ContentSource, GenerationParams};
use crate::encoder::{EncoderEvent, EncoderManager, EncoderState, FeedError, StartOutcome};
use crate::frame_buffer::FrameBuffer;
use crate::protocol::{ClientMessage, ServerEvent};
use typing::{CycleOutcome, Phase, TypingState};

/// Interval between viewer liveness sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long the exiting loop waits for the encoder reaper to finish.
/// Covers the full stdin-close/SIGTERM/SIGKILL escalation with margin.
const ENCODER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The engine's state and event loop.
pub struct Engine {
    config: RunConfig,
    buffer: FrameBuffer,
    typing: TypingState,
    sessions: SessionRegistry,
    encoder: EncoderManager,
    source: Arc<dyn ContentSource>,
    event_tx: UnboundedSender<EngineEvent>,
    event_rx: UnboundedReceiver<EngineEvent>,
    encoder_rx: UnboundedReceiver<EncoderEvent>,
    /// Characters typed in the current run.
    frame_count: u64,
    /// When to type the next character; `None` while not typing.
    typing_deadline: Option<Instant>,
    /// When the wall-clock run limit fires; `None` when no run or unlimited.
    duration_deadline: Option<Instant>,
}

impl Engine {
    /// Build an engine and the sender the gateway uses to reach it.
    #[must_use]
    pub fn new(
        config: RunConfig,
        encoder_settings: EncoderSettings,
        source: Arc<dyn ContentSource>,
    ) -> (Self, UnboundedSender<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (encoder_tx, encoder_rx) = mpsc::unbounded_channel();
        let buffer = FrameBuffer::new(config.terminal_width, config.max_lines);
        let engine = Self {
            buffer,
            typing: TypingState::new(),
            sessions: SessionRegistry::new(),
            encoder: EncoderManager::new(encoder_settings, encoder_tx),
            source,
            event_tx: event_tx.clone(),
            event_rx,
            encoder_rx,
            frame_count: 0,
            typing_deadline: None,
            duration_deadline: None,
            config,
        };
        (engine, event_tx)
    }

    /// Run the event loop until a `Shutdown` event arrives or every
    /// sender is gone.
    pub async fn run(mut self) {
        log::info!("[engine] event loop started");
        let mut sweep = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                () = sleep_until_opt(self.duration_deadline) => {
                    self.on_duration_expired();
                }
                () = sleep_until_opt(self.typing_deadline) => {
                    self.on_typing_tick();
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_event(event) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.encoder_rx.recv() => {
                    if let Some(event) = event {
                        self.on_encoder_event(event);
                    }
                }
                _ = sweep.tick() => {
                    self.sessions.sweep();
                }
            }
        }
        self.await_encoder_exit().await;
        self.sessions.close_all();
        log::info!("[engine] event loop stopped");
    }

    /// Stop the encoder and wait for its reaper to report the exit, so
    /// returning from the loop never strands a live child mid-escalation.
    async fn await_encoder_exit(&mut self) {
        if !self.encoder.stop() {
            return;
        }
        let instance = self.encoder.instance_id();
        let drained = tokio::time::timeout(ENCODER_EXIT_TIMEOUT, async {
            while let Some(event) = self.encoder_rx.recv().await {
                if let EncoderEvent::Exited {
                    instance: exited,
                    code,
                    requested,
                } = event
                {
                    self.encoder.handle_exit(exited, code, requested);
                    if exited == instance {
                        break;
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "[engine] encoder instance {instance} did not exit within {ENCODER_EXIT_TIMEOUT:?}"
            );
        }
    }

    /// Dispatch one event. Returns `true` to end the loop.
    fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::ViewerConnected { id, handle } => self.on_viewer_connected(id, handle),
            EngineEvent::ViewerMessage { id, raw } => self.on_viewer_message(id, &raw),
            EngineEvent::ViewerPong { id } => self.sessions.mark_activity(id),
            EngineEvent::ViewerDisconnected { id } => {
                if self.sessions.unregister(id).is_some() {
                    let viewers = self.sessions.len();
                    self.sessions.publish(&ServerEvent::log(format!(
                        "Viewer disconnected ({viewers} remaining)"
                    )));
                }
            }
            EngineEvent::ContentReady { generation, text } => {
                self.on_content_ready(generation, &text);
            }
            EngineEvent::Shutdown => {
                log::info!("[engine] shutdown requested");
                self.sessions.publish(&ServerEvent::log("Server shutting down"));
                return true;
            }
        }
        false
    }

    // ─── Viewer lifecycle ────────────────────────────────────────────────

    /// Register a viewer and replay the full current state so a
    /// mid-stream join renders identically to a viewer present from
    /// the start.
    fn on_viewer_connected(&mut self, id: Uuid, handle: SessionHandle) {
        self.sessions.register(id, handle);
        self.sessions.send_to(id, ServerEvent::status(self.run_status_label()));
        self.sessions
            .send_to(id, ServerEvent::stream_status(self.stream_status_label()));
        self.sessions.send_to(
            id,
            ServerEvent::TerminalContent {
                lines: self.buffer.snapshot(),
            },
        );
        self.sessions.send_to(
            id,
            ServerEvent::FrameUpdate {
                count: self.frame_count,
            },
        );
        self.sessions.send_to(
            id,
            ServerEvent::CycleUpdate {
                count: self.typing.cycle(),
            },
        );
        self.sessions
            .send_to(id, ServerEvent::ConfigUpdate(self.config.clone()));
        let viewers = self.sessions.len();
        self.sessions
            .publish(&ServerEvent::log(format!("Viewer connected ({viewers} total)")));
    }

    /// Parse and dispatch a viewer command. Malformed input is logged
    /// and dropped; it never affects the run or the connection.
    fn on_viewer_message(&mut self, id: Uuid, raw: &str) {
        self.sessions.mark_activity(id);
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[engine] ignoring malformed message from {id}: {e}");
                return;
            }
        };
        log::debug!("[engine] viewer {id} sent {message:?}");
        match message {
            ClientMessage::Start => self.start_run(),
            ClientMessage::Stop => self.stop_run(),
            ClientMessage::StartStream => self.start_stream(),
            ClientMessage::StopStream => self.stop_stream(),
            ClientMessage::Heartbeat => {
                self.sessions.send_to(id, ServerEvent::HeartbeatAck);
            }
            ClientMessage::Configure(update) => self.apply_config(&update),
        }
    }

    // ─── Run control ─────────────────────────────────────────────────────

    /// Begin a typing run. A no-op while one is already active.
    fn start_run(&mut self) {
        if self.typing.is_active() {
            log::debug!("[engine] start ignored, run already active");
            return;
        }
        log::info!(
            "[engine] starting run (cycles={}, duration={}s)",
            self.config.cycles,
            self.config.duration
        );
        self.frame_count = 0;
        self.buffer
            .set_limits(self.config.terminal_width, self.config.max_lines);
        self.buffer.clear();
        self.buffer.append(typing::INIT_BANNER);
        self.typing.begin_run();
        self.duration_deadline = self
            .config
            .duration_limit()
            .map(|limit| Instant::now() + limit);
        self.sessions.publish(&ServerEvent::status("Generating..."));
        self.sessions.publish(&ServerEvent::FrameUpdate { count: 0 });
        self.sessions.publish(&ServerEvent::TerminalContent {
            lines: self.buffer.snapshot(),
        });
        self.begin_cycle();
    }

    /// Halt the current run on operator request.
    fn stop_run(&mut self) {
        if !self.typing.is_active() {
            log::debug!("[engine] stop ignored, no active run");
            return;
        }
        log::info!("[engine] run stopped after {} cycles", self.typing.cycle());
        self.typing.halt(Phase::Idle);
        self.typing_deadline = None;
        self.duration_deadline = None;
        self.sessions.publish(&ServerEvent::status("Stopped"));
        self.sessions.publish(&ServerEvent::log("Run stopped"));
    }

    /// Advance to the next cycle: either request more content or end
    /// the run at the cycle limit.
    fn begin_cycle(&mut self) {
        self.typing_deadline = None;
        match self.typing.advance_cycle(self.config.cycles) {
            CycleOutcome::LimitReached => {
                log::info!("[engine] cycle limit reached, run complete");
                self.duration_deadline = None;
                self.buffer.append(&typing::completion_banner());
                self.sessions.publish(&ServerEvent::TerminalContent {
                    lines: self.buffer.snapshot(),
                });
                self.sessions.publish(&ServerEvent::status("Stopped"));
            }
            CycleOutcome::Proceed => {
                self.buffer
                    .append(&typing::cycle_banner(self.typing.cycle(), self.config.cycles));
                if self.config.show_thinking {
                    self.buffer.append(typing::THINKING_MARKER);
                }
                self.sessions.publish(&ServerEvent::CycleUpdate {
                    count: self.typing.cycle(),
                });
                self.sessions.publish(&ServerEvent::TerminalContent {
                    lines: self.buffer.snapshot(),
                });
                self.spawn_generation();
            }
        }
    }

    /// Request content for the current cycle in a background task.
    ///
    /// Failures are folded into the transcript as an inline error line,
    /// so a dead generator degrades the picture but never stalls the run.
    fn spawn_generation(&self) {
        let source = Arc::clone(&self.source);
        let prompt = self.typing.prompt().to_string();
        let generation = self.typing.generation();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let text = match source.generate(&prompt, &GenerationParams::default()).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("[engine] content generation failed: {e:#}");
                    format!("[ERROR: {e}]")
                }
            };
            let _ = event_tx.send(EngineEvent::ContentReady { generation, text });
        });
    }

    /// Install generated content and start typing it out. Results from a
    /// run that has since been stopped or restarted are discarded.
    fn on_content_ready(&mut self, generation: u64, text: &str) {
        if generation != self.typing.generation() || self.typing.phase() != Phase::Requesting {
            log::debug!("[engine] discarding stale generation result (gen {generation})");
            return;
        }
        self.typing.set_response(text);
        self.buffer.append("");
        self.sessions.publish(&ServerEvent::TerminalContent {
            lines: self.buffer.snapshot(),
        });
        self.typing_deadline = Some(Instant::now());
    }

    /// Type one character, or move to the next cycle when the current
    /// content is exhausted.
    fn on_typing_tick(&mut self) {
        self.typing_deadline = None;
        if self.typing.phase() != Phase::Typing {
            return;
        }
        match self.typing.next_char() {
            Some(ch) => {
                self.buffer.append_char(ch);
                self.frame_count += 1;
                self.broadcast_frame();
                self.typing_deadline = Some(Instant::now() + self.config.typing_delay());
            }
            None => self.begin_cycle(),
        }
    }

    /// End the run at the wall-clock limit.
    fn on_duration_expired(&mut self) {
        self.duration_deadline = None;
        if !self.typing.is_active() {
            return;
        }
        log::info!(
            "[engine] duration limit ({}s) reached, run complete",
            self.config.duration
        );
        self.buffer
            .append(&typing::duration_banner(self.config.duration));
        self.typing.halt(Phase::Stopped);
        self.typing_deadline = None;
        self.sessions.publish(&ServerEvent::TerminalContent {
            lines: self.buffer.snapshot(),
        });
        self.sessions.publish(&ServerEvent::status("Stopped"));
    }

    /// Publish the current frame to viewers and, when live, the encoder.
    fn broadcast_frame(&mut self) {
        let lines = self.buffer.snapshot();
        if *self.encoder.state() == EncoderState::Running {
            match self.encoder.feed(encode_frame(&lines)) {
                Ok(()) | Err(FeedError::NotRunning) => {}
                Err(FeedError::Backpressure) => {
                    log::debug!("[engine] encoder backlogged, frame dropped");
                }
            }
        }
        self.sessions.publish(&ServerEvent::FrameUpdate {
            count: self.frame_count,
        });
        self.sessions.publish(&ServerEvent::TerminalContent { lines });
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Merge a partial update, rewrap the buffer, and broadcast the full
    /// resulting configuration. Takes effect mid-run: the next typing
    /// tick uses the new delay and the rewrapped buffer.
    fn apply_config(&mut self, update: &ConfigUpdate) {
        self.config.apply(update);
        self.buffer
            .set_limits(self.config.terminal_width, self.config.max_lines);
        log::info!(
            "[engine] configuration updated (cycles={}, delay={}ms, width={})",
            self.config.cycles,
            self.config.typing_delay_ms,
            self.config.terminal_width
        );
        self.sessions
            .publish(&ServerEvent::ConfigUpdate(self.config.clone()));
        self.sessions.publish(&ServerEvent::TerminalContent {
            lines: self.buffer.snapshot(),
        });
        self.sessions
            .publish(&ServerEvent::log("Configuration updated"));
    }

    // ─── Streaming ───────────────────────────────────────────────────────

    fn start_stream(&mut self) {
        if !self.config.enable_streaming {
            log::info!("[engine] start-stream refused, streaming disabled");
            self.sessions
                .publish(&ServerEvent::log("Streaming is disabled in the configuration"));
            return;
        }
        self.sessions
            .publish(&ServerEvent::stream_status("Connecting..."));
        match self.encoder.start() {
            Ok(StartOutcome::Started(instance)) => {
                self.sessions
                    .publish(&ServerEvent::log(format!("Encoder instance {instance} started")));
                self.broadcast_stream_status();
            }
            Ok(StartOutcome::AlreadyRunning) => {
                self.sessions
                    .publish(&ServerEvent::log("Encoder already running"));
                self.broadcast_stream_status();
            }
            Err(e) => {
                log::error!("[engine] encoder start failed: {e:#}");
                self.sessions
                    .publish(&ServerEvent::log(format!("Failed to start encoder: {e}")));
                self.sessions.publish(&ServerEvent::stream_status("Error"));
            }
        }
    }

    fn stop_stream(&mut self) {
        if self.encoder.stop() {
            self.sessions
                .publish(&ServerEvent::log("Encoder stop requested"));
            self.broadcast_stream_status();
        } else {
            self.sessions
                .publish(&ServerEvent::log("Encoder is not running"));
        }
    }

    fn on_encoder_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::Stderr { instance, line } => {
                log::debug!("[encoder:{instance}] {line}");
            }
            EncoderEvent::Exited {
                instance,
                code,
                requested,
            } => {
                if !self.encoder.handle_exit(instance, code, requested) {
                    return;
                }
                match self.encoder.state() {
                    EncoderState::Crashed { code } => {
                        self.sessions.publish(&ServerEvent::log(format!(
                            "Encoder exited unexpectedly (code {code:?})"
                        )));
                        self.sessions.publish(&ServerEvent::stream_status("Error"));
                    }
                    _ => {
                        self.sessions.publish(&ServerEvent::log("Encoder stopped"));
                        self.sessions.publish(&ServerEvent::stream_status("Off"));
                    }
                }
            }
        }
    }

    // ─── Status derivation ───────────────────────────────────────────────

    fn run_status_label(&self) -> &'static str {
        match self.typing.phase() {
            Phase::Idle => "Ready",
            Phase::Requesting | Phase::Typing => "Generating...",
            Phase::Stopped => "Stopped",
        }
    }

    fn stream_status_label(&self) -> &'static str {
        match self.encoder.state() {
            EncoderState::Stopped | EncoderState::Stopping => "Off",
            EncoderState::Starting => "Connecting...",
            EncoderState::Running => "Live",
            EncoderState::Crashed { .. } => "Error",
        }
    }

    fn broadcast_stream_status(&mut self) {
        let label = self.stream_status_label();
        self.sessions.publish(&ServerEvent::stream_status(label));
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Serialize a frame for the encoder: the visible lines joined by
/// newlines, terminated by a form feed as the frame separator.
fn encode_frame(lines: &[String]) -> Bytes {
    let mut text = lines.join("\n");
    text.push('\n');
    text.push('\u{0c}');
    Bytes::from(text)
}

// ─────────────────────────────────────────── Tests ──
