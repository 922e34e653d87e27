//! External encoder subprocess lifecycle.
//!
//! [`EncoderManager`] owns at most one long-running encoder process at a
//! time and enforces the state machine
//! `Stopped → Starting → Running → (Stopping | Crashed) → Stopped`.
//!
//! # Architecture
//!
//! Three background tasks are spawned per instance:
//!
//! - **feeder**: drains a bounded frame channel into the child's stdin.
//!   Dropping the sender closes stdin, which signals end-of-stream.
//! - **stderr reader**: forwards diagnostic lines as
//!   [`EncoderEvent::Stderr`] (ffmpeg reports progress on stderr).
//! - **reaper**: waits for the child to exit, or runs the shutdown
//!   ladder when a stop is requested: close stdin, wait 1s for a graceful
//!   exit, SIGTERM, wait 5s, SIGKILL. Either way it reports
//!   [`EncoderEvent::Exited`].
//!
//! `stop()` transitions to `Stopping` synchronously and returns; the
//! reaper finishes in the background. An exit that was never requested
//! moves the state to `Crashed` and is never auto-restarted; restart
//! policy belongs to whoever observes the crash.
//!
//! # Backpressure
//!
//! `feed()` never blocks. When the bounded channel is full the frame is
//! rejected with [`FeedError::Backpressure`] and dropped (drop-newest):
//! under a stalled encoder the stream freezes on the last delivered frame
//! rather than replaying stale ones after recovery.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::EncoderSettings;

/// Frames buffered between the engine and the child's stdin.
pub const FEED_QUEUE_DEPTH: usize = 32;

/// Grace period after closing stdin before escalating to SIGTERM.
const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Grace period after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of the managed encoder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderState {
    /// No child process; the manager can start one.
    Stopped,
    /// Spawn in progress (transient within `start()`).
    Starting,
    /// Child spawned and accepting frames.
    Running,
    /// Stop requested; the reaper is shutting the child down.
    Stopping,
    /// Child exited without a stop request. Holds the exit code, if any.
    Crashed { code: Option<i32> },
}

/// Result of a `start()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new child was spawned; carries its instance id.
    Started(u64),
    /// A child is already running (or still stopping); nothing was done.
    AlreadyRunning,
}

/// Why a frame could not be fed.
#[derive(Debug, PartialEq, Eq)]
pub enum FeedError {
    /// The encoder is not in the `Running` state.
    NotRunning,
    /// The feed queue is full; the frame was dropped.
    Backpressure,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "encoder is not running"),
            Self::Backpressure => write!(f, "encoder feed queue is full"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Notification from an encoder background task.
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// One line of diagnostic output from the child's stderr.
    Stderr {
        /// Instance that produced the line.
        instance: u64,
        /// The diagnostic line, without the trailing newline.
        line: String,
    },
    /// The child exited.
    Exited {
        /// Instance that exited.
        instance: u64,
        /// Process exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// True when the exit followed an explicit `stop()`.
        requested: bool,
    },
}

/// Manager for the single external encoder subprocess.
#[derive(Debug)]
pub struct EncoderManager {
    settings: EncoderSettings,
    state: EncoderState,
    /// Monotonic spawn counter; each child gets the next id.
    instance_seq: u64,
    /// Instance id of the current (or most recent) child.
    current_instance: u64,
    feed_tx: Option<mpsc::Sender<Bytes>>,
    stop_tx: Option<oneshot::Sender<()>>,
    event_tx: UnboundedSender<EncoderEvent>,
}

impl EncoderManager {
    /// Create a manager in the `Stopped` state.
    ///
    /// Background tasks report through `event_tx`; the owner must route
    /// `Exited` events back into [`EncoderManager::handle_exit`].
    #[must_use]
    pub fn new(settings: EncoderSettings, event_tx: UnboundedSender<EncoderEvent>) -> Self {
        Self {
            settings,
            state: EncoderState::Stopped,
            instance_seq: 0,
            current_instance: 0,
            feed_tx: None,
            stop_tx: None,
            event_tx,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> &EncoderState {
        &self.state
    }

    /// Instance id of the current (or most recent) child.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.current_instance
    }

    /// True when a child may still be alive (`Starting`/`Running`/`Stopping`).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            EncoderState::Starting | EncoderState::Running | EncoderState::Stopping
        )
    }

    /// Launch the encoder toward `ingest_url`.
    ///
    /// A no-op returning [`StartOutcome::AlreadyRunning`] when a child is
    /// already live. A spawn failure transitions directly back to
    /// `Stopped` (never `Crashed`) and returns the error.
    ///
    /// # Errors
    ///
    /// Returns an error if no ingest URL is configured or the process
    /// cannot be spawned.
    pub fn start(&mut self) -> Result<StartOutcome> {
        if self.is_busy() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let ingest = self
            .settings
            .ingest_url
            .clone()
            .context("no ingest URL configured")?;

        self.state = EncoderState::Starting;

        let args = self.launch_args(&ingest);
        log::info!(
            "[encoder] launching {} ({} args)",
            self.settings.encoder_path,
            args.len()
        );

        let spawned = Command::new(&self.settings.encoder_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // Creation failure is not a crash: nothing ever ran.
                self.state = EncoderState::Stopped;
                return Err(e).with_context(|| {
                    format!("failed to spawn encoder '{}'", self.settings.encoder_path)
                });
            }
        };

        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            // Cannot happen with piped stdio; still, never leave the
            // state machine mid-transition with a live child.
            self.state = EncoderState::Stopped;
            let _ = child.start_kill();
            anyhow::bail!("encoder child is missing a stdio pipe");
        };

        self.instance_seq += 1;
        let instance = self.instance_seq;
        self.current_instance = instance;

        // Feeder: bounded queue into the child's stdin. Dropping the sender
        // ends the task, which drops stdin and signals end-of-stream.
        let (feed_tx, mut feed_rx) = mpsc::channel::<Bytes>(FEED_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = feed_rx.recv().await {
                if let Err(e) = stdin.write_all(&frame).await {
                    log::warn!("[encoder] stdin write failed: {e}");
                    break;
                }
            }
            // stdin dropped here → EOF on the child's input sink.
        });

        // Stderr reader: ffmpeg logs progress here; forward line by line.
        let stderr_event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_event_tx
                    .send(EncoderEvent::Stderr { instance, line })
                    .is_err()
                {
                    break;
                }
            }
        });

        // Reaper: waits for exit, or runs the shutdown ladder on stop().
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let exit_event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            reap(child, stop_rx, instance, exit_event_tx).await;
        });

        self.feed_tx = Some(feed_tx);
        self.stop_tx = Some(stop_tx);
        self.state = EncoderState::Running;

        log::info!("[encoder] instance {instance} running");
        Ok(StartOutcome::Started(instance))
    }

    /// Queue one frame for the child's stdin.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotRunning`] outside the `Running` state;
    /// [`FeedError::Backpressure`] when the queue is full (the frame is
    /// dropped, never queued unboundedly).
    pub fn feed(&mut self, frame: Bytes) -> Result<(), FeedError> {
        if self.state != EncoderState::Running {
            return Err(FeedError::NotRunning);
        }
        let Some(feed_tx) = &self.feed_tx else {
            return Err(FeedError::NotRunning);
        };
        match feed_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(FeedError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(FeedError::NotRunning),
        }
    }

    /// Request shutdown of the current child.
    ///
    /// Transitions to `Stopping` synchronously; the reaper closes stdin,
    /// then escalates TERM → KILL on the grace-period schedule. Returns
    /// `true` if a stop was initiated, `false` if nothing was running.
    pub fn stop(&mut self) -> bool {
        if !matches!(
            self.state,
            EncoderState::Starting | EncoderState::Running
        ) {
            return false;
        }
        // Closing the feed channel ends the feeder, which drops stdin.
        self.feed_tx = None;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.state = EncoderState::Stopping;
        log::info!("[encoder] stop requested for instance {}", self.current_instance);
        true
    }

    /// Apply an `Exited` event from the reaper.
    ///
    /// Returns `false` for stale events from a superseded instance.
    /// A requested exit (or one arriving while `Stopping`) lands on
    /// `Stopped`; an unsolicited exit while live lands on `Crashed`.
    pub fn handle_exit(&mut self, instance: u64, code: Option<i32>, requested: bool) -> bool {
        if instance != self.current_instance {
            log::debug!("[encoder] ignoring exit of stale instance {instance}");
            return false;
        }
        self.feed_tx = None;
        self.stop_tx = None;
        if requested || self.state == EncoderState::Stopping {
            log::info!("[encoder] instance {instance} stopped (code {code:?})");
            self.state = EncoderState::Stopped;
        } else {
            log::error!("[encoder] instance {instance} exited unexpectedly (code {code:?})");
            self.state = EncoderState::Crashed { code };
        }
        true
    }

    /// Run `<encoder> -version` and return the first line of output.
    ///
    /// Used as a startup availability check before any stream is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be executed or reports failure.
    pub fn probe(encoder_path: &str) -> Result<String> {
        let output = std::process::Command::new(encoder_path)
            .arg("-version")
            .output()
            .with_context(|| format!("failed to run '{encoder_path} -version'"))?;

        if !output.status.success() {
            anyhow::bail!(
                "'{encoder_path} -version' failed: {}",
                String::from_utf8_lossy(&output.stderr).lines().next().unwrap_or("")
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("").to_string())
    }

    /// Build the launch argument list.
    ///
    /// Frames arrive as raw video on stdin; audio is a silent lavfi source.
    /// `args_override` replaces the whole template for non-ffmpeg encoders.
    fn launch_args(&self, ingest: &str) -> Vec<String> {
        if let Some(args) = &self.settings.args_override {
            return args.clone();
        }
        let s = &self.settings;
        [
            "-re",
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", &s.resolution,
            "-r", &s.frame_rate.to_string(),
            "-i", "-",
            "-f", "lavfi",
            "-i", "anullsrc=r=44100:cl=stereo",
            "-c:v", "libx264",
            "-preset", "veryfast",
            "-maxrate", &s.video_bitrate,
            "-bufsize", "6000k",
            "-g", "60",
            "-pix_fmt", "yuv420p",
            "-c:a", "aac",
            "-b:a", &s.audio_bitrate,
            "-ar", "44100",
            "-f", "flv",
            ingest,
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }
}

/// Wait for the child to exit, or shut it down when a stop is signalled.
async fn reap(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    instance: u64,
    event_tx: UnboundedSender<EncoderEvent>,
) {
    let (code, requested) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            (code, false)
        }
        _ = &mut stop_rx => {
            let code = shutdown_ladder(&mut child, instance).await;
            (code, true)
        }
    };
    let _ = event_tx.send(EncoderEvent::Exited {
        instance,
        code,
        requested,
    });
}

/// Escalating shutdown: stdin is already closed by the feeder; wait, then
/// SIGTERM, wait, then SIGKILL. Returns the exit code if one was observed.
async fn shutdown_ladder(child: &mut Child, instance: u64) -> Option<i32> {
    if let Ok(status) = tokio::time::timeout(STDIN_CLOSE_GRACE, child.wait()).await {
        return status.ok().and_then(|s| s.code());
    }

    if let Some(pid) = child.id() {
        log::debug!("[encoder] instance {instance} still alive, sending SIGTERM to {pid}");
        // SAFETY: pid comes from a child we own; worst case the signal
        // targets an already-reaped process and errors with ESRCH.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
        return status.ok().and_then(|s| s.code());
    }

    log::warn!("[encoder] instance {instance} ignored SIGTERM, killing");
    let _ = child.kill().await;
    child.wait().await.ok().and_then(|s| s.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn manager_with(settings: EncoderSettings) -> (EncoderManager, mpsc::UnboundedReceiver<EncoderEvent>) {
        let (tx, rx) = unbounded_channel();
        (EncoderManager::new(settings, tx), rx)
    }

    #[tokio::test]
    async fn test_new_manager_is_stopped() {
        let (manager, _rx) = manager_with(EncoderSettings::default());
        assert_eq!(*manager.state(), EncoderState::Stopped);
        assert_eq!(manager.instance_id(), 0);
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn test_feed_while_stopped_is_not_running() {
        let (mut manager, _rx) = manager_with(EncoderSettings::default());
        let result = manager.feed(Bytes::from_static(b"frame"));
        assert_eq!(result, Err(FeedError::NotRunning));
    }

    #[tokio::test]
    async fn test_stop_while_stopped_is_noop() {
        let (mut manager, _rx) = manager_with(EncoderSettings::default());
        assert!(!manager.stop());
        assert_eq!(*manager.state(), EncoderState::Stopped);
    }

    #[tokio::test]
    async fn test_start_without_ingest_url_is_error() {
        let (mut manager, _rx) = manager_with(EncoderSettings::default());
        let result = manager.start();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_lands_on_stopped_not_crashed() {
        let settings = EncoderSettings {
            encoder_path: "/nonexistent/encoder-binary".to_string(),
            ingest_url: Some("rtmp://example.invalid/live".to_string()),
            ..EncoderSettings::default()
        };
        let (mut manager, _rx) = manager_with(settings);
        let result = manager.start();
        assert!(result.is_err());
        assert_eq!(*manager.state(), EncoderState::Stopped);
        // Nothing ran, so no instance was consumed.
        assert_eq!(manager.instance_id(), 0);
        // A failed start must not wedge the manager: the next attempt
        // reaches spawn again instead of reporting a busy state.
        assert!(manager.start().is_err());
        assert_eq!(*manager.state(), EncoderState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_exit_event_is_ignored() {
        let (mut manager, _rx) = manager_with(EncoderSettings::default());
        // Exit report for an instance this manager never started.
        assert!(!manager.handle_exit(7, Some(0), false));
        assert_eq!(*manager.state(), EncoderState::Stopped);
    }

    #[test]
    fn test_launch_args_include_target_and_resolution() {
        let settings = EncoderSettings {
            ingest_url: Some("rtmp://ingest.example/live/key".to_string()),
            ..EncoderSettings::default()
        };
        let (tx, _rx) = unbounded_channel();
        let manager = EncoderManager::new(settings, tx);
        let args = manager.launch_args("rtmp://ingest.example/live/key");
        assert_eq!(args.last().map(String::as_str), Some("rtmp://ingest.example/live/key"));
        assert!(args.iter().any(|a| a == "1280x720"));
        assert!(args.iter().any(|a| a == "flv"));
    }

    #[test]
    fn test_args_override_replaces_template() {
        let settings = EncoderSettings {
            args_override: Some(vec!["-".to_string()]),
            ..EncoderSettings::default()
        };
        let (tx, _rx) = unbounded_channel();
        let manager = EncoderManager::new(settings, tx);
        assert_eq!(manager.launch_args("ignored"), vec!["-".to_string()]);
    }
}
