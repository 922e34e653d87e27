//! Viewer session registry.
//!
//! Each connected viewer owns an unbounded channel into its writer task;
//! the registry holds the sender halves. Broadcast is fire-and-forget:
//! a send failure means the writer task is gone, and the session is
//! evicted on the spot so one dead viewer never slows the rest.
//!
//! Liveness is a two-phase sweep. Every sweep interval the registry sends
//! a protocol-level ping probe to sessions that have been quiet; a session
//! that was already unconfirmed from the previous sweep is closed instead.
//! Any inbound traffic (commands, pongs) re-confirms a session.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Instruction delivered to a session's writer task.
#[derive(Debug, Clone)]
pub enum SessionPayload {
    /// Serialize and send a protocol event as a text frame.
    Event(ServerEvent),
    /// Send a protocol-level ping frame.
    Probe,
    /// Close the connection and end the writer task.
    Close,
}

/// Sender half of a session's writer channel.
#[derive(Debug, Clone)]
pub struct SessionHandle(UnboundedSender<SessionPayload>);

impl SessionHandle {
    #[must_use]
    pub fn new(tx: UnboundedSender<SessionPayload>) -> Self {
        Self(tx)
    }

    /// Queue a payload; `false` means the writer task is gone.
    pub fn send(&self, payload: SessionPayload) -> bool {
        self.0.send(payload).is_ok()
    }
}

#[derive(Debug)]
struct ViewerSession {
    handle: SessionHandle,
    /// Cleared when a liveness probe goes out; set by any inbound traffic.
    confirmed: bool,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// All connected viewers, keyed by connection id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, ViewerSession>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected viewers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Add a freshly connected viewer.
    pub fn register(&mut self, id: Uuid, handle: SessionHandle) {
        let now = Utc::now();
        self.sessions.insert(
            id,
            ViewerSession {
                handle,
                confirmed: true,
                connected_at: now,
                last_seen: now,
            },
        );
        log::info!("[sessions] viewer {id} connected ({} total)", self.len());
    }

    /// Remove a viewer. Returns how long it was connected, if known.
    pub fn unregister(&mut self, id: Uuid) -> Option<chrono::Duration> {
        let session = self.sessions.remove(&id)?;
        let connected_for = Utc::now() - session.connected_at;
        log::info!(
            "[sessions] viewer {id} disconnected after {}s ({} remaining)",
            connected_for.num_seconds(),
            self.len()
        );
        Some(connected_for)
    }

    /// Record inbound traffic from a viewer, re-confirming its liveness.
    pub fn mark_activity(&mut self, id: Uuid) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.confirmed = true;
            session.last_seen = Utc::now();
        }
    }

    /// Send an event to every viewer, evicting sessions whose writer task
    /// is gone. Returns the number of evictions.
    pub fn publish(&mut self, event: &ServerEvent) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|id, session| {
                let alive = session.handle.send(SessionPayload::Event(event.clone()));
                if !alive {
                    log::debug!("[sessions] evicting viewer {id} (writer gone)");
                }
                alive
            });
        before - self.sessions.len()
    }

    /// Send an event to one viewer. `false` if unknown or unreachable.
    pub fn send_to(&mut self, id: Uuid, event: ServerEvent) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                let ok = session.handle.send(SessionPayload::Event(event));
                if !ok {
                    self.sessions.remove(&id);
                }
                ok
            }
            None => false,
        }
    }

    /// Close every session and clear the registry. Used at shutdown so
    /// viewers receive a clean close frame instead of a reset.
    pub fn close_all(&mut self) {
        for (id, session) in self.sessions.drain() {
            if !session.handle.send(SessionPayload::Close) {
                log::debug!("[sessions] viewer {id} already gone at shutdown");
            }
        }
    }

    /// Run one liveness sweep: close sessions that never answered the
    /// previous probe, then probe everyone else. Returns the ids closed.
    pub fn sweep(&mut self) -> Vec<Uuid> {
        let mut closed = Vec::new();
        self.sessions.retain(|id, session| {
            if !session.confirmed {
                let idle = (Utc::now() - session.last_seen).num_seconds();
                log::info!("[sessions] closing viewer {id} after {idle}s without activity");
                session.handle.send(SessionPayload::Close);
                closed.push(*id);
                return false;
            }
            session.confirmed = false;
            session.handle.send(SessionPayload::Probe)
        });
        if !closed.is_empty() {
            log::info!(
                "[sessions] closed {} unresponsive viewer(s), {} remaining",
                closed.len(),
                self.len()
            );
        }
        closed
    }
}

// ─────────────────────────────────────────── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session() -> (SessionHandle, mpsc::UnboundedReceiver<SessionPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(tx), rx)
    }

    // ── Registration ──────────────────────────────────────────────────────

    #[test]
    fn test_register_and_unregister() {
        let mut registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (handle, _rx) = session();
        registry.register(id, handle);
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(id).is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister(id).is_none());
    }

    // ── Publish ───────────────────────────────────────────────────────────

    #[test]
    fn test_publish_reaches_all_viewers() {
        let mut registry = SessionRegistry::new();
        let (handle_a, mut rx_a) = session();
        let (handle_b, mut rx_b) = session();
        registry.register(Uuid::new_v4(), handle_a);
        registry.register(Uuid::new_v4(), handle_b);

        let evicted = registry.publish(&ServerEvent::HeartbeatAck);
        assert_eq!(evicted, 0);
        assert!(matches!(rx_a.try_recv(), Ok(SessionPayload::Event(_))));
        assert!(matches!(rx_b.try_recv(), Ok(SessionPayload::Event(_))));
    }

    #[test]
    fn test_publish_evicts_dead_writer() {
        let mut registry = SessionRegistry::new();
        let (handle_dead, rx_dead) = session();
        let (handle_live, mut rx_live) = session();
        registry.register(Uuid::new_v4(), handle_dead);
        registry.register(Uuid::new_v4(), handle_live);
        drop(rx_dead);

        let evicted = registry.publish(&ServerEvent::HeartbeatAck);
        assert_eq!(evicted, 1);
        assert_eq!(registry.len(), 1);
        assert!(matches!(rx_live.try_recv(), Ok(SessionPayload::Event(_))));
    }

    #[test]
    fn test_send_to_unknown_viewer_is_false() {
        let mut registry = SessionRegistry::new();
        assert!(!registry.send_to(Uuid::new_v4(), ServerEvent::HeartbeatAck));
    }

    // ── Liveness sweep ────────────────────────────────────────────────────

    #[test]
    fn test_sweep_probes_then_closes_silent_viewers() {
        let mut registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (handle, mut rx) = session();
        registry.register(id, handle);

        // First sweep: still confirmed from registration, gets a probe.
        assert!(registry.sweep().is_empty());
        assert!(matches!(rx.try_recv(), Ok(SessionPayload::Probe)));

        // No pong arrives; second sweep closes the session.
        let closed = registry.sweep();
        assert_eq!(closed, vec![id]);
        assert!(registry.is_empty());
        assert!(matches!(rx.try_recv(), Ok(SessionPayload::Close)));
    }

    #[test]
    fn test_activity_between_sweeps_keeps_session() {
        let mut registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (handle, mut rx) = session();
        registry.register(id, handle);

        registry.sweep();
        registry.mark_activity(id);
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);

        // Both sweeps probed the still-live session.
        assert!(matches!(rx.try_recv(), Ok(SessionPayload::Probe)));
        assert!(matches!(rx.try_recv(), Ok(SessionPayload::Probe)));
    }
}
