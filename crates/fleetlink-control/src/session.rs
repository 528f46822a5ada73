//! Session registry enforcing the one-session-per-identity invariant
//!
//! Each admitted session is owned by exactly one connection task; everything
//! else (broadcast distributor, addressed dispatcher, operator API) reaches
//! the stream only through the [`SessionHandle`] outbound queue. The map is
//! guarded by a single mutex held for the mutation only, never across a
//! network send.

use crate::error::ControlError;
use chrono::{DateTime, Utc};
use fleetlink_proto::{ClientKind, ControlMessage, EndpointId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tuning knobs for session admission and teardown
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an end-of-input session may linger in `Draining` before
    /// eviction
    pub drain_grace: Duration,
    /// Depth of each session's outbound queue
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(30),
            queue_capacity: 64,
        }
    }
}

/// Phase of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Stream fully open
    Active,
    /// Peer half-closed its send side; evicted unless it resumes within the
    /// grace window
    Draining,
}

/// Error returned when a queued send cannot be accepted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionSendError {
    #[error("session outbound queue is full")]
    Backlogged,
    #[error("session task is gone")]
    Closed,
}

/// Send half of one session
///
/// Cheap to clone; pushing never blocks. The connection task that owns the
/// stream drains this queue onto the wire.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub endpoint_id: EndpointId,
    pub kind: ClientKind,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
    epoch: u64,
}

impl SessionHandle {
    /// Queue a message for delivery on this session without blocking
    pub fn push(&self, message: ControlMessage) -> Result<(), SessionSendError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionSendError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => SessionSendError::Closed,
        })
    }
}

/// Everything the connection task receives from a successful admission
pub struct AdmittedSession {
    /// Holding this keeps the registry entry; dropping it evicts the session
    /// unless a newer session has already taken the slot
    pub lease: SessionLease,
    /// Receive side of the session's outbound queue
    pub outbound: mpsc::Receiver<ControlMessage>,
    /// Fires when the session is evicted from outside the connection task
    pub cancel: CancellationToken,
}

/// Snapshot of one session for operator listings
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub endpoint_id: EndpointId,
    pub kind: ClientKind,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub phase: SessionPhase,
}

#[derive(Debug)]
struct SessionEntry {
    handle: SessionHandle,
    phase: SessionPhase,
}

/// Registry of live sessions, one per identity
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<EndpointId, SessionEntry>>>,
    next_epoch: Arc<AtomicU64>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Grace window a draining session is granted before eviction
    pub fn drain_grace(&self) -> Duration {
        self.config.drain_grace
    }

    /// Admit a new session for `endpoint_id`
    ///
    /// Fails with [`ControlError::AlreadyConnected`] while any live session
    /// (active or draining) holds the slot. On success the caller owns the
    /// returned lease for the stream's lifetime.
    pub fn admit(
        &self,
        endpoint_id: EndpointId,
        kind: ClientKind,
        peer_addr: Option<SocketAddr>,
    ) -> Result<AdmittedSession, ControlError> {
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.contains_key(&endpoint_id) {
            tracing::warn!(endpoint_id, %kind, "Rejected duplicate session");
            return Err(ControlError::AlreadyConnected(endpoint_id));
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            endpoint_id,
            kind,
            peer_addr,
            connected_at: Utc::now(),
            outbound: tx,
            cancel: cancel.clone(),
            epoch,
        };

        sessions.insert(
            endpoint_id,
            SessionEntry {
                handle,
                phase: SessionPhase::Active,
            },
        );

        tracing::info!(endpoint_id, %kind, "Admitted session");

        Ok(AdmittedSession {
            lease: SessionLease {
                registry: self.clone(),
                endpoint_id,
                epoch,
            },
            outbound: rx,
            cancel,
        })
    }

    /// Remove the session for `endpoint_id` and cancel its connection task
    ///
    /// Idempotent: evicting an unknown identity is a no-op.
    pub fn evict(&self, endpoint_id: EndpointId) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&endpoint_id)
        };

        match removed {
            Some(entry) => {
                entry.handle.cancel.cancel();
                tracing::info!(endpoint_id, "Evicted session");
                true
            }
            None => false,
        }
    }

    fn evict_if_epoch(&self, endpoint_id: EndpointId, epoch: u64) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(&endpoint_id) {
                Some(entry) if entry.handle.epoch == epoch => sessions.remove(&endpoint_id),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            entry.handle.cancel.cancel();
            tracing::info!(endpoint_id, "Evicted session (lease released)");
        }
    }

    /// Current send handle for `endpoint_id`, if a live session exists
    ///
    /// Never blocks beyond the registry mutex. Draining sessions are still
    /// returned: their send side remains open until eviction.
    pub fn lookup(&self, endpoint_id: EndpointId) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&endpoint_id).map(|entry| entry.handle.clone())
    }

    /// Snapshot the send handles of every connected session of `kind`
    pub fn connected_of_kind(&self, kind: ClientKind) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|entry| entry.handle.kind == kind)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Move the session into `Draining` after the peer half-closed
    ///
    /// Returns false when the epoch no longer matches (the session was
    /// evicted, or the slot was re-admitted).
    pub fn mark_draining(&self, endpoint_id: EndpointId, epoch: u64) -> bool {
        self.set_phase(endpoint_id, epoch, SessionPhase::Draining)
    }

    /// Return a draining session to `Active` after its stream resumed
    pub fn mark_active(&self, endpoint_id: EndpointId, epoch: u64) -> bool {
        self.set_phase(endpoint_id, epoch, SessionPhase::Active)
    }

    fn set_phase(&self, endpoint_id: EndpointId, epoch: u64, phase: SessionPhase) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&endpoint_id) {
            Some(entry) if entry.handle.epoch == epoch => {
                if entry.phase != phase {
                    tracing::debug!(endpoint_id, ?phase, "Session phase change");
                    entry.phase = phase;
                }
                true
            }
            _ => false,
        }
    }

    /// Phase of the current session for `endpoint_id`
    pub fn phase(&self, endpoint_id: EndpointId) -> Option<SessionPhase> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&endpoint_id).map(|entry| entry.phase)
    }

    /// List all live sessions
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .map(|entry| SessionInfo {
                endpoint_id: entry.handle.endpoint_id,
                kind: entry.handle.kind,
                peer_addr: entry.handle.peer_addr,
                connected_at: entry.handle.connected_at,
                phase: entry.phase,
            })
            .collect()
    }

    /// Number of live sessions
    pub fn count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

/// Ownership token for one admitted session
///
/// Dropped by the connection task when the stream ends; eviction only happens
/// if this lease still matches the registered epoch, so a stale lease cannot
/// tear down a session admitted after it.
pub struct SessionLease {
    registry: SessionRegistry,
    endpoint_id: EndpointId,
    epoch: u64,
}

impl SessionLease {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.evict_if_epoch(self.endpoint_id, self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionConfig::default())
    }

    #[tokio::test]
    async fn test_admit_and_lookup() {
        let registry = registry();

        let admitted = registry.admit(1, ClientKind::Collector, None).unwrap();
        assert_eq!(registry.count(), 1);

        let handle = registry.lookup(1).expect("session should be registered");
        assert_eq!(handle.endpoint_id, 1);
        assert_eq!(handle.kind, ClientKind::Collector);
        assert_eq!(registry.phase(1), Some(SessionPhase::Active));

        drop(admitted);
        assert!(registry.lookup(1).is_none());
    }

    #[tokio::test]
    async fn test_admit_duplicate_rejected() {
        let registry = registry();

        let _admitted = registry.admit(1, ClientKind::Agent, None).unwrap();
        let second = registry.admit(1, ClientKind::Agent, None);
        assert!(matches!(second, Err(ControlError::AlreadyConnected(1))));

        // Draining sessions still hold the slot
        let lease_epoch = registry.lookup(1).unwrap().epoch;
        assert!(registry.mark_draining(1, lease_epoch));
        let third = registry.admit(1, ClientKind::Agent, None);
        assert!(matches!(third, Err(ControlError::AlreadyConnected(1))));
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let registry = registry();

        let admitted = registry.admit(7, ClientKind::Agent, None).unwrap();
        assert!(registry.evict(7));
        assert!(!registry.evict(7));
        assert!(registry.lookup(7).is_none());

        // Eviction cancels the connection task
        assert!(admitted.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_push_delivers_to_outbound_queue() {
        let registry = registry();

        let mut admitted = registry.admit(3, ClientKind::Collector, None).unwrap();
        let handle = registry.lookup(3).unwrap();

        handle.push(ControlMessage::Heartbeat).unwrap();
        let received = admitted.outbound.recv().await.unwrap();
        assert_eq!(received, ControlMessage::Heartbeat);
    }

    #[tokio::test]
    async fn test_push_fails_after_task_is_gone() {
        let registry = registry();

        let admitted = registry.admit(3, ClientKind::Collector, None).unwrap();
        let handle = registry.lookup(3).unwrap();
        drop(admitted.outbound);

        let result = handle.push(ControlMessage::Heartbeat);
        assert_eq!(result, Err(SessionSendError::Closed));
    }

    #[tokio::test]
    async fn test_push_backpressure_when_queue_full() {
        let registry = SessionRegistry::new(SessionConfig {
            queue_capacity: 1,
            ..Default::default()
        });

        let _admitted = registry.admit(4, ClientKind::Agent, None).unwrap();
        let handle = registry.lookup(4).unwrap();

        handle.push(ControlMessage::Heartbeat).unwrap();
        let result = handle.push(ControlMessage::Heartbeat);
        assert_eq!(result, Err(SessionSendError::Backlogged));
    }

    #[tokio::test]
    async fn test_stale_lease_does_not_evict_readmitted_session() {
        let registry = registry();

        let first = registry.admit(5, ClientKind::Agent, None).unwrap();
        registry.evict(5);

        let second = registry.admit(5, ClientKind::Agent, None).unwrap();
        let second_epoch = second.lease.epoch();

        // Dropping the stale lease must not touch the new session
        drop(first.lease);
        let handle = registry.lookup(5).expect("second session must survive");
        assert_eq!(handle.epoch, second_epoch);
    }

    #[tokio::test]
    async fn test_draining_round_trip() {
        let registry = registry();

        let admitted = registry.admit(6, ClientKind::Collector, None).unwrap();
        let epoch = admitted.lease.epoch();

        assert!(registry.mark_draining(6, epoch));
        assert_eq!(registry.phase(6), Some(SessionPhase::Draining));

        assert!(registry.mark_active(6, epoch));
        assert_eq!(registry.phase(6), Some(SessionPhase::Active));

        // A stale epoch cannot flip the phase
        assert!(!registry.mark_draining(6, epoch + 1));
        assert_eq!(registry.phase(6), Some(SessionPhase::Active));
    }

    #[tokio::test]
    async fn test_connected_of_kind_filters() {
        let registry = registry();

        let _a = registry.admit(1, ClientKind::Agent, None).unwrap();
        let _b = registry.admit(2, ClientKind::Collector, None).unwrap();
        let _c = registry.admit(3, ClientKind::Collector, None).unwrap();

        let collectors = registry.connected_of_kind(ClientKind::Collector);
        assert_eq!(collectors.len(), 2);
        assert!(collectors.iter().all(|h| h.kind == ClientKind::Collector));

        assert_eq!(registry.connected_of_kind(ClientKind::Agent).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_admit_single_winner() {
        let registry = registry();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.admit(42, ClientKind::Collector, None).ok()
            }));
        }

        // Keep winning leases alive until the end of the test
        let mut winners = Vec::new();
        for task in tasks {
            if let Some(admitted) = task.await.unwrap() {
                winners.push(admitted);
            }
        }

        assert_eq!(winners.len(), 1, "exactly one concurrent admit may succeed");
        assert_eq!(registry.count(), 1);
    }
}
