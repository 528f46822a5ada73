//! Addressed configuration dispatch
//!
//! A bounded queue plus a single routing worker deliver identity-addressed
//! payloads (commands for exactly one endpoint) to that endpoint's current
//! session. Delivery is push-when-possible: an offline target's item is
//! dropped, but the cache entry is still written so the endpoint can pick up
//! the latest value on reconnect or by polling.

use crate::config::ConfigCache;
use crate::session::SessionRegistry;
use fleetlink_proto::{ControlMessage, EndpointId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// One addressed configuration item awaiting routing
///
/// Held only in memory: items queued but not yet routed are lost if the
/// process restarts.
#[derive(Debug, Clone)]
pub struct PendingConfigItem {
    pub target: EndpointId,
    pub request_id: Uuid,
    pub payload: String,
}

/// Producer side of the addressed dispatch queue
#[derive(Debug, Clone)]
pub struct AddressedDispatcher {
    tx: mpsc::Sender<PendingConfigItem>,
}

impl AddressedDispatcher {
    /// Create the dispatcher and its routing worker
    ///
    /// The caller spawns [`DispatchWorker::run`]; until it runs, enqueued
    /// items sit in the queue.
    pub fn new(
        registry: SessionRegistry,
        cache: ConfigCache,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, DispatchWorker) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self { tx },
            DispatchWorker {
                rx,
                registry,
                cache,
                shutdown,
            },
        )
    }

    /// Queue a payload for one endpoint without blocking
    ///
    /// Returns false when the queue is full (the item is shed, nothing is
    /// cached) or the worker is gone. Callers must handle the false return
    /// rather than assume delivery.
    pub fn enqueue(&self, target: EndpointId, payload: String) -> bool {
        let item = PendingConfigItem {
            target,
            request_id: Uuid::new_v4(),
            payload,
        };

        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    endpoint_id = target,
                    "Dispatch queue full, shedding addressed config"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(
                    endpoint_id = target,
                    "Dispatch worker is gone, dropping addressed config"
                );
                false
            }
        }
    }
}

/// Single consumer that routes queued items in FIFO order
pub struct DispatchWorker {
    rx: mpsc::Receiver<PendingConfigItem>,
    registry: SessionRegistry,
    cache: ConfigCache,
    shutdown: CancellationToken,
}

impl DispatchWorker {
    /// Drain the queue until shutdown
    ///
    /// Items for the same target are routed in enqueue order. The cache is
    /// written for every dequeued item, connected or not, before any send is
    /// attempted.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Dispatch worker shutting down");
                    break;
                }
                item = self.rx.recv() => {
                    match item {
                        Some(item) => self.route(item),
                        None => break,
                    }
                }
            }
        }
    }

    fn route(&self, item: PendingConfigItem) {
        self.cache.put_endpoint(item.target, item.payload.clone());

        let handle = match self.registry.lookup(item.target) {
            Some(handle) => handle,
            None => {
                debug!(
                    endpoint_id = item.target,
                    request_id = %item.request_id,
                    "Target offline, cached addressed config for poll"
                );
                return;
            }
        };

        let message = ControlMessage::ConfigPush {
            request_id: item.request_id,
            payload: item.payload,
        };
        match handle.push(message) {
            Ok(()) => {
                trace!(endpoint_id = item.target, request_id = %item.request_id, "Routed addressed config");
            }
            Err(e) => {
                warn!(
                    endpoint_id = item.target,
                    "Addressed push failed ({}), evicting session", e
                );
                self.registry.evict(item.target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigCache;
    use crate::session::SessionConfig;
    use fleetlink_proto::ClientKind;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup(capacity: usize) -> (AddressedDispatcher, DispatchWorker, SessionRegistry, ConfigCache) {
        let registry = SessionRegistry::new(SessionConfig::default());
        let cache = ConfigCache::new();
        let (dispatcher, worker) = AddressedDispatcher::new(
            registry.clone(),
            cache.clone(),
            capacity,
            CancellationToken::new(),
        );
        (dispatcher, worker, registry, cache)
    }

    #[tokio::test]
    async fn test_same_target_delivered_in_enqueue_order() {
        let (dispatcher, worker, registry, _cache) = setup(16);
        tokio::spawn(worker.run());

        let mut admitted = registry.admit(1, ClientKind::Collector, None).unwrap();

        assert!(dispatcher.enqueue(1, "p1".to_string()));
        assert!(dispatcher.enqueue(1, "p2".to_string()));

        let first = timeout(Duration::from_secs(5), admitted.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(5), admitted.outbound.recv())
            .await
            .unwrap()
            .unwrap();

        match (first, second) {
            (
                ControlMessage::ConfigPush { payload: p1, .. },
                ControlMessage::ConfigPush { payload: p2, .. },
            ) => {
                assert_eq!(p1, "p1");
                assert_eq!(p2, "p2");
            }
            other => panic!("expected two config pushes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_target_still_updates_cache() {
        let (dispatcher, worker, _registry, cache) = setup(16);
        tokio::spawn(worker.run());

        assert!(dispatcher.enqueue(42, "offline-config".to_string()));

        // Poll until the worker has routed the item
        timeout(Duration::from_secs(5), async {
            loop {
                if cache.get_endpoint(42).is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(cache.get_endpoint(42), Some("offline-config".to_string()));
    }

    #[tokio::test]
    async fn test_enqueue_returns_false_fast_when_saturated() {
        // Worker deliberately not running, so the queue stays full
        let (dispatcher, _worker, _registry, _cache) = setup(2);

        assert!(dispatcher.enqueue(1, "a".to_string()));
        assert!(dispatcher.enqueue(1, "b".to_string()));

        let verdict = timeout(Duration::from_millis(100), async {
            dispatcher.enqueue(1, "c".to_string())
        })
        .await
        .expect("enqueue must not block on a full queue");
        assert!(!verdict);
    }

    #[tokio::test]
    async fn test_send_failure_evicts_target_session() {
        let (dispatcher, worker, registry, cache) = setup(16);
        tokio::spawn(worker.run());

        let admitted = registry.admit(7, ClientKind::Agent, None).unwrap();
        drop(admitted.outbound);

        assert!(dispatcher.enqueue(7, "unreachable".to_string()));

        timeout(Duration::from_secs(5), async {
            loop {
                if registry.lookup(7).is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should be evicted after failed push");

        // Cache still reflects the intended value
        assert_eq!(cache.get_endpoint(7), Some("unreachable".to_string()));
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let cache = ConfigCache::new();
        let shutdown = CancellationToken::new();
        let (_dispatcher, worker) =
            AddressedDispatcher::new(registry, cache, 4, shutdown.clone());

        let task = tokio::spawn(worker.run());
        shutdown.cancel();

        timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should exit on shutdown")
            .unwrap();
    }
}
