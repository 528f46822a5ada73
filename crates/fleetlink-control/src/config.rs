//! Configuration cache and broadcast distributor
//!
//! The cache is the single source of truth for "latest configuration":
//! kind-keyed sections for broadcast delivery and endpoint-keyed sections for
//! addressed delivery. Values are opaque payloads replaced wholesale on every
//! update; the control plane never merges or inspects them.

use crate::session::SessionRegistry;
use dashmap::DashMap;
use fleetlink_proto::{ClientKind, ControlMessage, EndpointId};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Last-write-wins store of configuration sections
#[derive(Debug, Clone, Default)]
pub struct ConfigCache {
    by_kind: Arc<DashMap<ClientKind, String>>,
    by_endpoint: Arc<DashMap<EndpointId, String>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the section for a client kind
    pub fn put_kind(&self, kind: ClientKind, payload: String) {
        self.by_kind.insert(kind, payload);
    }

    /// Latest section for a client kind
    pub fn get_kind(&self, kind: ClientKind) -> Option<String> {
        self.by_kind.get(&kind).map(|entry| entry.value().clone())
    }

    /// Replace the addressed section for one endpoint
    pub fn put_endpoint(&self, endpoint_id: EndpointId, payload: String) {
        self.by_endpoint.insert(endpoint_id, payload);
    }

    /// Latest addressed section for one endpoint; the poll-style fallback
    /// when push delivery missed a disconnected target
    pub fn get_endpoint(&self, endpoint_id: EndpointId) -> Option<String> {
        self.by_endpoint
            .get(&endpoint_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop the addressed section for one endpoint (deregistration cleanup)
    pub fn clear_endpoint(&self, endpoint_id: EndpointId) {
        self.by_endpoint.remove(&endpoint_id);
    }
}

/// Result of one broadcast update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    /// Sessions whose outbound queue accepted the payload
    pub delivered: usize,
    /// Sessions evicted because their queue was closed or backlogged
    pub evicted: usize,
}

/// Pushes configuration updates to connected sessions by kind
#[derive(Debug, Clone)]
pub struct ConfigDistributor {
    cache: ConfigCache,
    registry: SessionRegistry,
}

impl ConfigDistributor {
    pub fn new(cache: ConfigCache, registry: SessionRegistry) -> Self {
        Self { cache, registry }
    }

    /// Replace the cached section for `kind` and fan it out to every
    /// connected session of that kind
    ///
    /// The recipient list is snapshotted under the registry lock; the pushes
    /// happen outside it, so a slow session never stalls unrelated updates.
    /// A push failure evicts that one session and does not affect the rest;
    /// the cache write has already succeeded either way.
    pub fn update(&self, kind: ClientKind, payload: String) -> BroadcastOutcome {
        self.cache.put_kind(kind, payload.clone());

        let recipients = self.registry.connected_of_kind(kind);
        let mut outcome = BroadcastOutcome::default();

        for handle in recipients {
            let message = ControlMessage::ConfigPush {
                request_id: Uuid::new_v4(),
                payload: payload.clone(),
            };
            match handle.push(message) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!(
                        endpoint_id = handle.endpoint_id,
                        %kind,
                        "Config push failed ({}), evicting session",
                        e
                    );
                    self.registry.evict(handle.endpoint_id);
                    outcome.evicted += 1;
                }
            }
        }

        info!(
            %kind,
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            "Distributed configuration update"
        );
        outcome
    }

    /// Catch-up payloads for a just-admitted session, in send order: the
    /// kind-level section first, then any addressed section for the endpoint
    ///
    /// The caller must deliver these on the stream before any other traffic,
    /// so a reconnecting client never operates without its latest
    /// configuration.
    pub fn on_connect(&self, endpoint_id: EndpointId, kind: ClientKind) -> Vec<String> {
        let mut payloads = Vec::new();
        if let Some(section) = self.cache.get_kind(kind) {
            payloads.push(section);
        }
        if let Some(section) = self.cache.get_endpoint(endpoint_id) {
            payloads.push(section);
        }

        if !payloads.is_empty() {
            debug!(
                endpoint_id,
                %kind,
                sections = payloads.len(),
                "Serving cached configuration on connect"
            );
        }
        payloads
    }

    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }
}
