//! Control stream handler
//!
//! One handler instance serves every accepted stream. The first message
//! routes the connection: `Register` and `Deregister` are single-shot
//! exchanges, `Hello` turns the stream into a long-lived session. The
//! session task owns its stream outright and multiplexes reads, queued
//! outbound pushes, and cancellation in one select loop.

use crate::config::ConfigDistributor;
use crate::directory::IdentityDirectory;
use crate::error::ControlError;
use crate::liveness::LivenessTracker;
use crate::session::{AdmittedSession, SessionRegistry};
use fleetlink_proto::{
    ClientKind, ControlMessage, Credentials, EndpointId, PROTOCOL_VERSION,
};
use fleetlink_transport::ControlStream;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(PartialEq)]
enum SessionFlow {
    Continue,
    Stop,
}

#[derive(Clone)]
pub struct ControlHandler {
    registry: SessionRegistry,
    directory: IdentityDirectory,
    distributor: ConfigDistributor,
    liveness: LivenessTracker,
    /// sha256 of the shared enrollment secret; the plaintext is never kept
    enrollment_key_hash: String,
}

impl ControlHandler {
    pub fn new(
        registry: SessionRegistry,
        directory: IdentityDirectory,
        distributor: ConfigDistributor,
        liveness: LivenessTracker,
        enrollment_secret: &str,
    ) -> Self {
        Self {
            registry,
            directory,
            distributor,
            liveness,
            enrollment_key_hash: sha256_hex(enrollment_secret),
        }
    }

    /// Drive one accepted stream to completion
    pub async fn handle_connection<S: ControlStream>(&self, mut stream: S) {
        let peer_addr = stream.peer_addr();
        let first = match stream.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(?peer_addr, "Stream closed before first message");
                return;
            }
            Err(e) => {
                warn!(?peer_addr, error = %e, "Failed to read first message");
                return;
            }
        };

        match first {
            ControlMessage::Register {
                protocol_version,
                hostname,
                ip,
                kind,
                version,
                enrollment_key,
            } => {
                let reply = self
                    .register_reply(protocol_version, &hostname, &ip, kind, &version, &enrollment_key)
                    .await;
                let _ = stream.send(&reply).await;
                let _ = stream.close().await;
            }
            ControlMessage::Hello {
                protocol_version,
                credentials,
                kind,
            } => {
                self.handle_session(&mut stream, protocol_version, credentials, kind)
                    .await;
                let _ = stream.close().await;
            }
            ControlMessage::Deregister { credentials, actor } => {
                let reply = self.deregister_reply(credentials, &actor).await;
                let _ = stream.send(&reply).await;
                let _ = stream.close().await;
            }
            other => {
                error!(?peer_addr, message = ?other, "Unexpected first message on control stream");
                let _ = stream
                    .send(&ControlMessage::Denied {
                        reason: "expected Register, Hello, or Deregister".to_string(),
                    })
                    .await;
                let _ = stream.close().await;
            }
        }
    }

    async fn register_reply(
        &self,
        protocol_version: u32,
        hostname: &str,
        ip: &str,
        kind: ClientKind,
        version: &str,
        enrollment_key: &str,
    ) -> ControlMessage {
        if protocol_version != PROTOCOL_VERSION {
            return ControlMessage::Denied {
                reason: format!("unsupported protocol version {}", protocol_version),
            };
        }
        if sha256_hex(enrollment_key) != self.enrollment_key_hash {
            warn!(hostname, %kind, "Registration with invalid enrollment key");
            return ControlMessage::Denied {
                reason: "invalid enrollment key".to_string(),
            };
        }

        match self.directory.register(hostname, ip, &kind, version).await {
            Ok(credentials) => ControlMessage::Registered { credentials },
            Err(ControlError::Conflict(reason)) => ControlMessage::Denied { reason },
            Err(e) => {
                error!(hostname, %kind, error = %e, "Registration failed");
                ControlMessage::Denied {
                    reason: "registration failed".to_string(),
                }
            }
        }
    }

    async fn deregister_reply(&self, credentials: Credentials, actor: &str) -> ControlMessage {
        if let Err(e) = self.directory.authenticate(&credentials).await {
            warn!(
                endpoint_id = credentials.endpoint_id,
                error = %e,
                "Deregistration denied"
            );
            return ControlMessage::Denied {
                reason: "invalid credentials".to_string(),
            };
        }

        match self.deregister(credentials.endpoint_id, actor).await {
            Ok(_) => ControlMessage::Deregistered { credentials },
            Err(e) => {
                error!(
                    endpoint_id = credentials.endpoint_id,
                    error = %e,
                    "Deregistration failed"
                );
                ControlMessage::Denied {
                    reason: "deregistration failed".to_string(),
                }
            }
        }
    }

    /// Remove an identity and tear down whatever live state it still holds
    ///
    /// Shared by the wire path and the operator API. Safe when the endpoint
    /// was never registered or is already gone; returns whether a directory
    /// row was actually removed.
    pub async fn deregister(
        &self,
        endpoint_id: EndpointId,
        actor: &str,
    ) -> Result<bool, ControlError> {
        let removed = self.directory.deregister(endpoint_id, actor).await?;
        self.distributor.cache().clear_endpoint(endpoint_id);
        self.registry.evict(endpoint_id);
        Ok(removed.is_some())
    }

    async fn handle_session<S: ControlStream>(
        &self,
        stream: &mut S,
        protocol_version: u32,
        credentials: Credentials,
        kind: ClientKind,
    ) {
        let endpoint_id = credentials.endpoint_id;

        if protocol_version != PROTOCOL_VERSION {
            let _ = stream
                .send(&ControlMessage::Denied {
                    reason: format!("unsupported protocol version {}", protocol_version),
                })
                .await;
            return;
        }

        let registration = match self.directory.authenticate(&credentials).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(endpoint_id, error = %e, "Session authentication failed");
                let _ = stream
                    .send(&ControlMessage::Denied {
                        reason: "invalid credentials".to_string(),
                    })
                    .await;
                return;
            }
        };
        if registration.kind != kind {
            warn!(
                endpoint_id,
                presented = %kind,
                registered = %registration.kind,
                "Session kind mismatch"
            );
            let _ = stream
                .send(&ControlMessage::Denied {
                    reason: format!("registered as {}, not {}", registration.kind, kind),
                })
                .await;
            return;
        }

        let admitted = match self.registry.admit(endpoint_id, kind, stream.peer_addr()) {
            Ok(admitted) => admitted,
            Err(e) => {
                let _ = stream
                    .send(&ControlMessage::Denied {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        self.run_session(stream, admitted, endpoint_id, kind).await;
        // Dropping the lease on return evicts the session unless a newer
        // epoch has already taken the slot
    }

    async fn run_session<S: ControlStream>(
        &self,
        stream: &mut S,
        mut admitted: AdmittedSession,
        endpoint_id: EndpointId,
        kind: ClientKind,
    ) {
        let epoch = admitted.lease.epoch();
        let cancel = admitted.cancel.clone();
        let grace = self.registry.drain_grace();
        let resume_poll = (grace / 4).min(Duration::from_millis(100));

        if let Err(e) = stream.send(&ControlMessage::HelloAck { endpoint_id }).await {
            warn!(endpoint_id, error = %e, "Failed to ack session");
            return;
        }

        // Catch-up: cached kind section, then the addressed section, before
        // any queued or broadcast traffic reaches this session
        for payload in self.distributor.on_connect(endpoint_id, kind) {
            let push = ControlMessage::ConfigPush {
                request_id: Uuid::new_v4(),
                payload,
            };
            if let Err(e) = stream.send(&push).await {
                warn!(endpoint_id, error = %e, "Catch-up push failed");
                return;
            }
        }
        info!(endpoint_id, %kind, "Session established");

        'session: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(endpoint_id, "Session evicted, notifying peer");
                    let _ = stream
                        .send(&ControlMessage::Disconnect {
                            reason: "session closed by server".to_string(),
                        })
                        .await;
                    break 'session;
                }
                outgoing = admitted.outbound.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(e) = stream.send(&message).await {
                                warn!(endpoint_id, error = %e, "Send failed, closing session");
                                break 'session;
                            }
                        }
                        None => break 'session,
                    }
                }
                inbound = stream.recv() => {
                    match inbound {
                        Ok(Some(message)) => {
                            if self.on_session_message(endpoint_id, kind, message) == SessionFlow::Stop {
                                break 'session;
                            }
                        }
                        Ok(None) => {
                            // Peer EOF. Hold the slot for the grace window;
                            // outbound pushes keep flowing while we wait.
                            if !self.registry.mark_draining(endpoint_id, epoch) {
                                break 'session;
                            }
                            info!(
                                endpoint_id,
                                grace_ms = grace.as_millis() as u64,
                                "Peer EOF, session draining"
                            );
                            let deadline = time::sleep(grace);
                            tokio::pin!(deadline);
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        debug!(endpoint_id, "Session evicted while draining");
                                        break 'session;
                                    }
                                    _ = &mut deadline => {
                                        info!(endpoint_id, "Drain grace expired, evicting session");
                                        break 'session;
                                    }
                                    outgoing = admitted.outbound.recv() => {
                                        match outgoing {
                                            Some(message) => {
                                                if let Err(e) = stream.send(&message).await {
                                                    warn!(endpoint_id, error = %e, "Send failed while draining");
                                                    break 'session;
                                                }
                                            }
                                            None => break 'session,
                                        }
                                    }
                                    inbound = async {
                                        time::sleep(resume_poll).await;
                                        stream.recv().await
                                    } => {
                                        match inbound {
                                            Ok(Some(message)) => {
                                                if !self.registry.mark_active(endpoint_id, epoch) {
                                                    break 'session;
                                                }
                                                info!(endpoint_id, "Peer resumed within grace window");
                                                if self.on_session_message(endpoint_id, kind, message) == SessionFlow::Stop {
                                                    break 'session;
                                                }
                                                continue 'session;
                                            }
                                            Ok(None) => {}
                                            Err(e) => {
                                                warn!(endpoint_id, error = %e, "Stream error while draining");
                                                break 'session;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(endpoint_id, error = %e, "Stream error, closing session");
                            break 'session;
                        }
                    }
                }
            }
        }
    }

    fn on_session_message(
        &self,
        endpoint_id: EndpointId,
        kind: ClientKind,
        message: ControlMessage,
    ) -> SessionFlow {
        match message {
            ControlMessage::Heartbeat => {
                self.liveness.observe(endpoint_id, &kind);
                SessionFlow::Continue
            }
            ControlMessage::ConfigResult {
                request_id,
                accepted,
                message,
            } => {
                if accepted {
                    debug!(endpoint_id, %request_id, "Endpoint applied config");
                } else {
                    warn!(
                        endpoint_id,
                        %request_id,
                        detail = message.as_deref().unwrap_or(""),
                        "Endpoint rejected config"
                    );
                }
                SessionFlow::Continue
            }
            ControlMessage::Disconnect { reason } => {
                info!(endpoint_id, reason, "Peer disconnected");
                SessionFlow::Stop
            }
            other => {
                warn!(endpoint_id, message = ?other, "Unexpected message in session");
                SessionFlow::Continue
            }
        }
    }
}
