//! Fleet endpoint client: enrollment and the long-lived control session
//!
//! One shared implementation for every endpoint kind. Enrollment runs once
//! per install and trades the enrollment key for per-endpoint credentials;
//! after that [`FleetClient::run`] keeps a control session open, delivers
//! pushed configuration to the embedding process, answers with heartbeats,
//! and reconnects with backoff whenever the link drops.

use crate::credentials::CredentialStore;
use crate::reconnect::{ReconnectConfig, ReconnectManager};
use crate::ClientError;
use fleetlink_proto::{ClientKind, ControlMessage, Credentials, PROTOCOL_VERSION};
use fleetlink_transport::tls::{self, TlsClientConfig};
use fleetlink_transport::ControlStream;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default cadence for session heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection settings and the identity this endpoint presents
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control server address, "host:port"
    pub server_addr: String,
    pub tls: TlsClientConfig,
    pub kind: ClientKind,
    /// Hostname reported at enrollment; half of the server-side fingerprint
    pub hostname: String,
    /// Address reported at enrollment
    pub ip: String,
    /// Software version reported at enrollment
    pub version: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(
        server_addr: impl Into<String>,
        tls: TlsClientConfig,
        kind: ClientKind,
        hostname: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            tls,
            kind,
            hostname: hostname.into(),
            ip: ip.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// A configuration document pushed by the server, handed to the consumer
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub request_id: Uuid,
    pub payload: String,
}

/// Trade the enrollment key for this endpoint's credentials
///
/// One connection, one `Register`, one reply. The server recognizes a
/// repeat enrollment from the same host and returns the original identity,
/// so calling this on every start is safe.
pub async fn enroll(config: &ClientConfig, enrollment_key: &str) -> Result<Credentials, ClientError> {
    let mut stream = tls::connect(&config.server_addr, &config.tls).await?;

    stream
        .send(&ControlMessage::Register {
            protocol_version: PROTOCOL_VERSION,
            hostname: config.hostname.clone(),
            ip: config.ip.clone(),
            kind: config.kind,
            version: config.version.clone(),
            enrollment_key: enrollment_key.to_string(),
        })
        .await?;

    let reply = stream.recv().await?;
    let _ = stream.close().await;

    match reply {
        Some(ControlMessage::Registered { credentials }) => {
            info!(
                endpoint_id = credentials.endpoint_id,
                kind = %config.kind,
                "Enrolled with control server"
            );
            Ok(credentials)
        }
        Some(ControlMessage::Denied { reason }) => Err(ClientError::Denied(reason)),
        Some(other) => Err(ClientError::Protocol(format!(
            "unexpected reply to Register: {:?}",
            other
        ))),
        None => Err(ClientError::Protocol(
            "server closed the connection during enrollment".to_string(),
        )),
    }
}

/// Load saved credentials, enrolling and persisting them on first run
pub async fn ensure_enrolled(
    config: &ClientConfig,
    enrollment_key: &str,
    store: &CredentialStore,
) -> Result<Credentials, ClientError> {
    if let Some(existing) = store.load()? {
        debug!(
            endpoint_id = existing.endpoint_id,
            "Reusing stored credentials"
        );
        return Ok(existing);
    }

    let credentials = enroll(config, enrollment_key).await?;
    store.save(&credentials)?;
    Ok(credentials)
}

/// Retire this endpoint's identity on the server
///
/// Used by uninstall flows. The stored credential file is the caller's to
/// clear once this succeeds.
pub async fn deregister(
    config: &ClientConfig,
    credentials: &Credentials,
    actor: &str,
) -> Result<(), ClientError> {
    let mut stream = tls::connect(&config.server_addr, &config.tls).await?;

    stream
        .send(&ControlMessage::Deregister {
            credentials: *credentials,
            actor: actor.to_string(),
        })
        .await?;

    let reply = stream.recv().await?;
    let _ = stream.close().await;

    match reply {
        Some(ControlMessage::Deregistered { .. }) => {
            info!(
                endpoint_id = credentials.endpoint_id,
                "Deregistered from control server"
            );
            Ok(())
        }
        Some(ControlMessage::Denied { reason }) => Err(ClientError::Denied(reason)),
        Some(other) => Err(ClientError::Protocol(format!(
            "unexpected reply to Deregister: {:?}",
            other
        ))),
        None => Err(ClientError::Protocol(
            "server closed the connection during deregistration".to_string(),
        )),
    }
}

/// How a single session came to an end
enum SessionEnd {
    /// Shutdown token fired; the client said goodbye and is done
    Shutdown,
    /// Server closed the session or the stream; worth reconnecting
    ServerClosed,
}

/// Long-running control-session driver for an enrolled endpoint
pub struct FleetClient {
    config: ClientConfig,
    credentials: Credentials,
    shutdown: CancellationToken,
}

impl FleetClient {
    pub fn new(config: ClientConfig, credentials: Credentials, shutdown: CancellationToken) -> Self {
        Self {
            config,
            credentials,
            shutdown,
        }
    }

    /// Keep a control session alive until shutdown
    ///
    /// Pushed configuration is forwarded through `updates` and acknowledged
    /// on the wire once the consumer has taken it. Lost sessions are retried
    /// on the backoff schedule, reset each time a session reaches `HelloAck`.
    /// A `Denied` reply is fatal: whether the cause is a duplicate running
    /// instance, revoked credentials, or a version mismatch, retrying cannot
    /// fix it.
    pub async fn run(&self, updates: mpsc::Sender<ConfigUpdate>) -> Result<(), ClientError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_session(&updates, &mut reconnect).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::ServerClosed) => {
                    info!("Control session closed by server, will reconnect");
                }
                Err(ClientError::Denied(reason)) => {
                    error!(reason = %reason, "Server refused the session, giving up");
                    return Err(ClientError::Denied(reason));
                }
                Err(e) => {
                    warn!(error = %e, "Control session failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                waited = reconnect.wait() => {
                    if waited.is_err() {
                        return Err(ClientError::RetriesExhausted);
                    }
                }
            }
        }
    }

    async fn run_session(
        &self,
        updates: &mpsc::Sender<ConfigUpdate>,
        reconnect: &mut ReconnectManager,
    ) -> Result<SessionEnd, ClientError> {
        let mut stream = tls::connect(&self.config.server_addr, &self.config.tls).await?;

        stream
            .send(&ControlMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                credentials: self.credentials,
                kind: self.config.kind,
            })
            .await?;

        match stream.recv().await? {
            Some(ControlMessage::HelloAck { endpoint_id }) => {
                if endpoint_id != self.credentials.endpoint_id {
                    return Err(ClientError::Protocol(format!(
                        "acknowledged as endpoint {}, enrolled as {}",
                        endpoint_id, self.credentials.endpoint_id
                    )));
                }
            }
            Some(ControlMessage::Denied { reason }) => return Err(ClientError::Denied(reason)),
            Some(other) => {
                return Err(ClientError::Protocol(format!(
                    "unexpected reply to Hello: {:?}",
                    other
                )))
            }
            None => {
                return Err(ClientError::Protocol(
                    "server closed the connection during handshake".to_string(),
                ))
            }
        }

        reconnect.reset();
        info!(
            endpoint_id = self.credentials.endpoint_id,
            kind = %self.config.kind,
            "Control session established"
        );

        // First tick fires immediately, announcing liveness right after the
        // handshake.
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = stream
                        .send(&ControlMessage::Disconnect {
                            reason: "client shutdown".to_string(),
                        })
                        .await;
                    let _ = stream.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    stream.send(&ControlMessage::Heartbeat).await?;
                }
                inbound = stream.recv() => match inbound? {
                    Some(ControlMessage::ConfigPush { request_id, payload }) => {
                        debug!(%request_id, bytes = payload.len(), "Received configuration push");
                        let delivered = updates
                            .send(ConfigUpdate { request_id, payload })
                            .await
                            .is_ok();
                        if !delivered {
                            warn!(%request_id, "Update consumer is gone, rejecting push");
                        }
                        stream
                            .send(&ControlMessage::ConfigResult {
                                request_id,
                                accepted: delivered,
                                message: (!delivered)
                                    .then(|| "update consumer unavailable".to_string()),
                            })
                            .await?;
                    }
                    Some(ControlMessage::Disconnect { reason }) => {
                        info!(reason = %reason, "Server ended the session");
                        return Ok(SessionEnd::ServerClosed);
                    }
                    Some(other) => {
                        debug!(message = ?other, "Ignoring unexpected control message");
                    }
                    None => return Ok(SessionEnd::ServerClosed),
                }
            }
        }
    }
}
