//! Control-plane message types

use crate::identity::{ClientKind, Credentials, EndpointId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Main control protocol message enum
///
/// The first message on a new connection selects the flow: `Register` and
/// `Deregister` are single-shot request/reply exchanges, while `Hello` opens
/// a long-lived session that carries `ConfigPush`/`ConfigResult` and
/// `Heartbeat` traffic until either side disconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Endpoint requests enrollment with the shared enrollment secret
    Register {
        protocol_version: u32,
        hostname: String,
        ip: String,
        kind: ClientKind,
        version: String,
        enrollment_key: String,
    },
    /// Directory accepted the registration (or recognized a restart)
    Registered { credentials: Credentials },
    /// Registration or session admission refused
    Denied { reason: String },

    /// Endpoint opens its config/command session
    Hello {
        protocol_version: u32,
        credentials: Credentials,
        kind: ClientKind,
    },
    /// Session admitted; cached configuration follows immediately
    HelloAck { endpoint_id: EndpointId },

    /// Server pushes a configuration payload (broadcast or addressed)
    ConfigPush { request_id: Uuid, payload: String },
    /// Endpoint acknowledges a `ConfigPush`
    ConfigResult {
        request_id: Uuid,
        accepted: bool,
        message: Option<String>,
    },

    /// Periodic proof of life; the server stamps receipt time
    Heartbeat,

    /// Endpoint (or an operator tool) removes a registration
    Deregister {
        credentials: Credentials,
        actor: String,
    },
    /// Deregistration confirmation, echoing the removed identity
    Deregistered { credentials: Credentials },

    /// Orderly close with a reason, sent by either side
    Disconnect { reason: String },
}
