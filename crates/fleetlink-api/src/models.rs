use chrono::{DateTime, Utc};
use fleetlink_proto::{EndpointId, LivenessStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Recipient selector for a configuration push
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum ConfigOwner {
    /// Every endpoint of one kind, connected or not
    Kind {
        /// Client kind, e.g. `agent`, `collector`, `plugin:aws`
        kind: String,
    },
    /// Exactly one endpoint
    Endpoint {
        /// Target endpoint id
        endpoint_id: EndpointId,
    },
}

/// Request to distribute a configuration payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PushConfigRequest {
    /// Who receives the payload
    pub owner: ConfigOwner,
    /// Opaque configuration document (JSON text)
    pub payload: String,
}

/// Outcome of a configuration push
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PushConfigResponse {
    /// Sessions the payload was pushed to immediately
    pub delivered: usize,
    /// Sessions evicted because their outbound queue was unusable
    pub evicted: usize,
    /// Whether the payload was queued for the routing worker (addressed mode)
    pub queued: bool,
}

/// A cached configuration section
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CachedConfig {
    /// Last payload stored for this owner
    pub payload: String,
}

/// One registered endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointSummary {
    /// Endpoint id
    pub id: EndpointId,
    /// Reported hostname
    pub hostname: String,
    /// Address the endpoint registered from
    pub ip: String,
    /// Client kind
    pub kind: String,
    /// Reported software version
    pub version: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// One page of the endpoint directory
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointList {
    pub endpoints: Vec<EndpointSummary>,
    /// Total endpoints matching the filter, across all pages
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// Query parameters for the endpoint list
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointQuery {
    /// Filter by client kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Filter by hostname (substring match)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Zero-based page index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u64>,
}

/// Query parameters for endpoint deletion
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteEndpointQuery {
    /// Who is deregistering the endpoint, recorded in the audit trail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Query parameters for the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LivenessQuery {
    /// Client kind; defaults to the endpoint's registered kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Liveness verdict for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LivenessResponse {
    pub status: LivenessStatus,
    /// Last heartbeat receipt time, if one was ever seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// One currently connected session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub endpoint_id: EndpointId,
    pub kind: String,
    /// Remote address, when the transport has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// `active` or `draining`
    pub phase: String,
}

/// All currently connected sessions
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

/// Service health
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Currently connected sessions
    pub active_sessions: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
