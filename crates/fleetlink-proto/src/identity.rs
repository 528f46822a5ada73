//! Identity and credential types shared across the control plane

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Numeric key assigned to an endpoint by the directory at registration
pub type EndpointId = i32;

/// Cloud/processing integrations that run as plugin instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Aws,
    Azure,
    Gcp,
    O365,
    Sophos,
    Bitdefender,
    SocAi,
}

impl PluginKind {
    pub const ALL: [PluginKind; 7] = [
        PluginKind::Aws,
        PluginKind::Azure,
        PluginKind::Gcp,
        PluginKind::O365,
        PluginKind::Sophos,
        PluginKind::Bitdefender,
        PluginKind::SocAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Aws => "aws",
            PluginKind::Azure => "azure",
            PluginKind::Gcp => "gcp",
            PluginKind::O365 => "o365",
            PluginKind::Sophos => "sophos",
            PluginKind::Bitdefender => "bitdefender",
            PluginKind::SocAi => "soc-ai",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a remote endpoint
///
/// Broadcast configuration is keyed by kind: an update for
/// `ClientKind::Plugin(PluginKind::Aws)` reaches every connected AWS plugin
/// instance. Agents and collectors are individually addressed in addition to
/// their kind-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientKind {
    Agent,
    Collector,
    Plugin(PluginKind),
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Agent => f.write_str("agent"),
            ClientKind::Collector => f.write_str("collector"),
            ClientKind::Plugin(plugin) => write!(f, "plugin:{}", plugin),
        }
    }
}

/// Error returned when a kind string cannot be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown client kind: {0}")]
pub struct KindParseError(pub String);

impl FromStr for ClientKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(ClientKind::Agent),
            "collector" => Ok(ClientKind::Collector),
            other => {
                let plugin = other
                    .strip_prefix("plugin:")
                    .ok_or_else(|| KindParseError(other.to_string()))?;
                PluginKind::ALL
                    .iter()
                    .find(|p| p.as_str() == plugin)
                    .copied()
                    .map(ClientKind::Plugin)
                    .ok_or_else(|| KindParseError(other.to_string()))
            }
        }
    }
}

/// Per-endpoint secret issued at registration and presented on every
/// subsequent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub endpoint_id: EndpointId,
    pub key: Uuid,
}

/// Derived liveness of an endpoint
///
/// Never stored: computed from the last observed heartbeat timestamp against
/// the staleness threshold at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Online,
    Offline,
    Unknown,
}
