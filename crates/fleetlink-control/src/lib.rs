//! Fleetlink control plane
//!
//! Everything between an accepted control stream and the database lives
//! here: session admission and lifecycle, configuration caching and
//! distribution, addressed dispatch, heartbeat-driven liveness, and the
//! endpoint identity directory. The server binary wires these pieces to
//! TLS listeners and the operator API; this crate stays transport-agnostic
//! behind the [`fleetlink_transport::ControlStream`] trait.

pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod session;

pub use config::{BroadcastOutcome, ConfigCache, ConfigDistributor};
pub use directory::{EndpointFilter, EndpointPage, IdentityDirectory, Registration};
pub use dispatch::{AddressedDispatcher, DispatchWorker};
pub use error::ControlError;
pub use handler::ControlHandler;
pub use liveness::{KindFamily, LivenessConfig, LivenessTracker};
pub use session::{SessionConfig, SessionInfo, SessionPhase, SessionRegistry};
