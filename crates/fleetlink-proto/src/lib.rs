//! Fleetlink Protocol Definitions
//!
//! This crate defines the control-plane protocol shared by the fleetlink
//! server and every fleet endpoint (agents, collectors, processing plugins):
//! identity and credential types, the control message set, and the framed
//! wire codec.

pub mod codec;
pub mod identity;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use identity::{ClientKind, Credentials, EndpointId, KindParseError, LivenessStatus, PluginKind};
pub use messages::ControlMessage;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
