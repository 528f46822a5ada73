//! Database entities

pub mod endpoint;
pub mod liveness;

pub use endpoint::Entity as Endpoint;
pub use liveness::Entity as Liveness;

pub mod prelude {
    pub use super::endpoint::Entity as Endpoint;
    pub use super::liveness::Entity as Liveness;
}
