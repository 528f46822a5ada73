//! Endpoint entity: the durable identity directory

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "endpoints")]
pub struct Model {
    /// Directory id assigned at registration (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Hostname reported at registration; half of the fingerprint
    pub hostname: String,

    /// Network origin recorded at registration, used to detect
    /// re-registration from a different machine
    pub ip: String,

    /// Client kind string (e.g. "collector", "plugin:aws"); the other half
    /// of the fingerprint
    pub kind: String,

    /// Software version reported at registration
    pub version: String,

    /// Issued session credential
    #[sea_orm(unique)]
    pub credential: Uuid,

    /// When the endpoint registered
    pub created_at: ChronoDateTimeUtc,

    /// Soft-delete marker; deregistered endpoints keep their row for audit
    pub deleted_at: Option<ChronoDateTimeUtc>,

    /// Actor that performed the deregistration
    pub deleted_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
