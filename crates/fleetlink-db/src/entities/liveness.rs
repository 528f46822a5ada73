//! Liveness entity: periodic snapshots of last observed heartbeats

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "liveness")]
pub struct Model {
    /// Kind family ("agent" or "collector"); agents and collectors may share
    /// numeric id ranges, so the key is composite
    #[sea_orm(primary_key, auto_increment = false)]
    pub kind: String,

    /// Endpoint id within the kind family
    #[sea_orm(primary_key, auto_increment = false)]
    pub endpoint_id: i32,

    /// Timestamp of the last heartbeat seen before the snapshot
    pub last_seen: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
