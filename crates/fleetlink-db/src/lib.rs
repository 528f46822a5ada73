//! Durable storage for the fleetlink control plane
//!
//! Holds the endpoint directory and the periodically flushed liveness
//! snapshots. Configuration caches and session state are deliberately not
//! persisted; they are rebuilt from this store and from operator re-pushes
//! after a restart.

pub mod entities;
pub mod migrator;

pub use migrator::Migrator;
pub use sea_orm::DatabaseConnection;

use sea_orm::{Database, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Connect to the database at `url` (SQLite or Postgres)
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(url).await?;
    info!("Connected to database");
    Ok(db)
}

/// Apply any pending migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    Migrator::up(db, None).await
}
