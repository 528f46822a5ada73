//! Initial schema: endpoint directory and liveness snapshots

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Endpoint::Table)
                    .if_not_exists()
                    .col(integer(Endpoint::Id).auto_increment().primary_key())
                    .col(string_len(Endpoint::Hostname, 255).not_null())
                    .col(string_len(Endpoint::Ip, 64).not_null())
                    .col(string_len(Endpoint::Kind, 64).not_null())
                    .col(string_len(Endpoint::Version, 64).not_null())
                    .col(uuid(Endpoint::Credential).not_null().unique_key())
                    .col(
                        timestamp_with_time_zone(Endpoint::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Endpoint::DeletedAt))
                    .col(string_len_null(Endpoint::DeletedBy, 255))
                    .to_owned(),
            )
            .await?;

        // Fingerprint lookups at registration filter on hostname + kind.
        // Not unique: soft-deleted rows may share a fingerprint with a
        // later, live registration.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_endpoints_hostname_kind")
                    .table(Endpoint::Table)
                    .col(Endpoint::Hostname)
                    .col(Endpoint::Kind)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Liveness::Table)
                    .if_not_exists()
                    .col(string_len(Liveness::Kind, 32).not_null())
                    .col(integer(Liveness::EndpointId).not_null())
                    .col(timestamp_with_time_zone(Liveness::LastSeen).not_null())
                    .primary_key(
                        Index::create()
                            .col(Liveness::Kind)
                            .col(Liveness::EndpointId),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Liveness::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Endpoint::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Endpoint {
    #[sea_orm(iden = "endpoints")]
    Table,
    Id,
    Hostname,
    Ip,
    Kind,
    Version,
    Credential,
    CreatedAt,
    DeletedAt,
    DeletedBy,
}

#[derive(DeriveIden)]
enum Liveness {
    #[sea_orm(iden = "liveness")]
    Table,
    Kind,
    EndpointId,
    LastSeen,
}
