//! Endpoint identity directory
//!
//! Registration, credential checks, and the operator-facing endpoint list,
//! all backed by the `endpoints` table. An endpoint is identified by its
//! fingerprint (hostname, kind); deregistration is a soft delete so the
//! audit trail survives.

use crate::error::ControlError;
use chrono::{DateTime, Utc};
use fleetlink_db::entities::endpoint;
use fleetlink_proto::{ClientKind, Credentials, EndpointId};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{info, warn};
use uuid::Uuid;

/// A live (not soft-deleted) directory row
#[derive(Debug, Clone)]
pub struct Registration {
    pub endpoint_id: EndpointId,
    pub hostname: String,
    pub ip: String,
    pub kind: ClientKind,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub kind: Option<ClientKind>,
    /// Substring match on hostname
    pub hostname: Option<String>,
}

/// One page of the endpoint list, plus the unpaged total
#[derive(Debug, Clone)]
pub struct EndpointPage {
    pub items: Vec<Registration>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

#[derive(Clone)]
pub struct IdentityDirectory {
    db: DatabaseConnection,
}

impl IdentityDirectory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Register an endpoint, or recognize one that is re-registering
    ///
    /// The fingerprint is (hostname, kind). A re-register from the same ip
    /// returns the existing identity so restarts and reinstalls keep their
    /// credentials. The same fingerprint from a different ip is rejected:
    /// either the hostname is duplicated in the fleet or someone is trying
    /// to take the identity over.
    pub async fn register(
        &self,
        hostname: &str,
        ip: &str,
        kind: &ClientKind,
        version: &str,
    ) -> Result<Credentials, ControlError> {
        let existing = endpoint::Entity::find()
            .filter(endpoint::Column::Hostname.eq(hostname))
            .filter(endpoint::Column::Kind.eq(kind.to_string()))
            .filter(endpoint::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?;

        if let Some(row) = existing {
            if row.ip != ip {
                warn!(
                    hostname,
                    kind = %kind,
                    known_ip = %row.ip,
                    request_ip = %ip,
                    "Registration conflict"
                );
                return Err(ControlError::Conflict(format!(
                    "{} ({}) is already registered from {}",
                    hostname, kind, row.ip
                )));
            }

            let endpoint_id = row.id;
            let credential = row.credential;
            if row.version != version {
                let mut active: endpoint::ActiveModel = row.into();
                active.version = Set(version.to_string());
                active.update(&self.db).await?;
            }
            info!(endpoint_id, hostname, kind = %kind, "Endpoint re-registered");
            return Ok(Credentials {
                endpoint_id,
                key: credential,
            });
        }

        let credential = Uuid::new_v4();
        let inserted = endpoint::ActiveModel {
            hostname: Set(hostname.to_string()),
            ip: Set(ip.to_string()),
            kind: Set(kind.to_string()),
            version: Set(version.to_string()),
            credential: Set(credential),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        info!(endpoint_id = inserted.id, hostname, kind = %kind, "Endpoint registered");
        Ok(Credentials {
            endpoint_id: inserted.id,
            key: credential,
        })
    }

    /// Check a credential and return the registration it belongs to
    ///
    /// Unknown id, wrong key, and deregistered endpoint all produce the same
    /// error so callers cannot probe which ids exist.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Registration, ControlError> {
        let row = endpoint::Entity::find_by_id(credentials.endpoint_id)
            .filter(endpoint::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?;

        match row {
            Some(row) if row.credential == credentials.key => to_registration(row),
            _ => Err(ControlError::NotFound(format!(
                "no endpoint matches id {}",
                credentials.endpoint_id
            ))),
        }
    }

    /// Soft-delete an endpoint, recording who asked for it
    ///
    /// Returns the deleted identity's credentials, or `None` when there was
    /// nothing to delete. Calling it again is harmless.
    pub async fn deregister(
        &self,
        endpoint_id: EndpointId,
        actor: &str,
    ) -> Result<Option<Credentials>, ControlError> {
        let row = endpoint::Entity::find_by_id(endpoint_id)
            .filter(endpoint::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let credentials = Credentials {
            endpoint_id: row.id,
            key: row.credential,
        };
        let mut active: endpoint::ActiveModel = row.into();
        active.deleted_at = Set(Some(Utc::now()));
        active.deleted_by = Set(Some(actor.to_string()));
        active.update(&self.db).await?;

        info!(endpoint_id, actor, "Endpoint deregistered");
        Ok(Some(credentials))
    }

    /// Fetch one registration by id
    pub async fn get(&self, endpoint_id: EndpointId) -> Result<Registration, ControlError> {
        let row = endpoint::Entity::find_by_id(endpoint_id)
            .filter(endpoint::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?;
        match row {
            Some(row) => to_registration(row),
            None => Err(ControlError::NotFound(format!(
                "no endpoint matches id {}",
                endpoint_id
            ))),
        }
    }

    /// List live endpoints, filtered and paged
    ///
    /// Pages are zero-based and ordered by id ascending so repeated calls see
    /// a stable ordering.
    pub async fn list(
        &self,
        filter: &EndpointFilter,
        page: u64,
        page_size: u64,
    ) -> Result<EndpointPage, ControlError> {
        let page_size = page_size.max(1);
        let mut query = endpoint::Entity::find()
            .filter(endpoint::Column::DeletedAt.is_null())
            .order_by_asc(endpoint::Column::Id);

        if let Some(kind) = &filter.kind {
            query = query.filter(endpoint::Column::Kind.eq(kind.to_string()));
        }
        if let Some(hostname) = &filter.hostname {
            query = query.filter(endpoint::Column::Hostname.contains(hostname));
        }

        let paginator = query.paginate(&self.db, page_size);
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page).await?;
        let items = rows
            .into_iter()
            .map(to_registration)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EndpointPage {
            items,
            total,
            page,
            page_size,
        })
    }
}

fn to_registration(row: endpoint::Model) -> Result<Registration, ControlError> {
    let kind = row
        .kind
        .parse::<ClientKind>()
        .map_err(|e| ControlError::Internal(format!("endpoint {} has {}", row.id, e)))?;
    Ok(Registration {
        endpoint_id: row.id,
        hostname: row.hostname,
        ip: row.ip,
        kind,
        version: row.version,
        created_at: row.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_proto::PluginKind;

    async fn test_directory() -> IdentityDirectory {
        let db = fleetlink_db::connect("sqlite::memory:").await.unwrap();
        fleetlink_db::migrate(&db).await.unwrap();
        IdentityDirectory::new(db)
    }

    #[tokio::test]
    async fn test_register_new_endpoint() {
        let directory = test_directory().await;

        let creds = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();

        let registration = directory.get(creds.endpoint_id).await.unwrap();
        assert_eq!(registration.hostname, "web-01");
        assert_eq!(registration.kind, ClientKind::Agent);
        assert_eq!(registration.version, "1.4.0");
    }

    #[tokio::test]
    async fn test_reregister_same_ip_returns_same_identity() {
        let directory = test_directory().await;

        let first = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();
        let second = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.5.0")
            .await
            .unwrap();

        assert_eq!(first.endpoint_id, second.endpoint_id);
        assert_eq!(first.key, second.key);

        // Version is refreshed on re-register
        let registration = directory.get(first.endpoint_id).await.unwrap();
        assert_eq!(registration.version, "1.5.0");
    }

    #[tokio::test]
    async fn test_reregister_different_ip_conflicts() {
        let directory = test_directory().await;

        directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();
        let err = directory
            .register("web-01", "10.9.9.9", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_same_hostname_different_kind_is_distinct() {
        let directory = test_directory().await;

        let agent = directory
            .register("soc-box", "10.0.0.7", &ClientKind::Agent, "1.0.0")
            .await
            .unwrap();
        let collector = directory
            .register("soc-box", "10.0.0.7", &ClientKind::Collector, "2.0.0")
            .await
            .unwrap();

        assert_ne!(agent.endpoint_id, collector.endpoint_id);
    }

    #[tokio::test]
    async fn test_authenticate_checks_credential() {
        let directory = test_directory().await;
        let creds = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();

        assert!(directory.authenticate(&creds).await.is_ok());

        let wrong_key = Credentials {
            endpoint_id: creds.endpoint_id,
            key: Uuid::new_v4(),
        };
        assert!(matches!(
            directory.authenticate(&wrong_key).await,
            Err(ControlError::NotFound(_))
        ));

        let unknown_id = Credentials {
            endpoint_id: 9999,
            key: creds.key,
        };
        assert!(matches!(
            directory.authenticate(&unknown_id).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent_and_blocks_auth() {
        let directory = test_directory().await;
        let creds = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();

        let first = directory
            .deregister(creds.endpoint_id, "operator:alice")
            .await
            .unwrap();
        assert_eq!(first.map(|c| c.endpoint_id), Some(creds.endpoint_id));

        let second = directory
            .deregister(creds.endpoint_id, "operator:alice")
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(matches!(
            directory.authenticate(&creds).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deregistered_fingerprint_registers_fresh() {
        let directory = test_directory().await;
        let old = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();
        directory
            .deregister(old.endpoint_id, "operator:alice")
            .await
            .unwrap();

        let fresh = directory
            .register("web-01", "10.0.0.5", &ClientKind::Agent, "1.4.0")
            .await
            .unwrap();

        assert_ne!(old.endpoint_id, fresh.endpoint_id);
        assert_ne!(old.key, fresh.key);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let directory = test_directory().await;
        for (host, kind) in [
            ("web-01", ClientKind::Agent),
            ("web-02", ClientKind::Agent),
            ("db-01", ClientKind::Agent),
            ("relay-01", ClientKind::Collector),
            ("cloud-01", ClientKind::Plugin(PluginKind::Aws)),
        ] {
            directory
                .register(host, "10.0.0.1", &kind, "1.0.0")
                .await
                .unwrap();
        }

        let agents = directory
            .list(
                &EndpointFilter {
                    kind: Some(ClientKind::Agent),
                    hostname: None,
                },
                0,
                2,
            )
            .await
            .unwrap();
        assert_eq!(agents.total, 3);
        assert_eq!(agents.items.len(), 2);
        assert!(agents.items[0].endpoint_id < agents.items[1].endpoint_id);

        let last_page = directory
            .list(
                &EndpointFilter {
                    kind: Some(ClientKind::Agent),
                    hostname: None,
                },
                1,
                2,
            )
            .await
            .unwrap();
        assert_eq!(last_page.items.len(), 1);

        let web = directory
            .list(
                &EndpointFilter {
                    kind: None,
                    hostname: Some("web".to_string()),
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(web.total, 2);
    }
}
