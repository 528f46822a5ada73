//! Heartbeat-driven liveness tracking
//!
//! Heartbeats arrive through a bounded channel and a single consumer task
//! folds them into in-memory `last_seen` maps, one per kind family. Status
//! reads never touch the database; a flusher task periodically snapshots the
//! maps and upserts them so a restarted server starts from the last known
//! state instead of reporting every endpoint as unknown.

use crate::error::ControlError;
use chrono::{DateTime, Utc};
use fleetlink_db::entities::liveness;
use fleetlink_proto::{ClientKind, EndpointId, LivenessStatus};
use futures::stream::{self, StreamExt};
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grouping used for liveness bookkeeping
///
/// Agents form one family; collectors and plugins share the other. The
/// persisted snapshot rows carry the family string, so an `EndpointId` is
/// tracked independently in each family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFamily {
    Agents,
    Collectors,
}

impl KindFamily {
    pub fn of(kind: &ClientKind) -> Self {
        match kind {
            ClientKind::Agent => KindFamily::Agents,
            ClientKind::Collector | ClientKind::Plugin(_) => KindFamily::Collectors,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KindFamily::Agents => "agent",
            KindFamily::Collectors => "collector",
        }
    }

    fn from_column(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(KindFamily::Agents),
            "collector" => Some(KindFamily::Collectors),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Heartbeats older than this make the endpoint `Offline`
    pub staleness: Duration,
    /// How often the in-memory maps are snapshotted to the database
    pub flush_interval: Duration,
    /// Capacity of the heartbeat intake channel
    pub channel_capacity: usize,
    /// Upper bound on concurrent upserts per flush
    pub flush_concurrency: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(60),
            flush_interval: Duration::from_secs(30),
            channel_capacity: 1000,
            flush_concurrency: 10,
        }
    }
}

#[derive(Debug)]
struct Beat {
    endpoint_id: EndpointId,
    family: KindFamily,
    at: DateTime<Utc>,
}

struct Inner {
    agents: RwLock<HashMap<EndpointId, DateTime<Utc>>>,
    collectors: RwLock<HashMap<EndpointId, DateTime<Utc>>>,
    staleness: Duration,
}

impl Inner {
    fn map(&self, family: KindFamily) -> &RwLock<HashMap<EndpointId, DateTime<Utc>>> {
        match family {
            KindFamily::Agents => &self.agents,
            KindFamily::Collectors => &self.collectors,
        }
    }

    fn apply(&self, beat: Beat) {
        self.map(beat.family)
            .write()
            .unwrap()
            .insert(beat.endpoint_id, beat.at);
    }

    fn snapshot(&self) -> Vec<(KindFamily, EndpointId, DateTime<Utc>)> {
        let mut records = Vec::new();
        for family in [KindFamily::Agents, KindFamily::Collectors] {
            let guard = self.map(family).read().unwrap();
            records.extend(guard.iter().map(|(&id, &at)| (family, id, at)));
        }
        records
    }
}

/// Shared handle for recording heartbeats and answering status queries
#[derive(Clone)]
pub struct LivenessTracker {
    inner: Arc<Inner>,
    tx: mpsc::Sender<Beat>,
}

impl LivenessTracker {
    /// Seed from the database and spawn the consumer and flusher tasks
    pub async fn start(
        db: DatabaseConnection,
        config: LivenessConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, ControlError> {
        let inner = Arc::new(Inner {
            agents: RwLock::new(HashMap::new()),
            collectors: RwLock::new(HashMap::new()),
            staleness: config.staleness,
        });

        let seeded = liveness::Entity::find().all(&db).await?;
        let mut skipped = 0usize;
        for row in &seeded {
            match KindFamily::from_column(&row.kind) {
                Some(family) => {
                    inner
                        .map(family)
                        .write()
                        .unwrap()
                        .insert(row.endpoint_id, row.last_seen);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "Ignored liveness rows with unrecognized kind");
        }
        info!(records = seeded.len(), "Seeded liveness state from database");

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        tokio::spawn(consume_loop(inner.clone(), rx, shutdown.clone()));
        tokio::spawn(flush_loop(
            inner.clone(),
            db,
            config.flush_interval,
            config.flush_concurrency,
            shutdown,
        ));

        Ok(Self { inner, tx })
    }

    /// Record a heartbeat without blocking
    ///
    /// The channel is bounded; a full channel drops the beat. The next
    /// heartbeat carries equivalent information, so dropped beats only delay
    /// freshness, never corrupt it.
    pub fn observe(&self, endpoint_id: EndpointId, kind: &ClientKind) {
        let beat = Beat {
            endpoint_id,
            family: KindFamily::of(kind),
            at: Utc::now(),
        };
        match self.tx.try_send(beat) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(endpoint_id, "Liveness channel full, dropping heartbeat");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(endpoint_id, "Liveness consumer stopped, dropping heartbeat");
            }
        }
    }

    /// Current status for one endpoint, purely from memory
    pub fn status(
        &self,
        endpoint_id: EndpointId,
        kind: &ClientKind,
    ) -> (LivenessStatus, Option<DateTime<Utc>>) {
        let family = KindFamily::of(kind);
        let guard = self.inner.map(family).read().unwrap();
        match guard.get(&endpoint_id) {
            Some(&last_seen) => {
                let fresh = match (Utc::now() - last_seen).to_std() {
                    Ok(age) => age <= self.inner.staleness,
                    // A last_seen in the future can only come from clock skew
                    Err(_) => true,
                };
                let status = if fresh {
                    LivenessStatus::Online
                } else {
                    LivenessStatus::Offline
                };
                (status, Some(last_seen))
            }
            None => (LivenessStatus::Unknown, None),
        }
    }
}

async fn consume_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Beat>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            beat = rx.recv() => match beat {
                Some(beat) => inner.apply(beat),
                None => break,
            }
        }
    }
    debug!("Liveness consumer stopped");
}

async fn flush_loop(
    inner: Arc<Inner>,
    db: DatabaseConnection,
    interval: Duration,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                flush_once(&inner, &db, concurrency).await;
                break;
            }
            _ = ticker.tick() => {
                flush_once(&inner, &db, concurrency).await;
            }
        }
    }
    debug!("Liveness flusher stopped");
}

/// Upsert every record in the snapshot, at most `concurrency` at a time
///
/// Failures are logged and skipped; the record stays in memory and the next
/// tick retries it.
async fn flush_once(inner: &Inner, db: &DatabaseConnection, concurrency: usize) {
    let records = inner.snapshot();
    if records.is_empty() {
        return;
    }

    stream::iter(records)
        .for_each_concurrent(concurrency, |(family, endpoint_id, at)| async move {
            let record = liveness::ActiveModel {
                kind: Set(family.as_str().to_string()),
                endpoint_id: Set(endpoint_id),
                last_seen: Set(at),
            };
            let outcome = liveness::Entity::insert(record)
                .on_conflict(
                    OnConflict::columns([liveness::Column::Kind, liveness::Column::EndpointId])
                        .update_column(liveness::Column::LastSeen)
                        .to_owned(),
                )
                .exec(db)
                .await;
            if let Err(e) = outcome {
                warn!(endpoint_id, error = %e, "Liveness flush failed for record");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use fleetlink_proto::PluginKind;
    use sea_orm::{ColumnTrait, QueryFilter};
    use tokio::time::timeout;

    async fn test_db() -> DatabaseConnection {
        let db = fleetlink_db::connect("sqlite::memory:").await.unwrap();
        fleetlink_db::migrate(&db).await.unwrap();
        db
    }

    async fn wait_online(tracker: &LivenessTracker, id: EndpointId, kind: &ClientKind) {
        timeout(Duration::from_secs(5), async {
            loop {
                if tracker.status(id, kind).0 == LivenessStatus::Online {
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint should become online");
    }

    #[tokio::test]
    async fn test_unknown_before_any_heartbeat() {
        let tracker = LivenessTracker::start(
            test_db().await,
            LivenessConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (status, last_seen) = tracker.status(1, &ClientKind::Agent);
        assert_eq!(status, LivenessStatus::Unknown);
        assert!(last_seen.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_makes_endpoint_online() {
        let tracker = LivenessTracker::start(
            test_db().await,
            LivenessConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tracker.observe(1, &ClientKind::Agent);
        wait_online(&tracker, 1, &ClientKind::Agent).await;

        let (_, last_seen) = tracker.status(1, &ClientKind::Agent);
        assert!(last_seen.is_some());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_reports_offline() {
        let config = LivenessConfig {
            staleness: Duration::from_millis(50),
            ..LivenessConfig::default()
        };
        let tracker =
            LivenessTracker::start(test_db().await, config, CancellationToken::new())
                .await
                .unwrap();

        tracker.observe(3, &ClientKind::Collector);
        wait_online(&tracker, 3, &ClientKind::Collector).await;

        time::sleep(Duration::from_millis(150)).await;
        let (status, last_seen) = tracker.status(3, &ClientKind::Collector);
        assert_eq!(status, LivenessStatus::Offline);
        assert!(last_seen.is_some());
    }

    #[tokio::test]
    async fn test_families_are_tracked_separately() {
        let tracker = LivenessTracker::start(
            test_db().await,
            LivenessConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // Same numeric id, agent family only
        tracker.observe(9, &ClientKind::Agent);
        wait_online(&tracker, 9, &ClientKind::Agent).await;

        let (status, _) = tracker.status(9, &ClientKind::Plugin(PluginKind::Aws));
        assert_eq!(status, LivenessStatus::Unknown);
    }

    #[tokio::test]
    async fn test_plugins_share_the_collector_family() {
        let tracker = LivenessTracker::start(
            test_db().await,
            LivenessConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tracker.observe(4, &ClientKind::Plugin(PluginKind::O365));
        wait_online(&tracker, 4, &ClientKind::Plugin(PluginKind::O365)).await;

        let (status, _) = tracker.status(4, &ClientKind::Collector);
        assert_eq!(status, LivenessStatus::Online);
    }

    #[tokio::test]
    async fn test_seed_restores_persisted_state() {
        let db = test_db().await;
        let stale = Utc::now() - TimeDelta::hours(2);
        liveness::Entity::insert(liveness::ActiveModel {
            kind: Set("agent".to_string()),
            endpoint_id: Set(11),
            last_seen: Set(stale),
        })
        .exec(&db)
        .await
        .unwrap();

        let tracker =
            LivenessTracker::start(db, LivenessConfig::default(), CancellationToken::new())
                .await
                .unwrap();

        // Known but stale, not unknown
        let (status, last_seen) = tracker.status(11, &ClientKind::Agent);
        assert_eq!(status, LivenessStatus::Offline);
        assert!(last_seen.is_some());
    }

    #[tokio::test]
    async fn test_flush_persists_records() {
        let db = test_db().await;
        let config = LivenessConfig {
            flush_interval: Duration::from_millis(50),
            ..LivenessConfig::default()
        };
        let tracker = LivenessTracker::start(db.clone(), config, CancellationToken::new())
            .await
            .unwrap();

        tracker.observe(21, &ClientKind::Agent);
        tracker.observe(22, &ClientKind::Collector);

        timeout(Duration::from_secs(5), async {
            loop {
                let rows = liveness::Entity::find().all(&db).await.unwrap();
                if rows.len() == 2 {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("flush should persist both records");

        let agent_rows = liveness::Entity::find()
            .filter(liveness::Column::Kind.eq("agent"))
            .all(&db)
            .await
            .unwrap();
        assert_eq!(agent_rows.len(), 1);
        assert_eq!(agent_rows[0].endpoint_id, 21);
    }

    #[tokio::test]
    async fn test_flush_updates_existing_row() {
        let db = test_db().await;
        let config = LivenessConfig {
            flush_interval: Duration::from_millis(50),
            ..LivenessConfig::default()
        };
        let tracker = LivenessTracker::start(db.clone(), config, CancellationToken::new())
            .await
            .unwrap();

        tracker.observe(31, &ClientKind::Agent);
        timeout(Duration::from_secs(5), async {
            loop {
                if liveness::Entity::find().all(&db).await.unwrap().len() == 1 {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let first = liveness::Entity::find().all(&db).await.unwrap()[0].last_seen;

        time::sleep(Duration::from_millis(20)).await;
        tracker.observe(31, &ClientKind::Agent);

        timeout(Duration::from_secs(5), async {
            loop {
                let rows = liveness::Entity::find().all(&db).await.unwrap();
                if rows.len() == 1 && rows[0].last_seen > first {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("upsert should refresh last_seen in place");
    }
}
