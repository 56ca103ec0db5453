//! Wiring a [`Client`] from [`StreamlogConfig`].
//!
//! With `STREAMLOG_DATABASE_URL` set the log and the snapshot cache live in
//! Postgres; without it everything stays in memory. Writes always go through
//! [`NotifyingEventLog`], on Redis when `STREAMLOG_REDIS_URL` is set (and the
//! `redis` feature is on), in-process otherwise.
//!
//! Stream keys are wrapped under `STREAMLOG_KEK`. A Postgres setup refuses to
//! start without it; in memory a random KEK lives as long as the data does.

use std::sync::Arc;

use anyhow::{bail, Context};
use sqlx::PgPool;

use streamlog_events::{EventBus, InMemoryEventBus, StreamChanged, Subscription};

use crate::client::Client;
use crate::config::StreamlogConfig;
use crate::event_log::{EventLog, InMemoryEventLog, NotifyingEventLog, PostgresEventLog};
use crate::keys::InMemorySystemConnector;
use crate::reader_cache::ReaderCache;
use crate::snapshot_store::{InMemorySnapshotStore, PostgresSnapshotStore, SnapshotStore};

#[cfg(feature = "redis")]
use crate::event_bus::{redis_pubsub::DEFAULT_CHANNEL, RedisPubSubEventBus};

/// Where change notifications are published.
#[derive(Debug, Clone)]
pub enum Changes {
    InMemory(Arc<InMemoryEventBus<StreamChanged>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisPubSubEventBus>),
}

impl Changes {
    pub fn subscribe(&self) -> Subscription<StreamChanged> {
        match self {
            Changes::InMemory(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            Changes::Redis(bus) => bus.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct Streamlog {
    pub config: StreamlogConfig,
    pub client: Arc<Client>,
    pub changes: Changes,
}

impl Streamlog {
    pub async fn from_config(config: StreamlogConfig) -> anyhow::Result<Self> {
        if config.database_url.is_some() && config.kek.is_none() {
            bail!("STREAMLOG_KEK is required when STREAMLOG_DATABASE_URL is set");
        }
        let changes = changes(&config)?;

        let (log, snapshots): (Arc<dyn EventLog>, Arc<dyn SnapshotStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = PgPool::connect(url)
                        .await
                        .context("connecting to Postgres")?;

                    let log = PostgresEventLog::new(pool.clone(), config.read_page_size);
                    log.migrate().await.context("migrating log_entries")?;
                    let snapshots = PostgresSnapshotStore::new(pool);
                    snapshots.migrate().await.context("migrating snapshots")?;

                    tracing::info!(page_size = config.read_page_size, "using Postgres backends");
                    (notifying(log, &changes), Arc::new(snapshots))
                }
                None => {
                    tracing::info!(page_size = config.read_page_size, "using in-memory backends");
                    (
                        notifying(InMemoryEventLog::with_page_size(config.read_page_size), &changes),
                        Arc::new(InMemorySnapshotStore::new()),
                    )
                }
            };

        let keys = Arc::new(match &config.kek {
            Some(kek) => InMemorySystemConnector::with_kek(kek.clone(), log.clone()),
            None => InMemorySystemConnector::new(log.clone()),
        });
        let client = Arc::new(Client::new(log, snapshots, keys));

        Ok(Self {
            config,
            client,
            changes,
        })
    }

    /// A reader cache sized and timed by the configuration.
    pub fn reader_cache<P: streamlog_events::Projection>(&self) -> ReaderCache<P> {
        ReaderCache::new(self.config.reader_cache_size, self.config.stale_after)
    }
}

fn notifying<L: EventLog + 'static>(log: L, changes: &Changes) -> Arc<dyn EventLog> {
    match changes {
        Changes::InMemory(bus) => Arc::new(NotifyingEventLog::new(log, bus.clone())),
        #[cfg(feature = "redis")]
        Changes::Redis(bus) => Arc::new(NotifyingEventLog::new(log, bus.clone())),
    }
}

fn changes(config: &StreamlogConfig) -> anyhow::Result<Changes> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let bus = RedisPubSubEventBus::new(url, DEFAULT_CHANNEL).context("opening Redis")?;
            Ok(Changes::Redis(Arc::new(bus)))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!(
                "STREAMLOG_REDIS_URL is set but the redis feature is not enabled, using in-process notifications"
            );
            Ok(Changes::InMemory(Arc::new(InMemoryEventBus::new())))
        }
        None => Ok(Changes::InMemory(Arc::new(InMemoryEventBus::new()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlog_core::StreamName;

    #[tokio::test]
    async fn in_memory_setup_notifies_writes() {
        let streamlog = Streamlog::from_config(StreamlogConfig::default()).await.unwrap();
        let changes = streamlog.changes.subscribe();

        streamlog
            .client
            .create_stream(&StreamName::root(), None)
            .await
            .unwrap();

        let seen = changes.drain();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cursor.serialize(), "/@0");
    }

    #[tokio::test]
    async fn durable_setup_requires_a_kek() {
        let config = StreamlogConfig {
            database_url: Some("postgres://localhost/streamlog".to_string()),
            ..StreamlogConfig::default()
        };
        let err = Streamlog::from_config(config).await.unwrap_err();
        assert!(err.to_string().contains("STREAMLOG_KEK"));
    }

    #[tokio::test]
    async fn reader_cache_follows_config() {
        let config = StreamlogConfig {
            reader_cache_size: 3,
            ..StreamlogConfig::default()
        };
        let streamlog = Streamlog::from_config(config).await.unwrap();
        let cache = streamlog.reader_cache::<streamlog_chat::ChatProjection>();
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.stale_after(), streamlog.config.stale_after);
    }
}
