//! On-disk database and lock file for integration tests
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{path::PathBuf, sync::Arc};

use sendq_delivery::{
    Database, Dispatcher, DispatcherConfig, NewEmail, ProcessLock, QueueItemId, QueueStore,
    RetryPolicy, Sender, StatsReporter, TrackingStore,
};
use tempfile::TempDir;

pub struct TestHarness {
    dir: TempDir,
    pub db: Database,
}

impl TestHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let db = Database::connect(&url)
            .await
            .expect("Failed to open test database");

        Self { dir, db }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.path().join("sendq.lock")
    }

    pub fn queue(&self) -> QueueStore {
        QueueStore::new(self.db.clone())
    }

    pub fn tracking(&self) -> TrackingStore {
        TrackingStore::new(self.db.clone())
    }

    pub fn stats(&self) -> StatsReporter {
        StatsReporter::new(self.db.clone())
    }

    /// Dispatcher settings with no pauses, bounded to `max_batches` claim cycles.
    pub fn config(max_batches: Option<u64>) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 10,
            idle_interval_secs: 1,
            inter_batch_delay_secs: 0,
            message_delay_ms: 0,
            send_timeout_secs: 5,
            stale_after_secs: 300,
            max_runtime_secs: None,
            max_batches,
            retry: RetryPolicy {
                max_retries: 5,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
        }
    }

    pub fn dispatcher(&self, sender: Arc<dyn Sender>, max_batches: Option<u64>) -> Dispatcher {
        self.dispatcher_with(Self::config(max_batches), sender)
    }

    pub fn dispatcher_with(&self, config: DispatcherConfig, sender: Arc<dyn Sender>) -> Dispatcher {
        Dispatcher::new(config, &self.db, sender, ProcessLock::new(self.lock_path()))
    }

    pub async fn enqueue(&self, recipient: &str, trackable: bool) -> QueueItemId {
        self.queue()
            .enqueue(&NewEmail {
                recipient: recipient.to_string(),
                subject: format!("Hello {recipient}"),
                body: "<p>Hello</p>".to_string(),
                trackable,
            })
            .await
            .expect("Failed to enqueue")
    }

    /// Shift an item's timestamps into the past.
    pub async fn age(&self, id: QueueItemId, days: i64) {
        let offset = days * 86_400_000;
        sqlx::query(
            "UPDATE email_queue SET created_at = created_at - ?, updated_at = updated_at - ? \
             WHERE id = ?",
        )
        .bind(offset)
        .bind(offset)
        .bind(id.get())
        .execute(self.db.pool())
        .await
        .expect("Failed to age item");
    }
}
