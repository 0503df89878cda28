use std::sync::LazyLock;

use sendq_common::{QueueStatus, Signal, internal, tracing};
use sendq_delivery::{
    Database, Dispatcher, ProcessLock, QueueStore, RunOutcome, StatsReporter, TrackingStore,
};
use tokio::sync::broadcast;

use crate::config::Sendq;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for SIGINT or SIGTERM and ask the dispatcher to drain.
///
/// A second CTRL+C while draining exits immediately; the lock marker left
/// behind names a dead process and is reclaimed by the next run.
#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forced shutdown, abandoning the current batch");
    std::process::exit(130);
}

/// Owns the configuration and the database handle shared by every command
#[derive(Debug)]
pub struct Controller {
    config: Sendq,
    db: Database,
}

impl Controller {
    /// Connect to the configured database, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// If the database cannot be opened.
    pub async fn open(config: Sendq) -> anyhow::Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", config.database))?;

        Ok(Self { config, db })
    }

    #[must_use]
    pub const fn config(&self) -> &Sendq {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> QueueStore {
        QueueStore::new(self.db.clone())
    }

    #[must_use]
    pub fn tracking(&self) -> TrackingStore {
        TrackingStore::new(self.db.clone())
    }

    #[must_use]
    pub fn stats(&self) -> StatsReporter {
        StatsReporter::new(self.db.clone())
    }

    fn dispatcher(&self, max_batches: Option<u64>) -> Dispatcher {
        let mut config = self.config.dispatcher.clone();
        if max_batches.is_some() {
            config.max_batches = max_batches;
        }

        Dispatcher::new(
            config,
            &self.db,
            self.config.sender.build(),
            ProcessLock::new(self.config.lock_path.clone()),
        )
    }

    /// Run the dispatcher until SIGINT/SIGTERM, its runtime limit, or its
    /// batch budget stops it.
    ///
    /// # Errors
    ///
    /// If the signal handlers cannot be installed or the lock marker is unusable.
    pub async fn start(&self, max_batches: Option<u64>) -> anyhow::Result<RunOutcome> {
        // Subscribe before the signal task exists so no signal is missed
        let receiver = SHUTDOWN_BROADCAST.subscribe();

        let signals = tokio::spawn(async {
            if let Err(e) = shutdown().await {
                tracing::error!(error = %e, "Signal handling failed");
            }
        });

        let outcome = self.serve(max_batches, receiver).await;
        signals.abort();

        outcome
    }

    /// Run the dispatcher against an explicit shutdown channel.
    ///
    /// # Errors
    ///
    /// If the lock marker is unusable.
    pub async fn serve(
        &self,
        max_batches: Option<u64>,
        receiver: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<RunOutcome> {
        internal!(level = INFO, "Controller running");

        let mut dispatcher = self.dispatcher(max_batches);
        let outcome = dispatcher.serve(receiver).await?;

        internal!("Shutting down...");

        Ok(outcome)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Remove terminal items older than `days` (or the configured retention).
    ///
    /// # Errors
    ///
    /// If a non-terminal status is requested or the database fails.
    pub async fn cleanup(
        &self,
        days: Option<u32>,
        statuses: &[QueueStatus],
    ) -> anyhow::Result<u64> {
        let days = days.unwrap_or(self.config.cleanup.retention_days);
        Ok(self.queue().purge(days, statuses).await?)
    }
}
