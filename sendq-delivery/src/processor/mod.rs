//! Dispatcher orchestration

pub mod process;

use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::{SubsecRound, Utc};
use sendq_common::{Signal, internal};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::{RecvError, TryRecvError},
        },
        watch,
    },
    time::Instant,
};
use tracing::{error, info};

use crate::{
    db::Database,
    error::LockError,
    lock::ProcessLock,
    policy::RetryPolicy,
    queue::QueueStore,
    sender::Sender,
    stats::{StatsReporter, StopReason, WorkerRunStats},
    tracking::TrackingStore,
};

const fn default_batch_size() -> u32 {
    50
}

const fn default_idle_interval() -> u64 {
    30
}

const fn default_inter_batch_delay() -> u64 {
    5
}

const fn default_message_delay() -> u64 {
    250
}

const fn default_send_timeout() -> u64 {
    30
}

const fn default_stale_after() -> u64 {
    300 // 5 minutes
}

/// Dispatcher tuning, read from the `dispatcher` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of items claimed per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How long to sleep when there is nothing due (in seconds)
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// Pause between two non-empty batches (in seconds)
    #[serde(default = "default_inter_batch_delay")]
    pub inter_batch_delay_secs: u64,

    /// Pause between two messages of a batch (in milliseconds)
    ///
    /// Keeps the dispatcher below provider rate limits.
    #[serde(default = "default_message_delay")]
    pub message_delay_ms: u64,

    /// Upper bound on a single send attempt (in seconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Items in `sending` for longer than this are reclaimed (in seconds)
    ///
    /// Must comfortably exceed `send_timeout_secs`.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Stop after running this long (in seconds)
    ///
    /// Default: None (run until signalled)
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,

    /// Stop after this many claim cycles, or earlier once nothing is due
    ///
    /// Default: None (run until signalled)
    #[serde(default)]
    pub max_batches: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval_secs: default_idle_interval(),
            inter_batch_delay_secs: default_inter_batch_delay(),
            message_delay_ms: default_message_delay(),
            send_timeout_secs: default_send_timeout(),
            stale_after_secs: default_stale_after(),
            max_runtime_secs: None,
            max_batches: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle of a dispatcher run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// How a call to [`Dispatcher::serve`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another live dispatcher holds the lock; nothing was done
    LockHeld,
    /// The run went through its full lifecycle
    Completed(WorkerRunStats),
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RunCounters {
    pub(crate) processed: u64,
    pub(crate) failed: u64,
    pub(crate) batches: u64,
}

/// The singleton queue worker.
///
/// Claims due batches, hands each item to the [`Sender`], and records the
/// outcome through the [`RetryPolicy`].
#[derive(Debug)]
pub struct Dispatcher {
    pub(crate) config: DispatcherConfig,
    pub(crate) queue: QueueStore,
    pub(crate) tracking: TrackingStore,
    pub(crate) stats: StatsReporter,
    pub(crate) sender: Arc<dyn Sender>,
    lock: ProcessLock,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        db: &Database,
        sender: Arc<dyn Sender>,
        lock: ProcessLock,
    ) -> Self {
        Self {
            config,
            queue: QueueStore::new(db.clone()),
            tracking: TrackingStore::new(db.clone()),
            stats: StatsReporter::new(db.clone()),
            sender,
            lock,
            state: watch::Sender::new(DispatcherState::Starting),
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Follow lifecycle changes while [`Dispatcher::serve`] is running.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn transition(&self, state: DispatcherState) {
        let previous = self.state.send_replace(state);
        internal!("Dispatcher {previous} -> {state}");
    }

    /// Run the dispatcher until it is signalled, runs out of time, or
    /// finishes its batch budget.
    ///
    /// ## Graceful Shutdown
    ///
    /// A shutdown signal never interrupts a batch: every claimed item is
    /// sent and recorded before the run stops, so nothing is left in
    /// `sending`. The dispatcher is `Draining` from the moment the signal is
    /// seen, including while it finishes the items left in its batch. Sleeps
    /// are cut short by the signal.
    ///
    /// # Errors
    ///
    /// Only if the lock marker itself cannot be used. Store failures are
    /// logged and retried, never returned.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<RunOutcome, LockError> {
        self.state.send_replace(DispatcherState::Starting);

        if !self.lock.acquire()? {
            info!(
                path = %self.lock.path().display(),
                "Dispatcher already running, nothing to do"
            );
            self.state.send_replace(DispatcherState::Stopped);
            return Ok(RunOutcome::LockHeld);
        }

        self.transition(DispatcherState::Running);

        // Stored with millisecond precision
        let started_at = Utc::now().trunc_subsecs(3);
        let deadline = self
            .config
            .max_runtime_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let mut counters = RunCounters::default();
        let stop_reason = self.run_loop(&mut shutdown, deadline, &mut counters).await;

        if self.state() == DispatcherState::Running {
            self.transition(DispatcherState::Draining);
        }

        let finished_at = Utc::now().trunc_subsecs(3);
        let run = WorkerRunStats {
            started_at,
            finished_at,
            runtime_seconds: (finished_at - started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            emails_processed: counters.processed,
            emails_failed: counters.failed,
            batches: counters.batches,
            stop_reason,
        };

        if let Err(e) = self.stats.record_run(&run).await {
            error!(error = %e, "Failed to record dispatcher run");
        }

        self.lock.release();
        self.transition(DispatcherState::Stopped);

        info!(
            processed = run.emails_processed,
            failed = run.emails_failed,
            batches = run.batches,
            runtime_seconds = run.runtime_seconds,
            stop_reason = %run.stop_reason,
            "Dispatcher stopped"
        );

        Ok(RunOutcome::Completed(run))
    }

    async fn run_loop(
        &self,
        shutdown: &mut broadcast::Receiver<Signal>,
        deadline: Option<Instant>,
        counters: &mut RunCounters,
    ) -> StopReason {
        let idle = Duration::from_secs(self.config.idle_interval_secs);
        let between_batches = Duration::from_secs(self.config.inter_batch_delay_secs);
        let stale_after = Duration::from_secs(self.config.stale_after_secs);

        loop {
            if signalled(shutdown) {
                internal!(level = INFO, "Dispatcher received shutdown signal");
                return StopReason::Signal;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return StopReason::MaxRuntime;
            }

            if self.batch_budget_spent(counters) {
                return StopReason::MaxBatches;
            }

            if let Err(e) = self.queue.reclaim_stale(stale_after, &self.config.retry).await {
                error!(error = %e, "Failed to reclaim stale claims");
            }

            let items = match self.queue.claim_due_batch(self.config.batch_size).await {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, "Failed to claim a batch, backing off");
                    if let Some(reason) = pause(idle, shutdown, deadline).await {
                        return reason;
                    }
                    continue;
                }
            };

            counters.batches += 1;

            if items.is_empty() {
                if self.config.max_batches.is_some() {
                    internal!(level = INFO, "Nothing due, bounded run is done");
                    return StopReason::Drained;
                }

                if let Some(reason) = pause(idle, shutdown, deadline).await {
                    return reason;
                }
                continue;
            }

            let attempted =
                process::process_batch(self, &items, counters, Some(&mut *shutdown)).await;

            if attempted < items.len() {
                internal!(level = INFO, "Dispatcher received shutdown signal, finishing batch");
                self.transition(DispatcherState::Draining);
                process::process_batch(self, &items[attempted..], counters, None).await;
                return StopReason::Signal;
            }

            if self.batch_budget_spent(counters) {
                continue;
            }

            if let Some(reason) = pause(between_batches, shutdown, deadline).await {
                return reason;
            }
        }
    }

    fn batch_budget_spent(&self, counters: &RunCounters) -> bool {
        self.config
            .max_batches
            .is_some_and(|max| counters.batches >= max)
    }
}

/// Non-blocking check for a pending shutdown signal
fn signalled(shutdown: &mut broadcast::Receiver<Signal>) -> bool {
    match shutdown.try_recv() {
        Ok(Signal::Shutdown | Signal::Finalised) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty | TryRecvError::Closed) => false,
    }
}

async fn wait_for_signal(shutdown: &mut broadcast::Receiver<Signal>) {
    match shutdown.recv().await {
        Ok(Signal::Shutdown | Signal::Finalised) | Err(RecvError::Lagged(_)) => {}
        // Nobody can signal any more
        Err(RecvError::Closed) => std::future::pending().await,
    }
}

/// Sleep for `duration`, cut short by a signal or the runtime deadline.
async fn pause(
    duration: Duration,
    shutdown: &mut broadcast::Receiver<Signal>,
    deadline: Option<Instant>,
) -> Option<StopReason> {
    let wake = Instant::now() + duration;
    let (wake, hits_deadline) = match deadline {
        Some(deadline) if deadline <= wake => (deadline, true),
        _ => (wake, false),
    };

    tokio::select! {
        () = tokio::time::sleep_until(wake) => hits_deadline.then_some(StopReason::MaxRuntime),
        () = wait_for_signal(shutdown) => {
            internal!(level = INFO, "Dispatcher received shutdown signal");
            Some(StopReason::Signal)
        }
    }
}
