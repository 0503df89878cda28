//! Read-only queue aggregation and dispatcher run history

use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use sendq_common::QueueStatus;
use serde::{Deserialize, Serialize};

use crate::{
    db::{Database, from_millis, to_millis},
    error::StoreError,
};

/// Why a dispatcher run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A termination signal was received
    Signal,
    /// The configured maximum runtime elapsed
    MaxRuntime,
    /// The configured number of batches was processed
    MaxBatches,
    /// Bounded run found nothing left to do
    Drained,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::MaxRuntime => "max_runtime",
            Self::MaxBatches => "max_batches",
            Self::Drained => "drained",
        }
    }
}

impl Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StopReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(Self::Signal),
            "max_runtime" => Ok(Self::MaxRuntime),
            "max_batches" => Ok(Self::MaxBatches),
            "drained" => Ok(Self::Drained),
            other => Err(StoreError::InvalidData(format!("Unknown stop reason: {other}"))),
        }
    }
}

/// One dispatcher run, appended when it stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRunStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runtime_seconds: f64,
    pub emails_processed: u64,
    pub emails_failed: u64,
    pub batches: u64,
    pub stop_reason: StopReason,
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    started_at: i64,
    finished_at: i64,
    runtime_seconds: f64,
    emails_processed: i64,
    emails_failed: i64,
    batches: i64,
    stop_reason: String,
}

impl TryFrom<RunRow> for WorkerRunStats {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let count = |value: i64| {
            u64::try_from(value)
                .map_err(|_| StoreError::InvalidData(format!("negative run counter {value}")))
        };

        Ok(Self {
            started_at: from_millis(row.started_at)?,
            finished_at: from_millis(row.finished_at)?,
            runtime_seconds: row.runtime_seconds,
            emails_processed: count(row.emails_processed)?,
            emails_failed: count(row.emails_failed)?,
            batches: count(row.batches)?,
            stop_reason: row.stop_reason.parse()?,
        })
    }
}

/// Per-status summary of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub count: u64,
    /// Creation time of the oldest item
    pub oldest: DateTime<Utc>,
    /// Creation time of the newest item
    pub newest: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatsReporter {
    db: Database,
}

impl StatsReporter {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Item counts per status. Statuses with no items are absent.
    pub async fn queue_status_counts(
        &self,
    ) -> Result<BTreeMap<QueueStatus, StatusSummary>, StoreError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*), MIN(created_at), MAX(created_at) \
             FROM email_queue GROUP BY status",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|(status, count, oldest, newest)| -> Result<_, StoreError> {
                Ok((
                    status.parse::<QueueStatus>()?,
                    StatusSummary {
                        count: u64::try_from(count).unwrap_or_default(),
                        oldest: from_millis(oldest)?,
                        newest: from_millis(newest)?,
                    },
                ))
            })
            .collect()
    }

    /// Most recent runs first
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<WorkerRunStats>, StoreError> {
        sqlx::query_as::<_, RunRow>(
            "SELECT started_at, finished_at, runtime_seconds, emails_processed, emails_failed, \
                    batches, stop_reason \
             FROM worker_runs ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?
        .into_iter()
        .map(WorkerRunStats::try_from)
        .collect()
    }

    #[tracing::instrument(skip_all, fields(stop_reason = %run.stop_reason), err)]
    pub async fn record_run(&self, run: &WorkerRunStats) -> Result<(), StoreError> {
        let count = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO worker_runs \
                (started_at, finished_at, runtime_seconds, emails_processed, emails_failed, batches, stop_reason) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(to_millis(run.started_at))
        .bind(to_millis(run.finished_at))
        .bind(run.runtime_seconds)
        .bind(count(run.emails_processed))
        .bind(count(run.emails_failed))
        .bind(count(run.batches))
        .bind(run.stop_reason.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }
}
