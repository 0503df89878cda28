//! Retry policy for delivery outcomes.
//!
//! A pure decision function: given an item's retry count and the outcome of
//! an attempt, produce the item's next state. No I/O happens here; the queue
//! store persists whatever this returns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sendq_common::QueueStatus;
use serde::{Deserialize, Serialize};

use crate::{
    queue::retry::{after, backoff_delay},
    types::{Outcome, Transition},
};

pub const CANCELLED_REASON: &str = "cancelled by operator";

/// Retry policy configuration for delivery outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of transient failures after which an item is marked `failed`.
    ///
    /// Default: 5
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The n-th retry waits `base * 2^(n - 1)`.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Maximum retry delay (in seconds).
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an item that has failed `retry_count` times may be tried again.
    #[must_use]
    pub const fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the given (1-indexed) retry
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        backoff_delay(retry, self.base_delay_secs, self.max_delay_secs)
    }

    /// Decide the next state of an item currently at `retry_count`.
    #[must_use]
    pub fn decide(&self, retry_count: u32, outcome: &Outcome, now: DateTime<Utc>) -> Transition {
        match outcome {
            Outcome::Delivered { confirmed } => Transition {
                status: if *confirmed {
                    QueueStatus::Delivered
                } else {
                    QueueStatus::Sent
                },
                retry_count,
                next_retry_at: None,
                last_error: None,
            },
            Outcome::TransientFailure(reason) => {
                let failures = retry_count.saturating_add(1);

                if self.should_retry(failures) {
                    Transition {
                        status: QueueStatus::Pending,
                        retry_count: failures,
                        next_retry_at: Some(after(now, self.backoff(failures))),
                        last_error: Some(reason.clone()),
                    }
                } else {
                    Transition {
                        status: QueueStatus::Failed,
                        retry_count: failures,
                        next_retry_at: None,
                        last_error: Some(format!(
                            "retries exhausted after {failures} attempts: {reason}"
                        )),
                    }
                }
            }
            Outcome::PermanentFailure(reason) => Transition {
                status: QueueStatus::Bounced,
                retry_count,
                next_retry_at: None,
                last_error: Some(format!("permanent failure: {reason}")),
            },
            Outcome::Cancelled => Transition {
                status: QueueStatus::Cancelled,
                retry_count,
                next_retry_at: None,
                last_error: Some(CANCELLED_REASON.to_string()),
            },
        }
    }

    /// The operator-triggered reset back to a workable state.
    #[must_use]
    pub const fn manual_retry() -> Transition {
        Transition {
            status: QueueStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        5
    }

    pub const fn base_delay_secs() -> u64 {
        60
    }

    pub const fn max_delay_secs() -> u64 {
        3600
    }
}
