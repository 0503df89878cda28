//! Durable email queue and the dispatcher that drains it
//!
//! This crate provides:
//! - The queue store, with atomic batch claims and stale-claim recovery
//! - The retry policy deciding what happens after each attempt
//! - Open/click tracking for trackable messages
//! - The single-instance dispatcher loop and its process lock
//! - Run history and queue statistics

pub mod db;
mod error;
pub mod lock;
pub mod policy;
mod processor;
pub mod queue;
pub mod sender;
pub mod stats;
pub mod tracking;
mod types;

pub use db::Database;
// Re-export error types
pub use error::{
    DeliveryError, LockError, PermanentError, StoreError, SystemError, TemporaryError,
};
pub use lock::ProcessLock;
pub use policy::RetryPolicy;
// Re-export core types
pub use processor::{Dispatcher, DispatcherConfig, DispatcherState, RunOutcome};
pub use queue::QueueStore;
pub use sender::{LogSender, Sender, SenderConfig, SendmailSender};
pub use sendq_common::{QueueStatus, Signal, TrackingStatus};
pub use stats::{StatsReporter, StatusSummary, StopReason, WorkerRunStats};
pub use tracking::{TrackingRecord, TrackingStats, TrackingStore};
pub use types::{NewEmail, OutboundMessage, Outcome, QueueItem, QueueItemId, Receipt, Transition};
