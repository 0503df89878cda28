//! Type definitions shared by the queue store, retry policy and dispatcher

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sendq_common::QueueStatus;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Identifier of a queued email.
///
/// Assigned by the store, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(i64);

impl QueueItemId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A message a producer wants delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEmail {
    pub recipient: String,
    pub subject: String,
    /// Rendered payload
    pub body: String,
    /// Correlate delivery with open/click tracking
    #[serde(default)]
    pub trackable: bool,
}

/// Whether `address` is usable as a recipient.
///
/// Besides containing an `@` it must be a single token: no whitespace or
/// control characters, and no leading `-` that a transport could read as an
/// option.
#[must_use]
pub fn is_valid_recipient(address: &str) -> bool {
    !address.starts_with('-')
        && address.contains('@')
        && !address.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// One outbound email unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub recipient_email: String,
    pub subject: String,
    pub body: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    /// `None` means eligible immediately
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Present for trackable items
    pub tracking_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// For items in `sending` this is the claim time
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    #[must_use]
    pub const fn is_trackable(&self) -> bool {
        self.tracking_id.is_some()
    }

    /// The message handed to the sender adapter
    #[must_use]
    pub fn outbound(&self) -> OutboundMessage {
        OutboundMessage {
            id: self.id,
            recipient: self.recipient_email.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            tracking_id: self.tracking_id.clone(),
        }
    }
}

/// A resolved message as seen by a sender adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: QueueItemId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub tracking_id: Option<String>,
}

/// Successful hand-off reported by a sender adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// The transport accepted the message for delivery
    Accepted,
    /// The transport confirmed receipt-level delivery
    Delivered,
}

/// Result of one delivery attempt, as recorded on the queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Delivered { confirmed: bool },
    TransientFailure(String),
    PermanentFailure(String),
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::TransientFailure(_) | Self::PermanentFailure(_))
    }
}

impl From<Result<Receipt, DeliveryError>> for Outcome {
    fn from(result: Result<Receipt, DeliveryError>) -> Self {
        match result {
            Ok(Receipt::Accepted) => Self::Delivered { confirmed: false },
            Ok(Receipt::Delivered) => Self::Delivered { confirmed: true },
            Err(DeliveryError::Permanent(e)) => Self::PermanentFailure(e.to_string()),
            // System errors are not the recipient's fault, so they get retried
            Err(e @ (DeliveryError::Temporary(_) | DeliveryError::System(_))) => {
                Self::TransientFailure(e.to_string())
            }
        }
    }
}

/// The state a queue item moves to after an outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: QueueStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
