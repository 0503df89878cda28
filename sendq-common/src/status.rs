use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Lifecycle status of a queued email.
///
/// Variants are declared in lifecycle order so that `Ord` gives a stable
/// ordering for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
    Bounced,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Sending,
        Self::Sent,
        Self::Delivered,
        Self::Opened,
        Self::Clicked,
        Self::Failed,
        Self::Bounced,
        Self::Cancelled,
    ];

    pub const TERMINAL: [Self; 7] = [
        Self::Sent,
        Self::Delivered,
        Self::Opened,
        Self::Clicked,
        Self::Failed,
        Self::Bounced,
        Self::Cancelled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Cancelled => "cancelled",
        }
    }

    /// No automatic transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Sending)
    }

    /// Operator retry is allowed without `force` only from failure states.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::Bounced | Self::Cancelled)
    }

    /// Only work that has not been handed off can be cancelled.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl Display for QueueStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

/// Engagement status of a tracked message.
///
/// The ordering is the engagement ordering: a record only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    Sent,
    Delivered,
    Opened,
    Clicked,
}

impl TrackingStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
        }
    }

    /// The queue status mirroring this engagement state.
    #[must_use]
    pub const fn queue_status(self) -> QueueStatus {
        match self {
            Self::Sent => QueueStatus::Sent,
            Self::Delivered => QueueStatus::Delivered,
            Self::Opened => QueueStatus::Opened,
            Self::Clicked => QueueStatus::Clicked,
        }
    }

    /// Statuses strictly behind `self`, i.e. the ones `self` may replace.
    #[must_use]
    pub fn predecessors(self) -> Vec<Self> {
        [Self::Sent, Self::Delivered, Self::Opened, Self::Clicked]
            .into_iter()
            .filter(|status| *status < self)
            .collect()
    }
}

impl Display for TrackingStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "opened" => Ok(Self::Opened),
            "clicked" => Ok(Self::Clicked),
            _ => Err(UnknownStatus(value.to_string())),
        }
    }
}
