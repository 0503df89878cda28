//! Text and JSON rendering for the read-only commands

use std::{collections::BTreeMap, fmt::Write};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use sendq_delivery::{
    QueueItem, QueueStatus, StatusSummary, TrackingRecord, TrackingStats, WorkerRunStats,
};
use serde::Serialize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    #[default]
    Text,
    Json,
}

/// Something a command can print
pub trait Report: Serialize {
    fn text(&self) -> String;
}

/// # Errors
///
/// If the value cannot be serialized to JSON.
pub fn render<R: Report + ?Sized>(report: &R, format: Format) -> anyhow::Result<String> {
    match format {
        Format::Text => Ok(report.text()),
        Format::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn optional(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".to_string(), timestamp)
}

/// Rates are already percentages
fn percent(rate: f64) -> String {
    format!("{rate:.2}%")
}

/// Queue status counts, optionally followed by recent dispatcher runs
#[derive(Debug, Serialize)]
pub struct Overview {
    pub queue: BTreeMap<QueueStatus, StatusSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<WorkerRunStats>,
}

impl Report for Overview {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "{:<12} {:>8}  {:<24} {:<24}", "STATUS", "COUNT", "OLDEST", "NEWEST");
        let _ = writeln!(out, "{}", "-".repeat(71));

        let mut total = 0;
        for (status, summary) in &self.queue {
            total += summary.count;
            let _ = writeln!(
                out,
                "{:<12} {:>8}  {:<24} {:<24}",
                status.as_str(),
                summary.count,
                timestamp(summary.oldest),
                timestamp(summary.newest)
            );
        }

        let _ = writeln!(out, "\nTotal: {total} item(s)");

        if !self.runs.is_empty() {
            let _ = writeln!(out, "\nRecent runs:");
            out.push_str(&self.runs.text());
        }

        out
    }
}

impl Report for Vec<WorkerRunStats> {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{:<24} {:>10} {:>10} {:>8} {:>8}  {:<12}",
            "STARTED", "RUNTIME", "PROCESSED", "FAILED", "BATCHES", "STOP REASON"
        );
        let _ = writeln!(out, "{}", "-".repeat(79));

        for run in self {
            let _ = writeln!(
                out,
                "{:<24} {:>9.1}s {:>10} {:>8} {:>8}  {:<12}",
                timestamp(run.started_at),
                run.runtime_seconds,
                run.emails_processed,
                run.emails_failed,
                run.batches,
                run.stop_reason.as_str()
            );
        }

        out
    }
}

impl Report for Vec<QueueItem> {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{:<8} {:<32} {:<10} {:>7}  {:<24}",
            "ID", "RECIPIENT", "STATUS", "RETRIES", "UPDATED"
        );
        let _ = writeln!(out, "{}", "-".repeat(85));

        for item in self {
            let _ = writeln!(
                out,
                "{:<8} {:<32} {:<10} {:>7}  {:<24}",
                item.id.get(),
                item.recipient_email,
                item.status.as_str(),
                item.retry_count,
                timestamp(item.updated_at)
            );
        }

        let _ = writeln!(out, "\nTotal: {} item(s)", self.len());

        out
    }
}

impl Report for QueueItem {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Item ID: {}", self.id);
        let _ = writeln!(out, "Recipient: {}", self.recipient_email);
        let _ = writeln!(out, "Subject: {}", self.subject);
        let _ = writeln!(out, "Status: {}", self.status);
        let _ = writeln!(out, "Retries: {}", self.retry_count);
        let _ = writeln!(out, "Next retry: {}", optional(self.next_retry_at));
        let _ = writeln!(out, "Created: {}", timestamp(self.created_at));
        let _ = writeln!(out, "Updated: {}", timestamp(self.updated_at));
        if let Some(tracking_id) = &self.tracking_id {
            let _ = writeln!(out, "Tracking ID: {tracking_id}");
        }
        if let Some(error) = &self.last_error {
            let _ = writeln!(out, "Last error: {error}");
        }

        out
    }
}

impl Report for TrackingRecord {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Tracking ID: {}", self.tracking_id);
        let _ = writeln!(out, "Recipient: {}", self.recipient_email);
        let _ = writeln!(out, "Subject: {}", self.subject);
        let _ = writeln!(out, "Status: {}", self.status);
        let _ = writeln!(out, "Opens: {}", self.open_count);
        let _ = writeln!(out, "Clicks: {}", self.click_count);
        let _ = writeln!(out, "First opened: {}", optional(self.opened_at));
        let _ = writeln!(out, "First clicked: {}", optional(self.clicked_at));
        let _ = writeln!(out, "Sent: {}", timestamp(self.created_at));

        out
    }
}

impl Report for TrackingStats {
    fn text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Sent:      {}", self.total_sent);
        let _ = writeln!(
            out,
            "Delivered: {} ({})",
            self.delivered,
            percent(self.delivery_rate)
        );
        let _ = writeln!(out, "Opened:    {} ({})", self.opened, percent(self.open_rate));
        let _ = writeln!(out, "Clicked:   {} ({})", self.clicked, percent(self.click_rate));

        out
    }
}
