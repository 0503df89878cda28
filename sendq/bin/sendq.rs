//! Command-line entry point for the sendq email pipeline
//!
//! This tool provides:
//! - The dispatcher itself (`start`), for a service manager or cron
//! - Queue inspection and statistics
//! - Producer and operator actions (enqueue, cancel, retry, cleanup)
//! - Engagement recording for the tracking endpoint

#[cfg(not(unix))]
compile_error!("Only unix platforms are currently supported");

use std::{io::Read, path::PathBuf, process::ExitCode};

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use sendq::{
    Controller, Sendq,
    report::{self, Format, Overview, Report},
};
use sendq_common::logging;
use sendq_delivery::{NewEmail, QueueItemId, QueueStatus, RunOutcome};

/// Exit code when another dispatcher already holds the lock
const EXIT_LOCK_HELD: u8 = 2;

/// Transactional email queue and delivery dispatcher
#[derive(Parser, Debug)]
#[command(name = "sendq")]
#[command(about = "Queue, dispatch and track transactional email", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file (overrides `SENDQ_CONFIG`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format for read commands
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher until signalled, or for a bounded number of batches
    Start {
        /// Stop after this many batches, or earlier once nothing is due
        max_batches: Option<u64>,
    },
    /// Show item counts per status
    Stats {
        /// Also show this many recent dispatcher runs
        #[arg(long, default_value = "0")]
        runs: u32,
    },
    /// Delete old items in terminal statuses
    Cleanup {
        /// Age in days (defaults to the configured retention)
        retention_days: Option<u32>,

        /// Only purge these statuses (repeatable; defaults to every terminal status)
        #[arg(long)]
        status: Vec<QueueStatus>,
    },
    /// Add a message to the queue
    Enqueue {
        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        /// Message body (read from stdin when omitted)
        #[arg(long)]
        body: Option<String>,

        /// Correlate the message with open/click tracking
        #[arg(long)]
        trackable: bool,
    },
    /// Cancel a pending or failed item
    Cancel {
        id: QueueItemId,
    },
    /// Reset a finished item for another delivery attempt
    Retry {
        id: QueueItemId,

        /// Retry even if the message was already sent
        #[arg(long)]
        force: bool,
    },
    /// View a single queue item
    Show {
        id: QueueItemId,
    },
    /// List queue items, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<QueueStatus>,

        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Show recent dispatcher runs
    Runs {
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Open/click tracking
    Tracking {
        #[command(subcommand)]
        action: TrackingAction,
    },
}

#[derive(Subcommand, Debug)]
enum TrackingAction {
    /// Engagement rates for messages sent in a time range
    Stats {
        /// Start of the range, RFC 3339 (defaults to 30 days before `--to`)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// End of the range, exclusive, RFC 3339 (defaults to now)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// View a tracking record
    Show {
        tracking_id: String,
    },
    /// Record an open
    Open {
        tracking_id: String,
    },
    /// Record a click
    Click {
        tracking_id: String,
    },
    /// Record a delivery confirmation
    Delivered {
        tracking_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Sendq::load(cli.config.as_deref())?;
    let controller = Controller::open(config).await?;

    let result = dispatch(&controller, cli.command, cli.format).await;
    controller.close().await;

    result
}

async fn dispatch(
    controller: &Controller,
    command: Commands,
    format: Format,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Start { max_batches } => {
            return match controller.start(max_batches).await? {
                RunOutcome::LockHeld => {
                    eprintln!("Dispatcher already running");
                    Ok(ExitCode::from(EXIT_LOCK_HELD))
                }
                RunOutcome::Completed(_) => Ok(ExitCode::SUCCESS),
            };
        }
        Commands::Stats { runs } => {
            let overview = Overview {
                queue: controller.stats().queue_status_counts().await?,
                runs: if runs == 0 {
                    Vec::new()
                } else {
                    controller.stats().recent_runs(runs).await?
                },
            };
            print(&overview, format)?;
        }
        Commands::Cleanup {
            retention_days,
            status,
        } => {
            let removed = controller.cleanup(retention_days, &status).await?;
            println!("Removed {removed} item(s)");
        }
        Commands::Enqueue {
            to,
            subject,
            body,
            trackable,
        } => {
            let body = match body {
                Some(body) => body,
                None => {
                    let mut body = String::new();
                    std::io::stdin().read_to_string(&mut body)?;
                    body
                }
            };

            let id = controller
                .queue()
                .enqueue(&NewEmail {
                    recipient: to,
                    subject,
                    body,
                    trackable,
                })
                .await?;
            println!("{id}");
        }
        Commands::Cancel { id } => {
            if !controller.queue().cancel(id).await? {
                anyhow::bail!("Item {id} is not pending or failed, nothing cancelled");
            }
            println!("Item {id} cancelled");
        }
        Commands::Retry { id, force } => {
            if !controller.queue().retry(id, force).await? {
                if force {
                    anyhow::bail!("Item {id} is not in a finished state");
                }
                anyhow::bail!(
                    "Item {id} is not failed, bounced or cancelled. Use --force to retry a sent item."
                );
            }
            println!("Item {id} marked for retry");
        }
        Commands::Show { id } => {
            let Some(item) = controller.queue().get(id).await? else {
                anyhow::bail!("No queue item with id {id}");
            };
            print(&item, format)?;
        }
        Commands::List { status, limit } => {
            let items = controller.queue().list(status, limit).await?;
            print(&items, format)?;
        }
        Commands::Runs { limit } => {
            let runs = controller.stats().recent_runs(limit).await?;
            print(&runs, format)?;
        }
        Commands::Tracking { action } => tracking(controller, action, format).await?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn tracking(
    controller: &Controller,
    action: TrackingAction,
    format: Format,
) -> anyhow::Result<()> {
    let store = controller.tracking();

    let (tracking_id, recorded, event) = match action {
        TrackingAction::Stats { from, to } => {
            let to = to.unwrap_or_else(Utc::now);
            let from = from.unwrap_or(to - Duration::days(30));
            if from >= to {
                anyhow::bail!("--from must be before --to");
            }

            return print(&store.stats_for_range(from, to).await?, format);
        }
        TrackingAction::Show { tracking_id } => {
            let Some(record) = store.get(&tracking_id).await? else {
                anyhow::bail!("Unknown tracking id {tracking_id}");
            };
            return print(&record, format);
        }
        TrackingAction::Open { tracking_id } => {
            let recorded = store.record_open(&tracking_id).await?;
            (tracking_id, recorded, "open")
        }
        TrackingAction::Click { tracking_id } => {
            let recorded = store.record_click(&tracking_id).await?;
            (tracking_id, recorded, "click")
        }
        TrackingAction::Delivered { tracking_id } => {
            let recorded = store.record_delivered(&tracking_id).await?;
            (tracking_id, recorded, "delivery")
        }
    };

    if !recorded {
        anyhow::bail!("Unknown tracking id {tracking_id}");
    }
    println!("Recorded {event} for {tracking_id}");

    Ok(())
}

fn print<R: Report + ?Sized>(value: &R, format: Format) -> anyhow::Result<()> {
    let rendered = report::render(value, format)?;
    print!("{rendered}");
    if format == Format::Json {
        println!();
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_and_cleanup() {
        let cli = Cli::try_parse_from(["sendq", "start", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { max_batches: Some(5) }));

        let cli = Cli::try_parse_from([
            "sendq", "cleanup", "45", "--status", "sent", "--status", "cancelled",
        ])
        .unwrap();
        match cli.command {
            Commands::Cleanup {
                retention_days,
                status,
            } => {
                assert_eq!(retention_days, Some(45));
                assert_eq!(status, vec![QueueStatus::Sent, QueueStatus::Cancelled]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["sendq", "list", "--status", "lost"]).is_err());
        assert!(Cli::try_parse_from(["sendq", "show", "abc"]).is_err());
    }

    #[test]
    fn test_global_format_flag() {
        let cli = Cli::try_parse_from(["sendq", "stats", "--format", "json", "--runs", "3"]).unwrap();
        assert_eq!(cli.format, Format::Json);
        assert!(matches!(cli.command, Commands::Stats { runs: 3 }));
    }
}
