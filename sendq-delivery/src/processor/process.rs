//! Per-item delivery attempts within a claimed batch

use std::{sync::Arc, time::Duration};

use sendq_common::{QueueStatus, Signal};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, SystemError, TemporaryError},
    processor::{Dispatcher, RunCounters, signalled},
    sender::Sender,
    types::{Outcome, OutboundMessage, QueueItem},
};

/// Send the items of a claimed batch, one after another.
///
/// Never fails: each attempted item's result, whatever it is, ends up
/// recorded on the item. When `shutdown` is given it is checked between two
/// items, and the batch stops early if it fired. Returns how many items were
/// attempted; the caller owns the rest, which are still in `sending`.
pub(crate) async fn process_batch(
    dispatcher: &Dispatcher,
    items: &[QueueItem],
    counters: &mut RunCounters,
    mut shutdown: Option<&mut broadcast::Receiver<Signal>>,
) -> usize {
    let message_delay = Duration::from_millis(dispatcher.config.message_delay_ms);
    let send_timeout = Duration::from_secs(dispatcher.config.send_timeout_secs);

    debug!(items = items.len(), "Processing batch");

    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            if shutdown.as_deref_mut().is_some_and(signalled) {
                return index;
            }

            if !message_delay.is_zero() {
                tokio::time::sleep(message_delay).await;
            }
        }

        let outcome = attempt(Arc::clone(&dispatcher.sender), item.outbound(), send_timeout).await;

        counters.processed += 1;
        if outcome.is_failure() {
            counters.failed += 1;
        }

        record_outcome(dispatcher, item, &outcome).await;
    }

    items.len()
}

/// One send attempt, isolated in its own task.
///
/// A panicking or hung adapter becomes a transient failure for this item
/// instead of taking the batch down with it.
pub(crate) async fn attempt(
    sender: Arc<dyn Sender>,
    message: OutboundMessage,
    send_timeout: Duration,
) -> Outcome {
    let mut task = tokio::spawn(async move { sender.send(&message).await });

    let result: Result<_, DeliveryError> = match tokio::time::timeout(send_timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SystemError::TaskFailed(join_error.to_string()).into()),
        Err(_elapsed) => {
            task.abort();
            Err(TemporaryError::Timeout(send_timeout.as_secs()).into())
        }
    };

    Outcome::from(result)
}

async fn record_outcome(dispatcher: &Dispatcher, item: &QueueItem, outcome: &Outcome) {
    let transition = match dispatcher
        .queue
        .mark_outcome(item.id, outcome, &dispatcher.config.retry)
        .await
    {
        Ok(Some(transition)) => transition,
        Ok(None) => {
            warn!(
                item_id = %item.id,
                "Item left sending before its outcome was recorded, discarding outcome"
            );
            return;
        }
        Err(e) => {
            // Stays in sending; the stale-claim sweep will pick it up again
            error!(item_id = %item.id, error = %e, "Failed to record delivery outcome");
            return;
        }
    };

    match transition.status {
        QueueStatus::Sent | QueueStatus::Delivered => {
            info!(
                item_id = %item.id,
                recipient = %item.recipient_email,
                status = %transition.status,
                "Message handed off"
            );
        }
        QueueStatus::Pending => {
            warn!(
                item_id = %item.id,
                retry_count = transition.retry_count,
                next_retry_at = ?transition.next_retry_at,
                error = transition.last_error.as_deref(),
                "Delivery failed, will retry"
            );
        }
        status => {
            warn!(
                item_id = %item.id,
                %status,
                error = transition.last_error.as_deref(),
                "Delivery failed permanently"
            );
        }
    }

    if let (Outcome::Delivered { confirmed }, Some(tracking_id)) = (outcome, &item.tracking_id) {
        if let Err(e) = dispatcher
            .tracking
            .record_sent(tracking_id, &item.recipient_email, &item.subject)
            .await
        {
            error!(item_id = %item.id, tracking_id = %tracking_id, error = %e, "Failed to create tracking record");
            return;
        }

        if *confirmed
            && let Err(e) = dispatcher.tracking.record_delivered(tracking_id).await
        {
            error!(item_id = %item.id, tracking_id = %tracking_id, error = %e, "Failed to confirm tracked delivery");
        }
    }
}
