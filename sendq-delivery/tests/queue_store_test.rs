//! Queue store behaviour against an on-disk database
//!
//! These tests verify that:
//! 1. Concurrent claims never hand out the same item twice
//! 2. Stale claims are reclaimed exactly once, and count against the retry budget
//! 3. Cleanup only ever removes terminal items
//! 4. Engagement counters survive concurrent writers
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{collections::HashSet, time::Duration};

use sendq_delivery::{Outcome, QueueStatus, RetryPolicy, StoreError, TrackingStatus};
use support::TestHarness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_overlap() {
    let harness = TestHarness::new().await;
    for n in 0..120 {
        harness.enqueue(&format!("user{n}@example.com"), false).await;
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let queue = harness.queue();
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = queue.claim_due_batch(7).await.expect("claim failed");
                if batch.is_empty() {
                    break claimed;
                }
                claimed.extend(batch.into_iter().map(|item| item.id));
            }
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for id in worker.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "item {id} was claimed twice");
        }
    }

    assert_eq!(total, 120);
}

#[tokio::test]
async fn test_stale_claim_reclaimed_exactly_once() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();
    let id = harness.enqueue("crashy@example.com", false).await;

    let claimed = queue.claim_due_batch(1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let policy = RetryPolicy::default();

    // A fresh claim is not stale
    assert_eq!(
        queue
            .reclaim_stale(Duration::from_secs(300), &policy)
            .await
            .unwrap(),
        0
    );

    assert_eq!(queue.reclaim_stale(Duration::ZERO, &policy).await.unwrap(), 1);
    let item = queue.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert!(item.last_error.unwrap().contains("stale claim"));

    assert_eq!(queue.reclaim_stale(Duration::ZERO, &policy).await.unwrap(), 0);
    assert_eq!(queue.get(id).await.unwrap().unwrap().retry_count, 1);

    // The late outcome of the crashed attempt is ignored
    let late = queue
        .mark_outcome(
            id,
            &Outcome::TransientFailure("late".to_string()),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
    assert!(late.is_none());
}

#[tokio::test]
async fn test_repeated_stale_claims_exhaust_retries() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();
    let policy = RetryPolicy::default();
    let id = harness.enqueue("crashloop@example.com", false).await;

    for attempt in 1..=8u32 {
        let claimed = queue.claim_due_batch(1).await.unwrap();
        if attempt > policy.max_retries {
            assert!(claimed.is_empty(), "claimed again on attempt {attempt}");
            continue;
        }

        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.reclaim_stale(Duration::ZERO, &policy).await.unwrap(), 1);
    }

    let item = queue.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.retry_count, policy.max_retries);
    assert_eq!(item.next_retry_at, None);
    assert_eq!(
        item.last_error.as_deref(),
        Some("retries exhausted after 5 attempts: stale claim")
    );

    // Nothing left in sending to reclaim
    assert_eq!(queue.reclaim_stale(Duration::ZERO, &policy).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_only_removes_terminal_items() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();

    let sent = harness.enqueue("done@example.com", false).await;
    queue.claim_due_batch(1).await.unwrap();
    queue
        .mark_outcome(
            sent,
            &Outcome::Delivered { confirmed: false },
            &RetryPolicy::default(),
        )
        .await
        .unwrap();

    let pending = harness.enqueue("waiting@example.com", false).await;
    let recent = harness.enqueue("recent@example.com", false).await;
    queue.cancel(recent).await.unwrap();

    harness.age(sent, 45).await;
    harness.age(pending, 45).await;

    assert_eq!(queue.purge(30, &[]).await.unwrap(), 1);
    assert!(queue.get(sent).await.unwrap().is_none());
    assert_eq!(
        queue.get(pending).await.unwrap().unwrap().status,
        QueueStatus::Pending
    );
    assert_eq!(
        queue.get(recent).await.unwrap().unwrap().status,
        QueueStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cleanup_by_status() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();

    let cancelled = harness.enqueue("a@example.com", false).await;
    queue.cancel(cancelled).await.unwrap();
    let bounced = harness.enqueue("b@example.com", false).await;
    queue.claim_due_batch(1).await.unwrap();
    queue
        .mark_outcome(
            bounced,
            &Outcome::PermanentFailure("Invalid recipient: b@example.com".to_string()),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();

    harness.age(cancelled, 10).await;
    harness.age(bounced, 10).await;

    assert_eq!(queue.purge(7, &[QueueStatus::Cancelled]).await.unwrap(), 1);
    assert!(queue.get(cancelled).await.unwrap().is_none());
    assert!(queue.get(bounced).await.unwrap().is_some());

    assert!(matches!(
        queue.purge(7, &[QueueStatus::Sending]).await,
        Err(StoreError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_failure_reasons_are_distinguishable() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();
    let policy = RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::default()
    };

    let bounced = harness.enqueue("bounce@example.com", false).await;
    queue.claim_due_batch(1).await.unwrap();
    queue
        .mark_outcome(
            bounced,
            &Outcome::PermanentFailure("Invalid recipient: bounce@example.com".to_string()),
            &policy,
        )
        .await
        .unwrap();

    let exhausted = harness.enqueue("flaky@example.com", false).await;
    queue.claim_due_batch(1).await.unwrap();
    queue
        .mark_outcome(
            exhausted,
            &Outcome::TransientFailure("connection refused".to_string()),
            &policy,
        )
        .await
        .unwrap();

    let cancelled = harness.enqueue("never@example.com", false).await;
    queue.cancel(cancelled).await.unwrap();

    let reason = |id| {
        let queue = queue.clone();
        async move { queue.get(id).await.unwrap().unwrap().last_error.unwrap() }
    };

    assert!(reason(bounced).await.starts_with("permanent failure:"));
    assert!(reason(exhausted).await.starts_with("retries exhausted after 1 attempts:"));
    assert_eq!(reason(cancelled).await, "cancelled by operator");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_engagement_counts_every_event() {
    let harness = TestHarness::new().await;
    let queue = harness.queue();
    let tracking = harness.tracking();

    let id = harness.enqueue("reader@example.com", true).await;
    queue.claim_due_batch(1).await.unwrap();
    queue
        .mark_outcome(
            id,
            &Outcome::Delivered { confirmed: false },
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
    let tracking_id = queue.get(id).await.unwrap().unwrap().tracking_id.unwrap();
    assert!(
        tracking
            .record_sent(&tracking_id, "reader@example.com", "Hello")
            .await
            .unwrap()
    );

    let fire = |count: usize, click: bool| {
        (0..count)
            .map(|_| {
                let tracking = tracking.clone();
                let tracking_id = tracking_id.clone();
                tokio::spawn(async move {
                    if click {
                        tracking.record_click(&tracking_id).await
                    } else {
                        tracking.record_open(&tracking_id).await
                    }
                })
            })
            .collect::<Vec<_>>()
    };

    for task in fire(40, false) {
        assert!(task.await.unwrap().expect("open failed"));
    }

    let record = tracking.get(&tracking_id).await.unwrap().unwrap();
    assert_eq!(record.open_count, 40);
    assert_eq!(record.click_count, 0);
    assert_eq!(record.status, TrackingStatus::Opened);

    for task in fire(25, true) {
        assert!(task.await.unwrap().expect("click failed"));
    }

    let record = tracking.get(&tracking_id).await.unwrap().unwrap();
    assert_eq!(record.open_count, 40);
    assert_eq!(record.click_count, 25);
    assert_eq!(record.status, TrackingStatus::Clicked);
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        QueueStatus::Clicked
    );
}
