//! Integration tests for trigger rescheduling
//!
//! These tests verify that the single outstanding trigger follows the queue:
//! - Convergence after inserts, skips and approvals
//! - Events sharing a posting slot
//! - Restarts and concurrent reschedulers sharing one token

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{at, harness, harness_with, queued, unscheduled, CountingChannel};
use eventcast::app::{App, Collaborators};
use eventcast::channels::SharedChannel;
use eventcast::cache::create_memory_store;
use eventcast::config::Config;
use eventcast::models::EventStatus;
use eventcast::notifications::{AlertKind, MemorySink};
use eventcast::publisher::TickOutcome;
use eventcast::scheduler::{MemoryTriggerQueue, RescheduleOutcome};
use eventcast::storage::{create_memory_repository, EventRepository};

// ============================================================================
// Convergence
// ============================================================================

async fn assert_converged(app: &App, now: chrono::DateTime<chrono::Utc>) {
    let since = now - Duration::minutes(5);
    let earliest = app
        .repository()
        .earliest_ready_post_time(since)
        .await
        .unwrap()
        .at
        .map(|t| t.max(now));
    let status = app.status().await.unwrap();

    match (earliest, status.token) {
        (None, None) => assert_eq!(status.pending_triggers, 0),
        (Some(expected), Some(token)) => {
            let drift = (token.scheduled_time - expected).num_seconds().abs();
            assert!(drift < 180, "token {} vs {}", token.scheduled_time, expected);
            assert_eq!(status.pending_triggers, 1);
        }
        (expected, token) => panic!("expected {expected:?}, token {token:?}"),
    }
}

#[tokio::test]
async fn test_trigger_follows_queue_changes() {
    let h = harness();
    let repo = h.app.repository().clone();
    let now = at(8, 0);

    let outcome = h.app.reschedule(now).await.unwrap();
    assert_eq!(outcome, RescheduleOutcome::Idle);
    assert_converged(&h.app, now).await;

    repo.insert_new(&[queued("E1", at(12, 0))], now, EventStatus::ReadyToPost)
        .await
        .unwrap();
    h.app.reschedule(now).await.unwrap();
    assert_converged(&h.app, now).await;

    // an earlier event moves the trigger forward
    repo.insert_new(&[queued("E2", at(9, 30))], now, EventStatus::ReadyToPost)
        .await
        .unwrap();
    let outcome = h.app.reschedule(now).await.unwrap();
    assert!(matches!(outcome, RescheduleOutcome::Replaced { .. }));
    assert_eq!(outcome.scheduled_at(), Some(at(9, 30)));
    assert_converged(&h.app, now).await;

    // skipping the earliest event moves the trigger back
    repo.skip("E2", at(14, 20)).await.unwrap();
    h.app.reschedule(now).await.unwrap();
    assert_converged(&h.app, now).await;
    assert_eq!(
        h.app.status().await.unwrap().token.map(|t| t.scheduled_time),
        Some(at(12, 0))
    );

    // a second pass changes nothing
    let outcome = h.app.reschedule(now).await.unwrap();
    assert_eq!(outcome, RescheduleOutcome::Unchanged { at: at(12, 0) });
}

#[tokio::test]
async fn test_skip_through_app_reschedules() {
    let h = harness();
    let now = at(8, 0);
    h.app
        .repository()
        .insert_new(&[queued("E1", at(9, 30))], now, EventStatus::ReadyToPost)
        .await
        .unwrap();
    h.app.reschedule(now).await.unwrap();

    let moved = h.app.skip("E1", now).await.unwrap();

    // 09:30 UTC is 12:30 local (UTC+3); the next weekday slot is 14:20 local
    assert_eq!(moved, Some(at(11, 20)));
    assert_converged(&h.app, now).await;
}

#[tokio::test]
async fn test_unscheduled_events_raise_data_quality_alert() {
    let h = harness();
    h.app
        .repository()
        .insert_new(&[unscheduled("E1")], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();

    let outcome = h.app.reschedule(at(8, 0)).await.unwrap();

    assert_eq!(outcome, RescheduleOutcome::Idle);
    assert_eq!(h.sink.count(AlertKind::DataQuality), 1);
}

// ============================================================================
// Shared Posting Slot
// ============================================================================

#[tokio::test]
async fn test_events_sharing_a_slot_are_both_published() {
    let h = harness();
    h.app
        .repository()
        .insert_new(
            &[queued("E1", at(10, 0)), queued("E2", at(10, 0))],
            at(8, 0),
            EventStatus::ReadyToPost,
        )
        .await
        .unwrap();

    let outcome = h.app.reschedule(at(9, 0)).await.unwrap();
    assert_eq!(outcome.scheduled_at(), Some(at(10, 0)));

    let first = h.app.fire_due(at(10, 0)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].tick.as_ref().and_then(|t| t.event_id()), Some("E1"));
    assert_eq!(first[0].reschedule.scheduled_at(), Some(at(10, 0)));

    let second = h.app.fire_due(at(10, 0)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].tick.as_ref().and_then(|t| t.event_id()), Some("E2"));
    assert!(matches!(
        second[0].reschedule,
        RescheduleOutcome::Cleared { .. }
    ));

    assert_eq!(h.channel.published(), vec!["E1", "E2"]);
    let status = h.app.status().await.unwrap();
    assert_eq!(status.token, None);
    assert_eq!(status.pending_triggers, 0);
}

#[tokio::test]
async fn test_nothing_fires_before_trigger_time() {
    let h = harness();
    h.app
        .repository()
        .insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    h.app.reschedule(at(9, 0)).await.unwrap();

    assert!(h.app.fire_due(at(9, 59)).await.unwrap().is_empty());
    assert_eq!(h.channel.calls(), 0);
}

#[tokio::test]
async fn test_past_due_event_is_published_on_next_tick() {
    let h = harness();
    h.app
        .repository()
        .insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();

    // the process was down at 10:00
    let outcome = h.app.reschedule(at(10, 3)).await.unwrap();
    assert_eq!(outcome.scheduled_at(), Some(at(10, 3)));

    let fired = h.app.fire_due(at(10, 3)).await.unwrap();
    assert!(matches!(
        fired[0].tick,
        Some(TickOutcome::Published { .. })
    ));
}

// ============================================================================
// Restart and Concurrency
// ============================================================================

fn shared_apps() -> (App, App, Arc<CountingChannel>) {
    let repo = create_memory_repository();
    let kv = create_memory_store();
    let triggers = Arc::new(MemoryTriggerQueue::new());
    let channel = Arc::new(CountingChannel::new());

    let build = || {
        App::new(
            Config::default(),
            Collaborators {
                repo: repo.clone(),
                kv: kv.clone(),
                triggers: triggers.clone(),
                channels: vec![channel.clone() as SharedChannel],
                sink: Arc::new(MemorySink::new()),
                scrapers: Vec::new(),
            },
        )
        .unwrap()
    };
    (build(), build(), channel)
}

#[tokio::test]
async fn test_restart_keeps_existing_trigger() {
    let (first, restarted, _) = shared_apps();
    first
        .repository()
        .insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();

    let scheduled = first.reschedule(at(9, 0)).await.unwrap();
    let again = restarted.reschedule(at(9, 1)).await.unwrap();

    assert!(matches!(scheduled, RescheduleOutcome::Scheduled { .. }));
    assert_eq!(again, RescheduleOutcome::Unchanged { at: at(10, 0) });
    assert_eq!(restarted.status().await.unwrap().pending_triggers, 1);
}

#[tokio::test]
async fn test_concurrent_reschedules_leave_one_trigger() {
    let (a, b, _) = shared_apps();
    a.repository()
        .insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();

    let (left, right) = tokio::join!(a.reschedule(at(9, 0)), b.reschedule(at(9, 0)));
    left.unwrap();
    right.unwrap();

    let status = a.status().await.unwrap();
    assert_eq!(status.pending_triggers, 1);
    assert_eq!(status.token.map(|t| t.scheduled_time), Some(at(10, 0)));
}

#[tokio::test]
async fn test_trigger_fired_by_one_process_publishes_once() {
    let (a, b, channel) = shared_apps();
    a.repository()
        .insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    a.reschedule(at(9, 0)).await.unwrap();

    let (left, right) = tokio::join!(a.fire_due(at(10, 0)), b.fire_due(at(10, 0)));
    let fired = left.unwrap().len() + right.unwrap().len();

    assert_eq!(fired, 1);
    assert_eq!(channel.calls(), 1);
}

// ============================================================================
// Tolerance
// ============================================================================

#[tokio::test]
async fn test_zero_tolerance_replaces_on_any_drift() {
    let mut config = Config::default();
    config.scheduler.reschedule_tolerance_secs = 0;
    let h = harness_with(config);
    let repo = h.app.repository().clone();

    repo.insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    h.app.reschedule(at(9, 0)).await.unwrap();

    repo.insert_new(&[queued("E2", at(9, 59))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    let outcome = h.app.reschedule(at(9, 0)).await.unwrap();

    assert!(matches!(outcome, RescheduleOutcome::Replaced { .. }));
    assert_eq!(outcome.scheduled_at(), Some(at(9, 59)));
    let triggers = h.app.status().await.unwrap().pending_triggers;
    assert_eq!(triggers, 1);
}

#[tokio::test]
async fn test_small_drift_within_tolerance_is_ignored() {
    let h = harness();
    let repo = h.app.repository().clone();

    repo.insert_new(&[queued("E1", at(10, 0))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    h.app.reschedule(at(9, 0)).await.unwrap();

    repo.insert_new(&[queued("E2", at(9, 59))], at(8, 0), EventStatus::ReadyToPost)
        .await
        .unwrap();
    let outcome = h.app.reschedule(at(9, 0)).await.unwrap();

    assert_eq!(outcome, RescheduleOutcome::Unchanged { at: at(10, 0) });
}
