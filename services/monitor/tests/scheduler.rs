//! Integration tests for the cycle runner and the cancellable loop.
//!
//! Uses fake collaborators; timing-sensitive tests use short real windows.


use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{dataset, open_slot, runner, FakeApi, FakeSource, RecordingSink};
use slotwatch_monitor::allocation::RemoteError;
use slotwatch_monitor::cycle::{CycleError, CycleKind, CycleResult};
use slotwatch_monitor::model::Dataset;
use slotwatch_monitor::notifier::ChangeNotifier;
use slotwatch_monitor::scheduler::{CancellableLoop, LoopOutcome};
use slotwatch_monitor::shutdown;
use slotwatch_monitor::source::SourceError;
use slotwatch_monitor::subscribers::{SubscriberId, SubscriberRegistry, SubscriberStore};
use slotwatch_pacing::Endpoint;

const MINUTE: Duration = Duration::from_secs(60);

fn failure(result: CycleResult) -> CycleError {
    match result {
        CycleResult::Failure { reason, .. } => reason,
        CycleResult::Success { .. } => panic!("expected a failed cycle"),
    }
}

#[tokio::test]
async fn test_first_cycle_refreshes_then_reuses_context() {
    let (_trigger, signal) = shutdown::channel();
    let source = FakeSource::with(vec![dataset()]);
    let api = FakeApi::new(vec![open_slot(5, 0.0)]);
    let mut runner = runner(source.clone(), api.clone(), 6, MINUTE, signal);

    let first = runner.run_cycle().await;
    assert_eq!(first.kind(), CycleKind::RefreshAndCall);
    match &first {
        CycleResult::Success { snapshot, .. } => assert_eq!(snapshot.slot_count, 1),
        CycleResult::Failure { reason, .. } => panic!("cycle failed: {reason}"),
    }
    assert_eq!(source.fetches(), 1);
    assert_eq!(api.calls(), (1, 1, 1));

    let second = runner.run_cycle().await;
    assert_eq!(second.kind(), CycleKind::CallOnly);
    assert!(second.is_success());
    assert_eq!(second.timings().fetch_time, Duration::ZERO);
    assert_eq!(source.fetches(), 1);
    assert_eq!(api.calls(), (1, 1, 2));

    assert_eq!(runner.quota().pacing_window().calls_issued(), 4);
    assert_eq!(runner.latency().len(), 4);
}

#[tokio::test]
async fn test_exhausted_window_stops_issuing_calls() {
    let (_trigger, signal) = shutdown::channel();
    let api = FakeApi::new(vec![open_slot(5, 0.0)]);
    let mut runner = runner(FakeSource::with(vec![dataset()]), api.clone(), 4, MINUTE, signal);

    assert!(runner.run_cycle().await.is_success());
    assert!(runner.run_cycle().await.is_success());
    assert!(runner.window_exhausted());

    let reason = failure(runner.run_cycle().await);
    assert_eq!(
        reason,
        CycleError::WindowExhausted {
            endpoint: Endpoint::Coefficients
        }
    );
    assert_eq!(api.calls(), (1, 1, 2));
    assert_eq!(runner.quota().pacing_window().calls_issued(), 4);

    // Exhausted: the pacer waits out the window.
    let pause = runner.next_pause();
    assert!(pause > Duration::from_secs(55) && pause <= MINUTE);
}

#[tokio::test]
async fn test_window_restart_triggers_refresh() {
    let (_trigger, signal) = shutdown::channel();
    let source = FakeSource::with(vec![dataset()]);
    let mut runner = runner(
        source.clone(),
        FakeApi::new(vec![]),
        6,
        Duration::from_millis(100),
        signal,
    );

    assert_eq!(runner.run_cycle().await.kind(), CycleKind::RefreshAndCall);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(runner.run_cycle().await.kind(), CycleKind::RefreshAndCall);
    assert_eq!(source.fetches(), 2);
    assert_eq!(runner.quota().pacing_window().resets(), 1);
}

#[tokio::test]
async fn test_no_usable_records_fails_without_remote_calls() {
    let (_trigger, signal) = shutdown::channel();
    let empty = Dataset {
        items: vec![],
        ..dataset()
    };
    let api = FakeApi::new(vec![]);
    let mut runner = runner(FakeSource::with(vec![empty]), api.clone(), 6, MINUTE, signal);

    let result = runner.run_cycle().await;
    assert_eq!(result.kind(), CycleKind::RefreshAndCall);
    assert!(matches!(failure(result), CycleError::SourceUnavailable(_)));
    assert_eq!(api.calls(), (0, 0, 0));
    assert_eq!(runner.quota().pacing_window().calls_issued(), 0);
    assert!(runner.context().is_none());
}

#[tokio::test]
async fn test_rate_limited_call_stops_after_max_attempts() {
    let (_trigger, signal) = shutdown::channel();
    let api = FakeApi::failing(RemoteError::RateLimited {
        status: Some(429),
        retry_after: None,
    });
    let mut runner = runner(FakeSource::with(vec![dataset()]), api.clone(), 6, MINUTE, signal);

    let reason = failure(runner.run_cycle().await);
    assert_eq!(
        reason,
        CycleError::QuotaExceeded {
            endpoint: Endpoint::Coefficients,
            attempts: 3
        }
    );
    // Three attempts, one reservation.
    assert_eq!(api.calls(), (1, 1, 3));
    assert_eq!(runner.quota().pacing_window().calls_issued(), 3);
}

#[tokio::test]
async fn test_remote_failure_is_not_retried() {
    let (_trigger, signal) = shutdown::channel();
    let api = FakeApi::failing(RemoteError::Http {
        status: 500,
        body: "internal".to_string(),
    });
    let mut runner = runner(FakeSource::with(vec![dataset()]), api.clone(), 6, MINUTE, signal);

    let reason = failure(runner.run_cycle().await);
    assert!(matches!(
        reason,
        CycleError::RemoteFailure {
            endpoint: Endpoint::Coefficients,
            ..
        }
    ));
    assert_eq!(api.calls(), (1, 1, 1));
}

#[tokio::test]
async fn test_cancelled_before_call() {
    let (trigger, signal) = shutdown::channel();
    let api = FakeApi::new(vec![]);
    let mut runner = runner(FakeSource::with(vec![dataset()]), api.clone(), 6, MINUTE, signal);
    trigger.trigger();

    assert_eq!(failure(runner.run_cycle().await), CycleError::Cancelled);
    assert_eq!(api.calls(), (0, 0, 0));
}

#[tokio::test]
async fn test_loop_stops_promptly_during_pause() {
    let (trigger, signal) = shutdown::channel();
    let runner = runner(
        FakeSource::with(vec![dataset()]),
        FakeApi::new(vec![open_slot(5, 0.0)]),
        6,
        MINUTE,
        signal.clone(),
    );
    let scheduler = CancellableLoop::new(
        runner,
        signal,
        Duration::from_secs(10),
        Duration::from_secs(1),
    );
    let status = scheduler.status();

    let handle = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cancelled_at = Instant::now();
    trigger.trigger();
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop")
        .unwrap()
        .unwrap();

    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    let LoopOutcome::Stopped {
        cycle_count,
        last_success,
    } = outcome;
    assert_eq!(cycle_count, 1);
    assert!(last_success.is_some());

    let status = status.borrow().clone();
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn test_loop_discards_in_flight_cycle() {
    let (trigger, signal) = shutdown::channel();
    let api = FakeApi::slow(vec![open_slot(5, 0.0)], Duration::from_millis(300));
    let runner = runner(
        FakeSource::with(vec![dataset()]),
        api.clone(),
        6,
        MINUTE,
        signal.clone(),
    );
    let scheduler = CancellableLoop::new(
        runner,
        signal,
        Duration::from_secs(10),
        Duration::from_secs(2),
    );

    let handle = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    let outcome = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("loop did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(
        outcome,
        LoopOutcome::Stopped {
            cycle_count: 0,
            last_success: None
        }
    );
    // The call was allowed to finish, not retried.
    assert_eq!(api.calls().2, 1);
}

#[tokio::test]
async fn test_permanent_source_failure_is_fatal() {
    let (_trigger, signal) = shutdown::channel();
    let runner = runner(
        FakeSource::failing(SourceError::Permanent("spreadsheet deleted".to_string())),
        FakeApi::new(vec![]),
        6,
        MINUTE,
        signal.clone(),
    );
    let scheduler = CancellableLoop::new(
        runner,
        signal,
        Duration::from_secs(10),
        Duration::from_secs(1),
    );

    let result = tokio::time::timeout(Duration::from_secs(2), scheduler.run())
        .await
        .expect("loop did not stop");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("spreadsheet deleted"));
}

#[tokio::test]
async fn test_transient_source_failure_keeps_looping() {
    let (trigger, signal) = shutdown::channel();
    let source = FakeSource::failing(SourceError::Unavailable("503".to_string()));
    let runner = runner(source.clone(), FakeApi::new(vec![]), 6, MINUTE, signal.clone());
    let scheduler = CancellableLoop::new(
        runner,
        signal,
        Duration::from_millis(20),
        Duration::from_secs(1),
    );
    let status = scheduler.status();

    let handle = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.trigger();
    handle.await.unwrap().unwrap();

    assert!(source.fetches() >= 2);
    let status = status.borrow().clone();
    assert!(status.consecutive_failures >= 2);
    assert!(status.last_success.is_none());
}

#[tokio::test]
async fn test_unchanged_snapshots_are_pushed_once() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        SubscriberRegistry::open(SubscriberStore::new(dir.path().join("subs.json"))).unwrap(),
    );
    registry.subscribe(SubscriberId(1)).await.unwrap();
    registry.subscribe(SubscriberId(2)).await.unwrap();

    let sink = RecordingSink::new();
    let notifier = Arc::new(ChangeNotifier::new(
        registry.clone(),
        sink.clone(),
        Duration::ZERO,
    ));

    let (_trigger, signal) = shutdown::channel();
    let api = FakeApi::new(vec![open_slot(5, 0.0)]);
    let mut runner = runner(FakeSource::with(vec![dataset()]), api.clone(), 6, MINUTE, signal)
        .with_notifier(notifier);

    for _ in 0..3 {
        assert!(runner.run_cycle().await.is_success());
    }
    assert_eq!(sink.sent_count(), 2);

    api.set_coefficients(vec![open_slot(5, 0.0), open_slot(6, 1.0)]);
    assert!(runner.run_cycle().await.is_success());
    assert_eq!(sink.sent_count(), 4);
    assert_eq!(sink.sent_to(1), 2);
}
