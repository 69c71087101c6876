//! Commit results, GC barriers and the read-only lease.

mod common;

use common::*;
use tablet_executor::commit::CommitMeta;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn lend(borrower: u64) -> (Box<dyn Transaction>, Shared<TxRecord>) {
    tx("update_borrow", move |ctx| {
        ctx.update_borrow(label(1), borrower);
        true
    })
}

/// Collects callback ids in the order they ran.
fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
    let ran = Rc::new(RefCell::new(Vec::new()));
    let sink = ran.clone();
    let make = move |id: u32| -> Box<dyn FnOnce()> {
        let sink = sink.clone();
        Box::new(move || sink.borrow_mut().push(id))
    };
    (ran, make)
}

// ═══════════════════════════════════════════════════════════════════════════
// GC barriers and follower acks
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_borrow_update_waits_for_follower_ack() {
    let mut h = Harness::new();
    h.executor.follower_attached();
    let record = h.submit(lend(42));

    let commit = h.last_commit();
    assert!(commit.wait_follower_gc_ack);
    assert_eq!(h.mocks.borrow.lock().updates, vec![(label(1), 42)]);
    assert_eq!(h.mocks.gc.lock().held, vec![1]);

    h.confirm(1);
    assert_eq!(record.lock().completed.map(|c| c.step), Some(Some(1)));
    assert_eq!(h.mocks.gc.lock().active(), vec![1]);

    h.executor.follower_gc_applied(1);
    assert_eq!(h.mocks.gc.lock().released, vec![1]);
    assert!(h.broken().is_none());
}

#[test]
fn test_follower_ack_before_confirm_is_kept() {
    let mut h = Harness::new();
    h.executor.follower_attached();
    h.submit(lend(42));

    h.executor.follower_gc_applied(1);
    assert!(h.mocks.gc.lock().released.is_empty());
    h.confirm(1);
    assert_eq!(h.mocks.gc.lock().released, vec![1]);
}

#[test]
fn test_barrier_released_on_confirm_without_followers() {
    let mut h = Harness::new();
    h.submit(lend(42));
    assert_eq!(h.mocks.gc.lock().active(), vec![1]);
    h.confirm(1);
    assert!(h.mocks.gc.lock().active().is_empty());
}

#[test]
fn test_detached_followers_release_confirmed_barriers() {
    let mut h = Harness::new();
    h.executor.follower_attached();
    h.submit(lend(42));
    h.submit(tx("confirm_loan", |ctx| {
        ctx.confirm_loan(label(2), foreign_label(9));
        true
    }));
    assert_eq!(h.mocks.gc.lock().held, vec![1, 2]);
    assert_eq!(
        h.mocks.borrow.lock().confirmations,
        vec![(label(2), foreign_label(9))]
    );

    h.confirm(1);
    h.executor.followers_detached();
    assert_eq!(h.mocks.gc.lock().released, vec![1]);

    // Confirmed after the followers left: nobody to wait for.
    h.confirm(2);
    assert_eq!(h.mocks.gc.lock().released, vec![1, 2]);
}

#[test]
fn test_gc_barrier_move_reports_completed_loans() {
    let mut h = Harness::new();
    h.mocks.borrow.lock().loans_complete_on_barrier = true;
    h.submit(lend(1));
    h.submit(lend(2));

    h.confirm(2);
    assert_eq!(h.mocks.borrow.lock().gc_barrier, Some(1));
    assert_eq!(h.mocks.owner.lock().loans_changed, 1);

    h.confirm(1);
    assert_eq!(h.mocks.borrow.lock().gc_barrier, None);
    assert_eq!(h.mocks.owner.lock().loans_changed, 2);
}

#[test]
fn test_result_for_unknown_step_is_ignored() {
    let mut h = Harness::new();
    h.confirm(9);
    assert!(h.broken().is_none());
    assert_eq!(h.executor.stats().counters.commits_confirmed, 0);
    assert_eq!(h.mocks.gc.lock().logged, vec![9]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Read-only lease
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_lease_callbacks_run_in_order_after_confirm() {
    let mut h = Harness::new();
    let (ran, callback) = recorder();

    h.executor
        .confirm_read_only_lease_with(ms(10), callback(1))
        .unwrap();
    h.executor
        .confirm_read_only_lease_with(ms(20), callback(2))
        .unwrap();
    assert_eq!(h.mocks.sent_steps(), vec![1]);
    let commit = h.last_commit();
    assert_eq!(commit.kind, CommitKind::Misc);
    assert_eq!(commit.metadata, vec![CommitMeta::LeaseInfo { duration_ms: 250 }]);
    assert!(ran.borrow().is_empty());

    h.confirm(1);
    assert_eq!(*ran.borrow(), vec![1, 2]);
    assert_eq!(h.executor.lease().lease_end, ms(250));
    assert_eq!(
        h.mocks.timers.lock().scheduled,
        vec![(ms(250) - ms(250) / 3, TimerEvent::LeaseExtend)]
    );

    // Already covered: runs on the spot.
    h.executor
        .confirm_read_only_lease_with(ms(100), callback(3))
        .unwrap();
    assert_eq!(*ran.borrow(), vec![1, 2, 3]);
    assert_eq!(h.mocks.sent_steps(), vec![1]);
}

#[test]
fn test_ensure_reuses_covering_commit() {
    let mut h = Harness::new();
    assert_eq!(h.executor.ensure_read_only_lease(ms(0)).unwrap(), 1);
    assert_eq!(h.executor.ensure_read_only_lease(ms(100)).unwrap(), 1);
    assert_eq!(h.executor.ensure_read_only_lease(ms(300)).unwrap(), 2);
    assert_eq!(h.executor.lease().in_flight(), 2);
    assert_eq!(h.executor.stats().counters.lease_commits, 2);
}

#[test]
fn test_lease_duration_doubles_when_confirmed_late() {
    let mut h = Harness::new();
    h.executor.ensure_read_only_lease(ms(0)).unwrap();
    h.mocks.timers.lock().now = ms(200);
    h.confirm(1);

    assert_eq!(h.executor.lease().duration, ms(500));
    assert_eq!(
        h.mocks.timers.lock().scheduled,
        vec![(ms(250) - ms(500) / 3, TimerEvent::LeaseExtend)]
    );

    h.executor.ensure_read_only_lease(ms(300)).unwrap();
    assert_eq!(
        h.last_commit().metadata,
        vec![CommitMeta::LeaseInfo { duration_ms: 500 }]
    );
}

#[test]
fn test_unused_lease_stops_extending() {
    let mut h = Harness::new();
    h.executor.confirm_read_only_lease(ms(0)).unwrap();
    h.confirm(1);

    for _ in 0..10 {
        let before = h.executor.step();
        h.executor.on_timer(TimerEvent::LeaseExtend);
        let after = h.executor.step();
        if after == before {
            break;
        }
        h.confirm(after);
    }

    // One extension for the confirmed read, then the unused allowance.
    assert_eq!(h.executor.stats().counters.lease_extensions, 6);
    assert_eq!(h.executor.stats().counters.lease_commits, 7);
    assert_eq!(h.executor.lease().unused_extensions, 5);

    // A new read starts the lease again.
    h.executor.confirm_read_only_lease(ms(400)).unwrap();
    assert_eq!(h.executor.lease().in_flight(), 1);
}

#[test]
fn test_lease_commit_follows_batched_redo() {
    let mut config = ExecutorConfig::default();
    config.scheduler.allow_log_batching = true;
    let mut h = Harness::with_config(config);
    h.submit(put(b"a"));
    assert!(h.mocks.sent_steps().is_empty());

    assert_eq!(h.executor.ensure_read_only_lease(ms(0)).unwrap(), 2);
    let log = h.mocks.log.lock();
    let kinds: Vec<CommitKind> = log.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CommitKind::Redo, CommitKind::Misc]);
}

#[test]
fn test_log_snapshot_extends_lease() {
    let mut h = Harness::new();
    h.executor.ensure_read_only_lease(ms(0)).unwrap();
    h.confirm(1);
    assert_eq!(h.executor.lease().lease_end, ms(250));

    h.mocks.redo.lock().may_flush_snapshot = true;
    h.mocks.timers.lock().now = ms(100);
    assert_eq!(h.executor.make_log_snapshot(), Some(2));
    let commit = h.last_commit();
    assert_eq!(commit.kind, CommitKind::Snap);
    assert_eq!(commit.metadata, vec![CommitMeta::LeaseInfo { duration_ms: 250 }]);
    assert_eq!(h.executor.lease().in_flight(), 1);

    // Covered by the snapshot: no separate lease commit.
    assert_eq!(h.executor.ensure_read_only_lease(ms(300)).unwrap(), 2);

    h.confirm(2);
    assert_eq!(h.executor.lease().lease_end, ms(350));
    assert_eq!(h.executor.lease().in_flight(), 0);
    assert_eq!(h.executor.stats().counters.lease_commits, 2);
}

#[test]
fn test_dropped_lease_refuses_new_commits() {
    let mut h = Harness::new();
    let (ran, callback) = recorder();
    h.executor.ensure_read_only_lease(ms(0)).unwrap();
    h.mocks.timers.lock().now = ms(50);

    h.executor.drop_lease();
    assert_eq!(h.mocks.owner.lock().lease_dropped, 1);

    let err = h.executor.ensure_read_only_lease(ms(100)).unwrap_err();
    assert!(matches!(err, TabletError::LeaseDropped));

    h.executor
        .confirm_read_only_lease_with(ms(100), callback(1))
        .unwrap();
    h.confirm(1);
    assert!(ran.borrow().is_empty());
    assert_eq!(h.mocks.sent_steps(), vec![1]);
}

#[test]
fn test_follower_has_no_lease() {
    let mut h = Harness::follower();
    let err = h.executor.ensure_read_only_lease(ms(0)).unwrap_err();
    assert!(matches!(err, TabletError::Role(_)));
    assert!(h.mocks.sent_steps().is_empty());
}
