//! Transaction scheduler: admission, parking on pages and memory, resume.

mod common;

use common::*;

// ═══════════════════════════════════════════════════════════════════════════
// Ordering: one transaction at a time, in admission order
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_queued_transactions_run_in_admission_order() {
    let mocks = MockCollaborators::new();
    let mut executor = Executor::new(ExecutorConfig::default(), mocks.boxed()).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let order = order.clone();
        let (t, _) = tx(name, move |_ctx| {
            order.borrow_mut().push(name);
            true
        });
        executor.execute(t).unwrap();
    }
    assert!(order.borrow().is_empty());

    executor.activate();
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    assert_eq!(executor.stats().counters.tx_completed, 3);
}

#[test]
fn test_parked_transactions_resume_one_at_a_time() {
    let mut h = Harness::new();
    let data = label(1);
    h.add_parts(TABLE, vec![part(data, 1, &[(0, 99)])]);

    let running = Rc::new(Cell::new(0u32));
    let max_running = Rc::new(Cell::new(0u32));
    let mut records = Vec::new();
    for page in [1, 2, 3, 1] {
        let running = running.clone();
        let max_running = max_running.clone();
        records.push(h.submit(tx("scan", move |ctx| {
            running.set(running.get() + 1);
            max_running.set(max_running.get().max(running.get()));
            let found = ctx.page(data, page).is_some();
            running.set(running.get() - 1);
            found
        })));
    }

    assert_eq!(h.requested(data), vec![1, 2, 3]);
    assert!(records.iter().all(|r| r.lock().completed.is_none()));
    assert_eq!(h.executor.stats().counters.tx_postponed, 4);

    h.provide(data, &[3, 1, 2]);
    for record in &records {
        let record = record.lock();
        assert_eq!(record.executions, 2);
        assert_eq!(record.completed.map(|c| c.retries), Some(2));
    }
    assert_eq!(max_running.get(), 1);
    assert_eq!(h.requested(data), vec![1, 2, 3]);
    assert!(h.broken().is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// Pins
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_pages_stay_pinned_while_parked() {
    let mut h = Harness::new();
    let data = label(1);
    h.add_parts(TABLE, vec![part(data, 1, &[(0, 99)])]);
    h.provide(data, &[0]);

    let record = h.submit(read_pages(data, vec![0, 1]));
    assert_eq!(h.executor.cache().pins(&data, 0), 1);
    assert_eq!(h.executor.cache().pins(&data, 1), 1);

    let mut dropped = BTreeMap::new();
    dropped.insert(
        data,
        SharedUpdate {
            accepted: Vec::new(),
            dropped: vec![0],
        },
    );
    h.executor.on_shared_updated(dropped.clone());
    assert_eq!(h.executor.cache().state(&data, 0), LoadState::Loaded);

    h.provide(data, &[1]);
    assert!(record.lock().completed.is_some());
    assert_eq!(h.executor.cache().pins(&data, 0), 0);
    assert_eq!(h.executor.cache().pins(&data, 1), 0);
    assert_eq!(h.executor.stats().cache.pinned_set_size, 0);

    h.executor.on_shared_updated(dropped);
    assert_eq!(h.executor.cache().state(&data, 0), LoadState::No);
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_static_shortage_waits_for_broker() {
    let mut config = ExecutorConfig::default();
    config.memory.static_limit = 128 * 1024;
    let mut h = Harness::with_config(config);

    let record = h.submit(put(b"a"));
    assert_eq!(record.lock().executions, 0);
    assert_eq!(
        h.mocks.broker.lock().submitted,
        vec![(TaskId(1), 256 * 1024)]
    );
    assert_eq!(h.executor.stats().memory.postponed_seats, 1);

    h.executor.resource_allocated(TaskId(1));
    assert_eq!(record.lock().executions, 1);
    h.confirm(1);
    assert_eq!(record.lock().completed.map(|c| c.step), Some(Some(1)));
    assert_eq!(
        h.mocks.broker.lock().finished,
        vec![(TaskId(1), TaskStatus::Finished)]
    );
    assert_eq!(h.executor.stats().memory.dynamic_used, 0);
}

#[test]
fn test_memory_request_parks_until_granted() {
    let mut h = Harness::new();
    let wanted: u64 = 100 << 20;
    let record = h.submit(tx("bulk", move |ctx| {
        if ctx.memory_limit() < wanted {
            ctx.request_memory(wanted);
            return false;
        }
        true
    }));

    {
        let record = record.lock();
        assert_eq!(record.executions, 1);
        assert_eq!(record.released_data, 1);
        assert!(record.completed.is_none());
    }
    let submitted = h.mocks.broker.lock().submitted.clone();
    assert_eq!(submitted, vec![(TaskId(1), wanted + 256 * 1024)]);
    assert_eq!(h.executor.stats().memory.static_used, 0);

    h.executor.resource_allocated(TaskId(1));
    assert_eq!(record.lock().executions, 2);
    assert!(record.lock().completed.is_some());
    assert_eq!(
        h.mocks.broker.lock().finished,
        vec![(TaskId(1), TaskStatus::Finished)]
    );
}

#[test]
fn test_allocation_for_unknown_task_is_ignored() {
    let mut h = Harness::new();
    h.executor.resource_allocated(TaskId(42));
    assert!(h.broken().is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// Partial cache hits
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_only_missing_pages_are_requested() {
    let mut h = Harness::new();
    let data = label(1);
    h.add_parts(TABLE, vec![part(data, 1, &[(0, 99)])]);
    h.provide(data, &[0, 1]);

    let record = h.submit(read_pages(data, vec![0, 1, 2]));
    assert_eq!(h.requested(data), vec![2]);
    {
        let cache = h.mocks.shared_cache.lock();
        assert_eq!(cache.requests.len(), 1);
        assert_eq!(cache.requests[0].priority, Priority::Fast);
        assert_eq!(cache.requests[0].kind, FetchKind::Cache);
    }

    h.provide(data, &[2]);
    assert_eq!(record.lock().completed.map(|c| c.retries), Some(2));
    let counters = h.executor.stats().counters;
    assert_eq!(counters.tx_cache_hits, 2);
    assert_eq!(counters.tx_cache_misses, 1);
    assert_eq!(counters.tx_retried, 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Failed fetch
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_failed_fetch_breaks_tablet() {
    let mut h = Harness::new();
    let data = label(1);
    h.add_parts(TABLE, vec![part(data, 1, &[(0, 99)])]);
    let record = h.submit(read_pages(data, vec![1]));

    h.executor.on_fetch_result(FetchResult {
        label: data,
        kind: FetchKind::Cache,
        status: FetchStatus::NoData,
        pages: Vec::new(),
    });
    assert_eq!(
        h.broken(),
        Some(BrokenReason::PageFetchFailed {
            label: data,
            status: FetchStatus::NoData,
        })
    );
    assert!(record.lock().completed.is_none());
    assert_eq!(h.executor.stats().counters.alerts_req_nodata, 1);

    let (t, _) = put(b"late");
    assert!(matches!(h.executor.execute(t), Err(TabletError::Broken(_))));

    h.provide(data, &[1]);
    assert!(record.lock().completed.is_none());
    let owner = h.mocks.owner.lock();
    assert_eq!(owner.broken.len(), 1);
    assert_eq!(owner.detached, 1);
}

#[test]
fn test_fetch_error_for_forgotten_collection_is_ignored() {
    let mut h = Harness::new();
    h.executor.on_fetch_result(FetchResult {
        label: label(9),
        kind: FetchKind::Cache,
        status: FetchStatus::Error,
        pages: Vec::new(),
    });
    assert!(h.broken().is_none());
}
