#[cfg(test)]
mod executor_tests {
    use std::collections::BTreeMap;

    use tablet_common::config::ExecutorConfig;
    use tablet_common::error::{BrokenReason, ErrorKind, TabletError};
    use tablet_common::types::{BlobId, Epoch, FetchStatus, Label, SeatId, TableId};

    use crate::commit::CommitKind;
    use crate::executor::Executor;
    use crate::interfaces::{
        FetchKind, FetchRequest, FetchResult, Priority, SharedUpdate, TimerEvent,
    };
    use crate::mock::{MockCollaborators, ScriptedTx, Shared, TxRecord};
    use crate::page_cache::LoadState;
    use crate::parts::{CachePolicy, LoadedPage, PageFetch, PartView, Slice};
    use crate::seat::{TerminationReason, Transaction, TxContext};

    const TABLE: TableId = TableId(1);

    fn label(cookie: u32) -> Label {
        BlobId::new(1, 1, 2, cookie)
    }

    fn part(cookie: u32) -> PartView {
        PartView {
            label: label(cookie),
            epoch: Epoch(1),
            slices: vec![Slice::new(0, 99)],
            page_count: 4,
            page_size: 100,
            blobs: vec![label(cookie)],
        }
    }

    fn setup_with(config: ExecutorConfig) -> (Executor, MockCollaborators) {
        let mocks = MockCollaborators::new();
        mocks.database.lock().table_mut(TABLE);
        let mut executor = Executor::new(config, mocks.boxed()).unwrap();
        executor.activate();
        (executor, mocks)
    }

    fn setup() -> (Executor, MockCollaborators) {
        setup_with(ExecutorConfig::default())
    }

    fn writer(key: &'static [u8]) -> (Box<dyn Transaction>, Shared<TxRecord>) {
        let (tx, record) = ScriptedTx::new("writer", move |ctx: &mut TxContext<'_>| {
            ctx.update(TABLE, key.to_vec(), Some(b"v".to_vec()));
            true
        });
        (Box::new(tx), record)
    }

    fn reader() -> (Box<dyn Transaction>, Shared<TxRecord>) {
        let (tx, record) = ScriptedTx::new("reader", |ctx: &mut TxContext<'_>| {
            ctx.read(TABLE, b"a");
            true
        });
        (Box::new(tx), record)
    }

    fn provide(executor: &mut Executor, label: Label, kind: FetchKind, pages: &[u32]) {
        executor.on_fetch_result(FetchResult {
            label,
            kind,
            status: FetchStatus::Ok,
            pages: pages
                .iter()
                .map(|&p| LoadedPage::new(p, vec![p as u8; 4]))
                .collect(),
        });
    }

    // ── Admission ──

    #[test]
    fn test_admission_waits_for_activation() {
        let mocks = MockCollaborators::new();
        mocks.database.lock().table_mut(TABLE);
        let mut executor = Executor::new(ExecutorConfig::default(), mocks.boxed()).unwrap();

        let (tx, record) = writer(b"a");
        assert_eq!(executor.execute(tx).unwrap(), SeatId(1));
        assert_eq!(record.lock().executions, 0);
        assert_eq!(executor.stats().counters.tx_pending, 1);

        executor.activate();
        assert!(executor.is_active());
        assert_eq!(record.lock().executions, 1);
        assert_eq!(mocks.sent_steps(), vec![1]);

        executor.on_commit_result(1, FetchStatus::Ok);
        let done = record.lock().completed.unwrap();
        assert_eq!(done.step, Some(1));
        assert_eq!(done.retries, 1);
        assert_eq!(mocks.redo.lock().confirmed, vec![1]);
        assert_eq!(executor.stats().counters.tx_in_fly, 0);
    }

    #[test]
    fn test_in_fly_limit_defers_admission() {
        let mut config = ExecutorConfig::default();
        config.scheduler.max_tx_in_fly = 1;
        let (mut executor, mocks) = setup_with(config);

        let (tx1, record1) = writer(b"a");
        let (tx2, record2) = writer(b"b");
        executor.execute(tx1).unwrap();
        executor.execute(tx2).unwrap();
        assert_eq!(record1.lock().executions, 1);
        assert_eq!(record2.lock().executions, 0);
        assert_eq!(executor.stats().counters.tx_pending, 1);

        executor.on_commit_result(1, FetchStatus::Ok);
        assert!(record1.lock().completed.is_some());
        assert_eq!(record2.lock().executions, 1);
        assert_eq!(mocks.sent_steps(), vec![1, 2]);
    }

    #[test]
    fn test_read_only_completes_behind_redo_commit() {
        let (mut executor, mocks) = setup();
        let (tx1, record1) = writer(b"a");
        let (tx2, record2) = reader();
        executor.execute(tx1).unwrap();
        executor.execute(tx2).unwrap();

        assert_eq!(record2.lock().executions, 1);
        assert!(record2.lock().completed.is_none());
        assert_eq!(mocks.sent_steps(), vec![1]);

        executor.on_commit_result(1, FetchStatus::Ok);
        assert_eq!(record1.lock().completed.unwrap().step, Some(1));
        assert_eq!(record2.lock().completed.unwrap().step, None);

        let (tx3, record3) = reader();
        executor.execute(tx3).unwrap();
        assert!(record3.lock().completed.is_some());
        assert_eq!(executor.stats().counters.tx_read_only, 2);
    }

    #[test]
    fn test_batched_changes_flush_on_timer() {
        let mut config = ExecutorConfig::default();
        config.scheduler.allow_log_batching = true;
        let (mut executor, mocks) = setup_with(config);

        let (tx1, record1) = writer(b"a");
        let (tx2, record2) = writer(b"b");
        executor.execute(tx1).unwrap();
        executor.execute(tx2).unwrap();
        assert!(mocks.sent_steps().is_empty());
        assert_eq!(mocks.redo.lock().batched.len(), 2);
        assert_eq!(mocks.timers.lock().scheduled.len(), 1);

        executor.on_timer(TimerEvent::FlushLog);
        assert_eq!(mocks.sent_steps(), vec![1]);
        assert_eq!(mocks.redo.lock().flushed, vec![(1, 2)]);

        executor.on_commit_result(1, FetchStatus::Ok);
        assert_eq!(record1.lock().completed.unwrap().step, Some(1));
        assert_eq!(record2.lock().completed.unwrap().step, Some(1));
        assert_eq!(executor.stats().counters.batched_change_sets, 2);
    }

    // ── Broken paths ──

    #[test]
    fn test_validation_failure_breaks_once() {
        let (mut executor, mocks) = setup();
        mocks.database.lock().validation_failure = Some("constraint".into());

        let (tx, record) = writer(b"a");
        executor.execute(tx).unwrap();
        assert!(record.lock().completed.is_none());
        assert!(matches!(
            executor.broken_reason(),
            Some(BrokenReason::ValidationFailed { seat: SeatId(1), .. })
        ));
        assert!(mocks.sent_steps().is_empty());

        let (tx, _) = writer(b"b");
        let err = executor.execute(tx).unwrap_err();
        assert!(matches!(err, TabletError::Broken(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);

        let owner = mocks.owner.lock();
        assert_eq!(owner.broken.len(), 1);
        assert_eq!(owner.detached, 1);
    }

    #[test]
    fn test_commit_failure_breaks_once() {
        let (mut executor, mocks) = setup();
        let (tx1, _) = writer(b"a");
        let (tx2, _) = writer(b"b");
        executor.execute(tx1).unwrap();
        executor.execute(tx2).unwrap();

        executor.on_commit_result(1, FetchStatus::Error);
        executor.on_commit_result(2, FetchStatus::Error);
        assert_eq!(
            executor.broken_reason(),
            Some(&BrokenReason::CommitFailed { step: 1 })
        );
        assert!(!executor.is_active());
        assert!(mocks.shared_cache.lock().unregistered);
        assert_eq!(mocks.owner.lock().broken.len(), 1);
    }

    #[test]
    fn test_break_returns_pins_memory_and_barriers() {
        let (mut executor, mocks) = setup();
        mocks.database.lock().table_mut(TABLE).parts.push(part(1));
        executor.attach_boot_parts(TABLE, &[part(1)]);
        provide(&mut executor, label(1), FetchKind::Cache, &[0]);

        let (parked, parked_record) = ScriptedTx::new("parked", |ctx: &mut TxContext<'_>| {
            let first = ctx.page(label(1), 0).is_some();
            ctx.page(label(1), 1).is_some() && first
        });
        executor.execute(Box::new(parked)).unwrap();
        assert_eq!(executor.cache().pins(&label(1), 1), 1);

        let (snapshot, _) = ScriptedTx::new("snapshot", |ctx: &mut TxContext<'_>| {
            ctx.snapshot_table(TABLE);
            true
        });
        executor.execute(Box::new(snapshot)).unwrap();
        executor.prepare_compaction(TABLE).unwrap();
        assert_eq!(mocks.gc.lock().held, vec![1]);
        assert!(executor.stats().memory.static_used > 0);

        executor.on_commit_result(1, FetchStatus::Error);
        assert!(executor.broken_reason().is_some());
        assert!(parked_record.lock().completed.is_none());

        let stats = executor.stats();
        assert_eq!(executor.cache().pins(&label(1), 0), 0);
        assert_eq!(executor.cache().pins(&label(1), 1), 0);
        assert_eq!(stats.cache.pinned_set_size, 0);
        assert_eq!(stats.memory.static_used, 0);
        assert_eq!(stats.counters.tx_in_fly, 0);
        assert_eq!(mocks.gc.lock().released, vec![1]);
    }

    #[test]
    fn test_write_on_follower_is_corruption() {
        let mut config = ExecutorConfig::default();
        config.follower = true;
        let (mut executor, mocks) = setup_with(config);

        let (tx, record) = reader();
        executor.execute(tx).unwrap();
        assert!(record.lock().completed.is_some());

        let (tx, _) = writer(b"a");
        executor.execute(tx).unwrap();
        assert!(matches!(
            executor.broken_reason(),
            Some(BrokenReason::Corrupted(_))
        ));
        assert!(mocks.sent_steps().is_empty());
    }

    #[test]
    fn test_yielding_transaction_is_requeued() {
        let (mut executor, mocks) = setup();
        let mut runs = 0;
        let (tx, record) = ScriptedTx::new("yield_once", move |ctx: &mut TxContext<'_>| {
            runs += 1;
            if runs < 2 {
                return false;
            }
            ctx.update(TABLE, b"a".to_vec(), Some(b"v".to_vec()));
            true
        });
        let (second, second_record) = writer(b"b");
        executor.execute(Box::new(tx)).unwrap();
        executor.execute(second).unwrap();

        assert!(executor.broken_reason().is_none());
        assert_eq!(record.lock().executions, 2);
        assert_eq!(second_record.lock().executions, 1);
        assert_eq!(mocks.sent_steps(), vec![1, 2]);

        executor.on_commit_result(1, FetchStatus::Ok);
        let done = record.lock().completed.unwrap();
        assert_eq!(done.retries, 2);
        assert_eq!(done.step, Some(1));
    }

    #[test]
    fn test_unknown_follower_ack_breaks() {
        let (mut executor, _mocks) = setup();
        executor.follower_gc_applied(5);
        assert_eq!(
            executor.broken_reason(),
            Some(&BrokenReason::UnknownBarrier { step: 5 })
        );
    }

    // ── Memory ──

    #[test]
    fn test_memory_above_hard_limit_terminates() {
        let mut config = ExecutorConfig::default();
        config.scheduler.tx_memory_limit = 512 * 1024;
        let (mut executor, mocks) = setup_with(config);

        let (tx, record) = ScriptedTx::new("greedy", |ctx: &mut TxContext<'_>| {
            ctx.request_memory(1 << 20);
            false
        });
        executor.execute(Box::new(tx)).unwrap();

        let record = record.lock();
        assert_eq!(record.terminated, Some(TerminationReason::MemoryLimitExceeded));
        assert!(record.completed.is_none());
        let stats = executor.stats();
        assert_eq!(stats.counters.tx_terminated, 1);
        assert_eq!(stats.counters.tx_in_fly, 0);
        assert_eq!(stats.memory.static_used, 0);
        assert!(mocks.broker.lock().submitted.is_empty());
    }

    #[test]
    fn test_captured_memory_outlives_seat() {
        let (mut executor, _mocks) = setup();
        let (tx, record) = ScriptedTx::new("capture", |ctx: &mut TxContext<'_>| {
            ctx.capture_memory();
            true
        });
        executor.execute(Box::new(tx)).unwrap();

        let token = record.lock().captured.take().unwrap();
        assert_eq!(token.bytes, 256 * 1024);
        assert!(record.lock().completed.is_some());
        let memory = executor.stats().memory;
        assert_eq!(memory.captured_tokens, 1);
        assert_eq!(memory.static_used, 256 * 1024);

        assert!(executor.release_memory_token(token));
        let memory = executor.stats().memory;
        assert_eq!(memory.captured_tokens, 0);
        assert_eq!(memory.static_used, 0);
    }

    #[test]
    fn test_attached_memory_released_with_seat() {
        let (mut executor, _mocks) = setup();
        let (tx, record) = ScriptedTx::new("capture", |ctx: &mut TxContext<'_>| {
            ctx.capture_memory();
            true
        });
        executor.execute(Box::new(tx)).unwrap();
        let mut token = record.lock().captured.take();
        assert!(token.is_some());

        let (tx, record) = ScriptedTx::new("attach", move |ctx: &mut TxContext<'_>| {
            if let Some(token) = token.take() {
                ctx.attach_memory(token);
            }
            true
        });
        executor.execute(Box::new(tx)).unwrap();
        assert!(record.lock().completed.is_some());

        let memory = executor.stats().memory;
        assert_eq!(memory.captured_tokens, 0);
        assert_eq!(memory.attaches, 1);
        assert_eq!(memory.static_used, 0);
    }

    // ── Snapshots and barriers ──

    #[test]
    fn test_table_snapshot_holds_barrier_until_durable() {
        let (mut executor, mocks) = setup();
        let (tx, _) = ScriptedTx::new("snapshot", |ctx: &mut TxContext<'_>| {
            ctx.snapshot_table(TABLE);
            true
        });
        executor.execute(Box::new(tx)).unwrap();
        assert_eq!(mocks.sent_steps(), vec![1]);
        assert_eq!(mocks.gc.lock().held, vec![1]);
        assert!(mocks.gc.lock().released.is_empty());
        assert!(mocks.owner.lock().snapshots.is_empty());

        executor.on_commit_result(1, FetchStatus::Ok);
        assert_eq!(mocks.gc.lock().released, vec![1]);
        assert_eq!(mocks.owner.lock().snapshots, vec![(TABLE, 1)]);
    }

    #[test]
    fn test_log_snapshot_only_when_redo_allows() {
        let (mut executor, mocks) = setup();
        assert_eq!(executor.make_log_snapshot(), None);

        mocks.redo.lock().may_flush_snapshot = true;
        assert_eq!(executor.make_log_snapshot(), Some(1));
        assert_eq!(mocks.last_commit().unwrap().kind, CommitKind::Snap);
        assert_eq!(mocks.redo.lock().snaps, vec![1]);

        executor.on_commit_result(1, FetchStatus::Ok);
        assert_eq!(mocks.redo.lock().confirmed_snaps, vec![1]);
        assert!(mocks.redo.lock().confirmed.is_empty());
    }

    #[test]
    fn test_gc_state_size_in_stats() {
        let (mut executor, mocks) = setup();
        let (tx, _) = ScriptedTx::new("snapshot", |ctx: &mut TxContext<'_>| {
            ctx.snapshot_table(TABLE);
            true
        });
        executor.execute(Box::new(tx)).unwrap();
        assert_eq!(executor.stats().gc.uncommitted, 1);
        assert_eq!(executor.stats().gc.committed, 0);

        executor.on_commit_result(1, FetchStatus::Ok);
        let gc = executor.stats().gc;
        assert_eq!((gc.committed, gc.uncommitted), (1, 0));
        assert_eq!(mocks.gc.lock().logged, vec![1]);
    }

    // ── Loans ──

    #[test]
    fn test_borrow_bundle_goes_to_log_without_barrier() {
        let (mut executor, mocks) = setup();
        let (tx, record) = ScriptedTx::new("lend", |ctx: &mut TxContext<'_>| {
            ctx.borrow_bundle(label(4), 77);
            true
        });
        executor.execute(Box::new(tx)).unwrap();

        assert_eq!(mocks.sent_steps(), vec![1]);
        assert_eq!(mocks.borrow.lock().borrows, vec![(label(4), 77)]);
        assert!(mocks.gc.lock().held.is_empty());
        assert!(!mocks.last_commit().unwrap().wait_follower_gc_ack);

        executor.on_commit_result(1, FetchStatus::Ok);
        assert_eq!(record.lock().completed.map(|c| c.step), Some(Some(1)));
    }

    #[test]
    fn test_borrowed_parts_come_from_borrow_logic() {
        let (executor, mocks) = setup();
        assert!(executor.borrowed_parts().is_empty());
        mocks.borrow.lock().loans.push((label(3), TABLE, 1));
        assert_eq!(executor.borrowed_parts(), vec![label(3)]);
    }

    // ── Page cache plumbing ──

    #[test]
    fn test_shared_request_for_unknown_collection_races() {
        let (mut executor, mocks) = setup();
        executor.on_shared_request(
            7,
            FetchRequest {
                priority: Priority::Fast,
                kind: FetchKind::Cache,
                fetch: PageFetch {
                    label: label(40),
                    pages: vec![0],
                },
            },
        );
        let cache = mocks.shared_cache.lock();
        assert_eq!(cache.responses.len(), 1);
        let (requester, result) = &cache.responses[0];
        assert_eq!(*requester, 7);
        assert_eq!(result.status, FetchStatus::Race);
        assert!(result.pages.is_empty());
        assert!(cache.forwarded.is_empty());
    }

    #[test]
    fn test_shared_request_split_between_cache_and_forward() {
        let (mut executor, mocks) = setup();
        executor.attach_boot_parts(TABLE, &[part(1)]);
        provide(&mut executor, label(1), FetchKind::Cache, &[0]);

        executor.on_shared_request(
            9,
            FetchRequest {
                priority: Priority::Background,
                kind: FetchKind::Cache,
                fetch: PageFetch {
                    label: label(1),
                    pages: vec![0, 1],
                },
            },
        );
        let cache = mocks.shared_cache.lock();
        assert_eq!(cache.responses.len(), 1);
        assert_eq!(cache.responses[0].1.status, FetchStatus::Ok);
        assert_eq!(
            cache.responses[0].1.pages.iter().map(|p| p.page).collect::<Vec<_>>(),
            vec![0]
        );
        assert_eq!(cache.forwarded.len(), 1);
        assert_eq!(cache.forwarded[0].0, 9);
        assert_eq!(cache.forwarded[0].1.fetch.pages, vec![1]);
        assert_eq!(cache.forwarded[0].1.priority, Priority::Background);
    }

    #[test]
    fn test_shared_update_drops_unpinned_pages() {
        let (mut executor, _mocks) = setup();
        executor.attach_boot_parts(TABLE, &[part(1)]);
        provide(&mut executor, label(1), FetchKind::Cache, &[0, 1]);

        let mut updates = BTreeMap::new();
        updates.insert(
            label(1),
            SharedUpdate {
                accepted: Vec::new(),
                dropped: vec![0],
            },
        );
        updates.insert(
            label(99),
            SharedUpdate {
                accepted: Vec::new(),
                dropped: vec![0],
            },
        );
        executor.on_shared_updated(updates);

        assert_eq!(executor.cache().state(&label(1), 0), LoadState::No);
        assert_eq!(executor.cache().state(&label(1), 1), LoadState::Loaded);
        assert!(executor.broken_reason().is_none());
    }

    #[test]
    fn test_always_resident_table_loads_sticky_pages() {
        let (mut executor, mocks) = setup();
        mocks.database.lock().table_mut(TABLE).cache_policy = CachePolicy::Ever;
        executor.attach_boot_parts(TABLE, &[part(1)]);

        {
            let cache = mocks.shared_cache.lock();
            assert_eq!(cache.attached, vec![(label(1), 4)]);
            assert_eq!(cache.requests.len(), 1);
            assert_eq!(cache.requests[0].priority, Priority::Background);
            assert_eq!(cache.requests[0].kind, FetchKind::CacheSync);
            assert_eq!(cache.requests[0].fetch.pages, vec![0, 1, 2, 3]);
        }

        provide(&mut executor, label(1), FetchKind::CacheSync, &[0, 1, 2, 3]);
        let mut updates = BTreeMap::new();
        updates.insert(
            label(1),
            SharedUpdate {
                accepted: Vec::new(),
                dropped: vec![2],
            },
        );
        executor.on_shared_updated(updates);
        assert_eq!(executor.cache().state(&label(1), 2), LoadState::Loaded);
    }

    #[test]
    fn test_retry_counter_grows_per_attempt() {
        let (mut executor, _mocks) = setup();
        executor.attach_boot_parts(TABLE, &[part(1)]);

        let (tx, record) = ScriptedTx::new("paged", |ctx: &mut TxContext<'_>| {
            ctx.page(label(1), 3).is_some()
        });
        executor.execute(Box::new(tx)).unwrap();
        assert_eq!(record.lock().executions, 1);

        provide(&mut executor, label(1), FetchKind::Cache, &[3]);
        let done = record.lock().completed.unwrap();
        assert_eq!(done.retries, 2);
        assert_eq!(done.step, None);
        assert_eq!(executor.cache().pins(&label(1), 3), 0);
    }

    #[test]
    fn test_touched_pages_reported_to_shared_cache() {
        let (mut executor, mocks) = setup();
        executor.attach_boot_parts(TABLE, &[part(1)]);
        provide(&mut executor, label(1), FetchKind::Cache, &[0, 2]);

        let (tx, _) = ScriptedTx::new("scan", |ctx: &mut TxContext<'_>| {
            ctx.page(label(1), 2).is_some() && ctx.page(label(1), 0).is_some()
        });
        executor.execute(Box::new(tx)).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(label(1), vec![0, 2]);
        assert_eq!(mocks.shared_cache.lock().touched, vec![expected]);

        executor.execute(reader().0).unwrap();
        assert_eq!(mocks.shared_cache.lock().touched.len(), 1);
    }
}
