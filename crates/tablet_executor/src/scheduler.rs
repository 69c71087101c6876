//! Transaction scheduler.
//!
//! Admission puts a seat on the static memory pool and into one of two
//! queues: the pending queue while the tablet cannot execute (inactive,
//! part switches pending, a transaction broke, or too many in flight), or
//! the activation queue. Activations are posted as local events, one per
//! queued seat, so transactions always run one at a time and in order.
//!
//! An attempt ends in one of three ways:
//! - done: changes go to the log (or the seat completes read-only)
//! - not done: pages are pinned and loaded, or memory is requested, and the
//!   seat parks until its wait pad fires or the broker grants the task
//! - terminated: the seat is retired without committing

use std::collections::BTreeMap;

use tablet_common::error::{BrokenReason, TabletError, TabletResult};
use tablet_common::types::{PageId, SeatId, Step};

use crate::commit::{CommitKind, InFlyBarrier, LogCommit};
use crate::executor::{Executor, LocalEvent, Waiter};
use crate::interfaces::{FetchKind, FetchRequest, Priority, TimerEvent};
use crate::parts::{ChangeSet, PageFetch};
use crate::seat::{Completed, Seat, TerminationReason, Transaction, TxContext, TxEnv};

impl Executor {
    pub(crate) fn can_execute_transaction(&self) -> bool {
        self.active
            && (self.config.follower || self.switches.is_empty())
            && self.broken_transaction.is_none()
            && self.broken.is_none()
    }

    /// Admit a transaction. It runs once the tablet is active, nothing
    /// ahead of it is queued, and its initial memory is available.
    pub fn execute(&mut self, tx: Box<dyn Transaction>) -> TabletResult<SeatId> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        self.next_seat += 1;
        let id = SeatId(self.next_seat);
        let mut seat = Seat::new(id, tx);
        self.stats.tx_in_fly += 1;
        tracing::debug!(seat = %seat, "transaction admitted");

        let initial = self.config.scheduler.initial_tx_memory;
        seat.current_tx_data_limit = initial;
        if self.memory.remained_static() < initial {
            self.stats.tx_memory_waits += 1;
            self.memory
                .request_limit(seat, initial, self.io.broker.as_mut());
            return Ok(id);
        }
        self.memory.alloc_static(&mut seat, initial);

        let limit = self.config.scheduler.max_tx_in_fly;
        if !self.can_execute_transaction() || (limit > 0 && self.stats.tx_in_fly > limit) {
            self.pending_queue.push_back(seat);
            self.stats.tx_pending += 1;
        } else if !self.activation_queue.is_empty() {
            self.activation_queue.push_back(seat);
            self.plan_transaction_activation();
        } else {
            self.execute_transaction(seat);
        }
        self.pump();
        Ok(id)
    }

    /// Move pending seats into the activation queue while the in-flight
    /// limit allows, then post one activation per queued seat.
    pub(crate) fn plan_transaction_activation(&mut self) {
        if !self.can_execute_transaction() {
            return;
        }
        let limit = self.config.scheduler.max_tx_in_fly;
        while !self.pending_queue.is_empty()
            && (limit == 0 || self.stats.tx_in_fly - self.stats.tx_pending < limit)
        {
            let Some(seat) = self.pending_queue.pop_front() else {
                break;
            };
            self.stats.tx_pending -= 1;
            self.activation_queue.push_back(seat);
        }
        while self.activate_in_flight < self.activation_queue.len() {
            self.activate_in_flight += 1;
            self.post(LocalEvent::ActivateExecution);
        }
    }

    pub(crate) fn on_activate_execution(&mut self) {
        self.activate_in_flight = self.activate_in_flight.saturating_sub(1);
        if !self.can_execute_transaction() {
            return;
        }
        if let Some(seat) = self.activation_queue.pop_front() {
            self.execute_transaction(seat);
        }
    }

    fn stamp(&self) -> u64 {
        (u64::from(self.config.generation) << 32) | u64::from(self.commits.step())
    }

    fn execute_transaction(&mut self, mut seat: Seat) {
        seat.retries += 1;
        self.stats.tx_executed += 1;
        let stamp = self.stamp();
        let step = self.commits.step();

        self.io.database.begin(stamp);
        let mut env = TxEnv::default();
        let done = {
            let mut ctx = TxContext::new(
                &seat,
                step,
                self.io.database.as_mut(),
                &self.cache,
                &mut env,
            );
            seat.tx.execute(&mut ctx)
        };

        let failure = if done {
            self.io.database.validate_commit().err()
        } else {
            None
        };
        let success = done && failure.is_none() && env.termination.is_none();
        let change = self.io.database.commit(stamp, success);

        let outcome = match (&failure, done) {
            (Some(_), _) => "failed",
            (None, true) => "done",
            (None, false) => "retry",
        };
        tracing::debug!(seat = %seat, retries = seat.retries, outcome, "transaction executed");

        seat.attached_memory = env.attached_memory.take();
        seat.requested_memory = env.requested_memory;
        seat.capture_memory = env.capture_memory;
        if let Some(reason) = env.termination {
            seat.termination = Some(reason);
        }

        if let Some(reason) = failure {
            tracing::error!(seat = %seat, reason = %reason, "fatal commit failure");
            self.unpin_seat(&mut seat);
            self.memory.release_memory(&mut seat, self.io.broker.as_mut());
            self.broken_transaction = Some(BrokenReason::ValidationFailed {
                seat: seat.id,
                reason,
            });
            self.post(LocalEvent::BrokenTransaction);
        } else if done || seat.termination.is_some() {
            self.commit_transaction_log(seat, env, change);
        } else {
            self.postpone_transaction(seat, env);
        }

        self.plan_transaction_activation();
    }

    pub(crate) fn unpin_seat(&mut self, seat: &mut Seat) {
        for (label, pages) in std::mem::take(&mut seat.pinned) {
            for page in pages {
                self.cache.unpin(&label, page);
            }
        }
        seat.memory_touched = 0;
    }

    /// Pin what the attempt touched, settle memory, then either load the
    /// missing pages or, when nothing is missing, requeue the seat.
    fn postpone_transaction(&mut self, mut seat: Seat, env: TxEnv) {
        let mut new_pins = 0u64;
        for (label, pages) in env.pages.touches.iter().chain(env.pages.to_load.iter()) {
            let page_size = self.cache.page_size(label);
            let pinned = seat.pinned.entry(*label).or_default();
            for &page in pages {
                if pinned.insert(page) {
                    self.cache.pin(label, page);
                    seat.memory_touched += page_size;
                    new_pins += 1;
                }
            }
        }

        if let Some(token) = seat.attached_memory.take() {
            self.memory
                .attach_memory(&mut seat, token, self.io.broker.as_mut());
        }
        let requested = std::mem::take(&mut seat.requested_memory);
        seat.current_tx_data_limit += requested;

        let total = seat.memory_touched + seat.current_tx_data_limit;
        let hard_limit = self.config.scheduler.tx_memory_limit;
        if hard_limit > 0 && total > hard_limit {
            tracing::error!(seat = %seat, total, limit = hard_limit, "transaction memory limit exceeded");
            seat.termination = Some(TerminationReason::MemoryLimitExceeded);
            self.commit_transaction_log(seat, env, ChangeSet::default());
            return;
        }

        if total > seat.current_memory_limit {
            let desired = total.max(seat.current_memory_limit * 2);
            let mut allocated = false;
            if seat.task.is_none() {
                let remain = self.memory.remained_static();
                if remain >= total - seat.current_memory_limit {
                    let limit = (remain + seat.current_memory_limit).min(desired);
                    self.memory.alloc_static(&mut seat, limit);
                    allocated = true;
                }
            }
            if !allocated {
                self.memory.free_static(&mut seat, 0);
                self.unpin_seat(&mut seat);
                seat.tx.release_tx_data();
                self.stats.tx_memory_waits += 1;
                self.memory
                    .request_limit(seat, desired, self.io.broker.as_mut());
                return;
            }
        }

        if !env.pages.has_to_load() {
            self.activation_queue.push_back(seat);
            self.plan_transaction_activation();
            return;
        }

        let pad = self.cache.new_pad();
        let mut load_pages = 0u64;
        let mut load_bytes = 0u64;
        for (label, pages) in &env.pages.to_load {
            let pages: Vec<PageId> = pages.iter().copied().collect();
            let (requested, bytes) = self.cache.load(label, &pages, Some(pad));
            if requested.is_empty() {
                continue;
            }
            load_pages += requested.len() as u64;
            load_bytes += bytes;
            self.io.shared_cache.request(FetchRequest {
                priority: Priority::Fast,
                kind: FetchKind::Cache,
                fetch: PageFetch {
                    label: *label,
                    pages: requested,
                },
            });
        }

        self.stats.tx_postponed += 1;
        if seat.retries == 1 {
            self.stats.tx_retried += 1;
            self.stats.tx_cache_hits += env.pages.cache_hits;
        }
        self.stats.tx_cache_misses += load_pages;
        self.stats.pages_requested += load_pages;
        self.stats.bytes_requested += load_bytes;
        tracing::debug!(seat = %seat, load_pages, load_bytes, new_pins, "transaction postponed");

        if !self.cache.has_pad(&pad) {
            self.activation_queue.push_back(seat);
            self.plan_transaction_activation();
            return;
        }
        self.wait_pads.insert(pad, Waiter::Seat(seat));
    }

    fn commit_transaction_log(&mut self, mut seat: Seat, env: TxEnv, change: ChangeSet) {
        let read_only = !(change.has_any() || env.has_changes());

        let mut touched = BTreeMap::new();
        for (label, pages) in &env.pages.touches {
            for &page in pages {
                self.cache.touch(label, page);
            }
            if !pages.is_empty() {
                touched.insert(*label, pages.iter().copied().collect::<Vec<_>>());
            }
        }
        if !touched.is_empty() {
            self.io.shared_cache.touch(touched);
        }
        if seat.retries == 1 {
            self.stats.tx_cache_hits += env.pages.touched_pages();
        }

        self.unpin_seat(&mut seat);
        if let Some(token) = seat.attached_memory.take() {
            self.memory
                .attach_memory(&mut seat, token, self.io.broker.as_mut());
        }
        if let Some(token) = self
            .memory
            .release_memory(&mut seat, self.io.broker.as_mut())
        {
            seat.tx.memory_captured(token);
        }

        if let Some(reason) = seat.termination {
            self.stats.tx_in_fly -= 1;
            self.stats.tx_terminated += 1;
            tracing::debug!(seat = %seat, reason = %reason, "transaction terminated");
            seat.tx.terminate(reason);
            return;
        }

        if read_only {
            self.stats.tx_read_only += 1;
            if self.config.follower {
                self.complete_seat(seat, None);
                return;
            }
            if !self.batched.is_empty() {
                self.flush_batched_log();
            }
            match self.redo_waiting.keys().next_back().copied() {
                Some(step) => self.ro_waiting.entry(step).or_default().push(seat),
                None => self.complete_seat(seat, None),
            }
            return;
        }

        if self.config.follower {
            self.become_broken(BrokenReason::Corrupted(format!(
                "{} changed data on a follower",
                seat.id
            )));
            return;
        }

        let force = !self.config.scheduler.allow_log_batching
            || change.scheme
            || !change.annex.is_empty()
            || change.removed_row_versions
            || env.has_changes();

        if !force {
            self.io.redo.batch(seat.id, &change);
            self.stats.batched_change_sets += 1;
            self.batched.push(seat);
            self.update_in_mem_stats(&change);
            if !self.flush_scheduled {
                self.flush_scheduled = true;
                let now = self.io.timers.now();
                self.io.timers.schedule(now, TimerEvent::FlushLog);
            }
            return;
        }

        let mut commit = self.commits.begin(CommitKind::Redo);
        let step = commit.step;
        let mut seats = self.take_batched(&mut commit);
        self.io.redo.write(&mut commit, seat.id, &change);
        seats.push(seat);

        for &table in &env.snapshots {
            self.hold_snapshot(table, step);
        }

        if let Err(reason) = self.write_transaction_switches(&mut commit, env) {
            self.become_broken(reason);
            return;
        }

        self.redo_waiting.insert(step, seats);
        self.send_commit(commit);
        self.update_in_mem_stats(&change);
    }

    /// Part switches and borrow updates a transaction asked for.
    fn write_transaction_switches(
        &mut self,
        commit: &mut LogCommit,
        env: TxEnv,
    ) -> Result<(), BrokenReason> {
        let step = commit.step;
        for (source, destination) in env.moves {
            self.move_table_parts(commit, source, destination)?;
        }

        let had_pending = !self.switches.is_empty();
        for (table, components) in env.loan_bundles {
            self.loan_bundle(commit, table, components)?;
        }
        for (table, components) in env.loan_tx_status {
            self.loan_tx_status(commit, table, components)?;
        }
        if !had_pending {
            self.apply_ready_part_switches();
        }

        for (label, borrower) in env.borrow_bundles {
            self.io.borrow.borrow_bundle(label, borrower, commit);
        }
        if !env.borrow_updates.is_empty() || !env.loan_confirmations.is_empty() {
            commit.wait_follower_gc_ack = true;
            for (label, borrower) in env.borrow_updates {
                self.io.borrow.update_borrow(label, borrower, commit);
            }
            for (label, borrow_id) in env.loan_confirmations {
                self.io.borrow.confirm_update_loan(label, borrow_id, commit);
            }
            let barrier = self.barriers.acquire(step, self.io.gc.as_mut());
            self.in_fly_barriers.insert(step, InFlyBarrier::new(barrier));
        }
        Ok(())
    }

    fn update_in_mem_stats(&mut self, change: &ChangeSet) {
        for &table in &change.affects {
            let mem_size = self.io.database.table_mem_size(table);
            self.io.compaction.update_in_mem_stats(table, 1, mem_size);
        }
    }

    fn take_batched(&mut self, commit: &mut LogCommit) -> Vec<Seat> {
        if self.io.redo.has_batched() {
            self.io.redo.flush_batched(commit);
        }
        std::mem::take(&mut self.batched)
    }

    /// Write batched change sets in a redo commit of their own.
    pub(crate) fn flush_batched_log(&mut self) {
        if self.batched.is_empty() && !self.io.redo.has_batched() {
            return;
        }
        let mut commit = self.commits.begin(CommitKind::Redo);
        let step: Step = commit.step;
        let seats = self.take_batched(&mut commit);
        tracing::debug!(step, seats = seats.len(), "batched log flushed");
        self.redo_waiting.insert(step, seats);
        self.send_commit(commit);
    }

    pub(crate) fn complete_seat(&mut self, mut seat: Seat, step: Option<Step>) {
        self.stats.tx_in_fly -= 1;
        self.stats.tx_completed += 1;
        let done = Completed {
            seat: seat.id,
            step,
            retries: seat.retries,
        };
        tracing::debug!(seat = %seat, step = ?step, retries = seat.retries, "transaction completed");
        seat.tx.complete(&done);
    }
}
