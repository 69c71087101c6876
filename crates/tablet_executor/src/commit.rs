//! Commit/step coordinator.
//!
//! Every durable write of the executor is a [`LogCommit`] stamped with the
//! next log step. Steps are confirmed by the log writer out of the
//! executor's control; confirmation retires redo seats, releases GC
//! barriers and extends the read-only lease.
//!
//! GC barriers are reference counted per step. The first holder at a step
//! also makes the GC logic hold it, so an entry with one reference left is
//! only kept alive by GC and is released there.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tablet_common::error::{BrokenReason, TabletError, TabletResult};
use tablet_common::types::{BlobId, FetchStatus, Step, TableId};

use crate::executor::Executor;
use crate::interfaces::{CollectGarbageResult, GcLogic, TimerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommitKind {
    /// Transaction change sets.
    Redo,
    /// Full log snapshot.
    Snap,
    /// Compaction results.
    Data,
    /// Leases and strategy state.
    Misc,
}

impl CommitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitKind::Redo => "redo",
            CommitKind::Snap => "snap",
            CommitKind::Data => "data",
            CommitKind::Misc => "misc",
        }
    }
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMeta {
    LeaseInfo { duration_ms: u64 },
}

/// Blobs created and deleted by one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcDelta {
    pub created: Vec<BlobId>,
    pub deleted: Vec<BlobId>,
}

impl GcDelta {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogCommit {
    pub generation: u32,
    pub step: Step,
    pub kind: CommitKind,
    pub redo: Vec<u8>,
    /// Encoded part switch records.
    pub switches: Vec<Vec<u8>>,
    pub metadata: Vec<CommitMeta>,
    pub gc_delta: GcDelta,
    /// Followers must confirm they dropped references to deleted blobs.
    pub wait_follower_gc_ack: bool,
}

// ── Commit manager ─────────────────────────────────────────────────────────

pub struct CommitManager {
    generation: u32,
    step: Step,
    in_flight: BTreeMap<Step, CommitKind>,
}

impl CommitManager {
    pub fn new(generation: u32) -> Self {
        Self {
            generation,
            step: 0,
            in_flight: BTreeMap::new(),
        }
    }

    /// Last step handed out.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Start a commit at the next step. The step is consumed even if the
    /// commit turns out empty.
    pub fn begin(&mut self, kind: CommitKind) -> LogCommit {
        self.step += 1;
        LogCommit {
            generation: self.generation,
            step: self.step,
            kind,
            redo: Vec::new(),
            switches: Vec::new(),
            metadata: Vec::new(),
            gc_delta: GcDelta::default(),
            wait_follower_gc_ack: false,
        }
    }

    /// Register the commit as in flight.
    pub fn track(&mut self, commit: &LogCommit) {
        self.in_flight.insert(commit.step, commit.kind);
    }

    pub fn confirm(&mut self, step: Step) -> Option<CommitKind> {
        self.in_flight.remove(&step)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, step: Step) -> bool {
        self.in_flight.contains_key(&step)
    }
}

// ── GC barriers ────────────────────────────────────────────────────────────

/// One reference to a GC barrier. Dropped only through [`BarrierTable::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Barrier {
    step: Step,
}

impl Barrier {
    pub fn step(&self) -> Step {
        self.step
    }
}

#[derive(Debug, Default)]
pub struct BarrierTable {
    refs: BTreeMap<Step, u32>,
}

impl BarrierTable {
    pub fn acquire(&mut self, step: Step, gc: &mut dyn GcLogic) -> Barrier {
        let refs = self.refs.entry(step).or_insert(0);
        if *refs == 0 {
            *refs = 2;
            gc.hold_barrier(step);
        } else {
            *refs += 1;
        }
        Barrier { step }
    }

    /// Returns true when the barrier left GC as well.
    pub fn release(&mut self, barrier: Barrier, gc: &mut dyn GcLogic) -> bool {
        let step = barrier.step;
        let Some(refs) = self.refs.get_mut(&step) else {
            tracing::error!(step, "release of unknown gc barrier");
            return false;
        };
        *refs -= 1;
        if *refs > 1 {
            return false;
        }
        self.refs.remove(&step);
        gc.release_barrier(step);
        true
    }

    /// References at `step`, including the one held for GC.
    pub fn refs(&self, step: Step) -> u32 {
        self.refs.get(&step).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Barrier waiting for its commit and for the followers.
#[derive(Debug)]
pub(crate) struct InFlyBarrier {
    pub(crate) barrier: Barrier,
    pub(crate) confirmed: bool,
    pub(crate) gc_acked: bool,
}

impl InFlyBarrier {
    pub(crate) fn new(barrier: Barrier) -> Self {
        Self {
            barrier,
            confirmed: false,
            gc_acked: false,
        }
    }

    fn releasable(&self) -> bool {
        self.confirmed && self.gc_acked
    }
}

// ── Read-only lease ────────────────────────────────────────────────────────

pub type LeaseCallback = Box<dyn FnOnce()>;

pub struct LeaseCommit {
    pub step: Step,
    pub start: Duration,
    pub lease_end: Duration,
    callbacks: Vec<LeaseCallback>,
}

impl fmt::Debug for LeaseCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCommit")
            .field("step", &self.step)
            .field("start", &self.start)
            .field("lease_end", &self.lease_end)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct LeaseState {
    pub enabled: bool,
    pub dropped: bool,
    pub persisted: bool,
    /// Someone confirmed a lease since the last extension.
    pub used: bool,
    pub extend_pending: bool,
    pub duration: Duration,
    pub lease_end: Duration,
    pub unused_extensions: u32,
    commits: VecDeque<LeaseCommit>,
}

impl LeaseState {
    /// Oldest of the newest in-flight lease commits that all cover `at`.
    fn covering(&self, at: Duration) -> Option<usize> {
        let mut found = None;
        for (index, commit) in self.commits.iter().enumerate().rev() {
            if at < commit.lease_end {
                found = Some(index);
            } else {
                break;
            }
        }
        found
    }

    pub fn in_flight(&self) -> usize {
        self.commits.len()
    }

    pub fn front_step(&self) -> Option<Step> {
        self.commits.front().map(|c| c.step)
    }
}

// ── Executor: commit results, barriers, leases ─────────────────────────────

impl Executor {
    pub(crate) fn send_commit(&mut self, commit: LogCommit) {
        self.commits.track(&commit);
        match commit.kind {
            CommitKind::Redo => self.stats.commits_redo += 1,
            CommitKind::Snap => self.stats.commits_snap += 1,
            CommitKind::Data => self.stats.commits_data += 1,
            CommitKind::Misc => self.stats.commits_misc += 1,
        }
        tracing::debug!(step = commit.step, kind = %commit.kind, switches = commit.switches.len(), "commit sent");
        self.io.log.send(commit);
    }

    /// Durable log writer answered for `step`.
    pub fn on_commit_result(&mut self, step: Step, status: FetchStatus) {
        if self.broken.is_some() {
            return;
        }
        if status != FetchStatus::Ok {
            self.become_broken(BrokenReason::CommitFailed { step });
            return;
        }

        self.io.gc.on_commit_log(step);
        let Some(kind) = self.commits.confirm(step) else {
            tracing::warn!(step, "commit result for a step not in flight");
            return;
        };
        self.stats.commits_confirmed += 1;
        tracing::debug!(step, kind = %kind, "commit confirmed");

        self.confirm_lease_commit(step);

        match kind {
            CommitKind::Redo => {
                let written = self.redo_waiting.remove(&step).unwrap_or_default();
                let read_only = self.ro_waiting.remove(&step).unwrap_or_default();
                self.io.redo.confirm(step);
                for seat in written {
                    self.complete_seat(seat, Some(step));
                }
                for seat in read_only {
                    self.complete_seat(seat, None);
                }
                if let Some(snapshots) = self.snap_barriers.remove(&step) {
                    for (table, barrier) in snapshots {
                        self.release_barrier(barrier);
                        self.io.owner.snapshot_complete(table, step);
                    }
                }
            }
            CommitKind::Snap => self.io.redo.confirm_snap(step),
            CommitKind::Data | CommitKind::Misc => {}
        }

        if let Some(in_fly) = self.in_fly_barriers.get_mut(&step) {
            in_fly.confirmed = true;
            if !self.followers_attached {
                in_fly.gc_acked = true;
            }
        }
        self.check_in_fly_barrier(step);
        self.plan_transaction_activation();
        self.pump();
    }

    fn confirm_lease_commit(&mut self, step: Step) {
        if self.lease.front_step() != Some(step) {
            return;
        }
        let Some(commit) = self.lease.commits.pop_front() else {
            return;
        };
        self.lease.persisted = true;
        self.lease.lease_end = self.lease.lease_end.max(commit.lease_end);
        for callback in commit.callbacks {
            callback();
        }

        let now = self.io.timers.now();
        if self.lease.lease_end.saturating_sub(now) < self.lease.duration / 3 {
            self.lease.duration *= 2;
            tracing::debug!(duration_ms = self.lease.duration.as_millis() as u64, "lease duration doubled");
        }
        if self.lease.commits.is_empty() && !self.lease.extend_pending {
            let at = self.lease.lease_end.saturating_sub(self.lease.duration / 3);
            self.io.timers.schedule(at, TimerEvent::LeaseExtend);
            self.lease.extend_pending = true;
        }
    }

    pub(crate) fn release_barrier(&mut self, barrier: Barrier) {
        if self.barriers.release(barrier, self.io.gc.as_mut()) {
            let active = self.io.gc.active_barrier();
            if self.io.borrow.set_gc_barrier(active) {
                self.io.owner.completed_loans_changed();
            }
        }
    }

    /// Hand every barrier still held by commits back to GC.
    pub(crate) fn release_commit_barriers(&mut self) {
        for (_, in_fly) in std::mem::take(&mut self.in_fly_barriers) {
            self.barriers.release(in_fly.barrier, self.io.gc.as_mut());
        }
        for (_, snapshots) in std::mem::take(&mut self.snap_barriers) {
            for (_, barrier) in snapshots {
                self.barriers.release(barrier, self.io.gc.as_mut());
            }
        }
    }

    fn check_in_fly_barrier(&mut self, step: Step) {
        let releasable = self
            .in_fly_barriers
            .get(&step)
            .is_some_and(|b| b.releasable());
        if !releasable {
            return;
        }
        if let Some(in_fly) = self.in_fly_barriers.remove(&step) {
            self.release_barrier(in_fly.barrier);
        }
    }

    /// A follower is attached: deletions must wait for its GC ack.
    pub fn follower_attached(&mut self) {
        self.followers_attached = true;
    }

    /// The last follower went away. Confirmed barriers waiting only for a
    /// follower ack are released.
    pub fn followers_detached(&mut self) {
        self.followers_attached = false;
        let steps: Vec<Step> = self
            .in_fly_barriers
            .iter_mut()
            .filter(|(_, b)| b.confirmed)
            .map(|(step, b)| {
                b.gc_acked = true;
                *step
            })
            .collect();
        for step in steps {
            self.check_in_fly_barrier(step);
        }
    }

    /// Followers applied the part switch written at `step`.
    pub fn follower_gc_applied(&mut self, step: Step) {
        if self.broken.is_some() {
            return;
        }
        let Some(in_fly) = self.in_fly_barriers.get_mut(&step) else {
            self.become_broken(BrokenReason::UnknownBarrier { step });
            return;
        };
        in_fly.gc_acked = true;
        self.check_in_fly_barrier(step);
        self.pump();
    }

    pub fn on_collect_garbage_result(&mut self, result: CollectGarbageResult) {
        if self.broken.is_some() {
            return;
        }
        self.io.gc.on_collect_garbage_result(result);
    }

    // ── Leases ─────────────────────────────────────────────────────────────

    fn check_lease_allowed(&self) -> TabletResult<()> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        if self.config.follower {
            return Err(TabletError::Role("read-only leases are leader only"));
        }
        Ok(())
    }

    /// Make sure a lease covering `at` is (or will be) persisted. Returns
    /// the step of the lease commit that covers it.
    pub fn ensure_read_only_lease(&mut self, at: Duration) -> TabletResult<Step> {
        self.check_lease_allowed()?;
        let step = self.ensure_lease(at).ok_or(TabletError::LeaseDropped)?;
        self.pump();
        Ok(step)
    }

    fn ensure_lease(&mut self, at: Duration) -> Option<Step> {
        let at = at.max(self.lease.lease_end);
        if !self.lease.enabled {
            self.lease.enabled = true;
            self.lease.duration = Duration::from_millis(self.config.lease.initial_duration_ms);
        }
        if let Some(index) = self.lease.covering(at) {
            return Some(self.lease.commits[index].step);
        }
        if self.lease.dropped {
            return None;
        }

        self.flush_batched_log();
        let mut commit = self.commits.begin(CommitKind::Misc);
        commit.metadata.push(CommitMeta::LeaseInfo {
            duration_ms: self.lease.duration.as_millis() as u64,
        });
        let now = self.io.timers.now();
        let step = commit.step;
        self.lease.commits.push_back(LeaseCommit {
            step,
            start: now,
            lease_end: now + self.lease.duration,
            callbacks: Vec::new(),
        });
        self.stats.lease_commits += 1;
        self.send_commit(commit);
        Some(step)
    }

    /// Read-only work at `at` relies on the lease.
    pub fn confirm_read_only_lease(&mut self, at: Duration) -> TabletResult<()> {
        self.check_lease_allowed()?;
        self.lease.used = true;
        if self.lease.enabled && at < self.lease.lease_end {
            return Ok(());
        }
        self.ensure_lease(at);
        self.pump();
        Ok(())
    }

    /// Like [`Executor::confirm_read_only_lease`], calling `callback` once
    /// the lease covering `at` is persisted. Callbacks of one lease commit
    /// run in registration order. After the lease was dropped, callbacks
    /// that need a new commit are discarded.
    pub fn confirm_read_only_lease_with(
        &mut self,
        at: Duration,
        callback: LeaseCallback,
    ) -> TabletResult<()> {
        self.check_lease_allowed()?;
        self.lease.used = true;
        if self.lease.enabled && at < self.lease.lease_end {
            callback();
            return Ok(());
        }
        if let Some(step) = self.ensure_lease(at) {
            if let Some(commit) = self.lease.commits.iter_mut().find(|c| c.step == step) {
                commit.callbacks.push(callback);
            }
        }
        self.pump();
        Ok(())
    }

    pub(crate) fn on_lease_extend(&mut self) {
        self.lease.extend_pending = false;
        if !self.lease.commits.is_empty() || !self.lease.enabled || self.lease.dropped {
            return;
        }
        if self.lease.used {
            self.lease.used = false;
            self.lease.unused_extensions = 0;
        } else if self.lease.unused_extensions >= self.config.lease.max_unused_extensions {
            tracing::debug!(unused = self.lease.unused_extensions, "lease extension stopped");
            return;
        } else {
            self.lease.unused_extensions += 1;
        }
        self.stats.lease_extensions += 1;
        let at = self.lease.lease_end;
        self.ensure_lease(at);
    }

    /// Stop promising reads. Lease ends are clamped to now.
    pub fn drop_lease(&mut self) {
        let now = self.io.timers.now();
        self.lease.dropped = true;
        self.lease.lease_end = self.lease.lease_end.min(now);
        for commit in self.lease.commits.iter_mut() {
            commit.lease_end = commit.lease_end.min(now);
        }
        self.io.owner.lease_dropped();
    }

    pub fn lease(&self) -> &LeaseState {
        &self.lease
    }

    // ── Snapshots ──────────────────────────────────────────────────────────

    /// Write a full log snapshot. Skipped while part switches are pending or
    /// when the redo logic has nothing to fold.
    pub fn make_log_snapshot(&mut self) -> Option<Step> {
        if self.broken.is_some() || self.config.follower {
            return None;
        }
        if !self.switches.is_empty() || !self.io.redo.may_flush_snapshot() {
            return None;
        }
        self.flush_batched_log();
        let mut commit = self.commits.begin(CommitKind::Snap);
        self.io.redo.snap_to_log(&mut commit);
        self.io.gc.snap_to_log(&mut commit);
        let step = commit.step;
        if self.lease.enabled && !self.lease.dropped {
            commit.metadata.push(CommitMeta::LeaseInfo {
                duration_ms: self.lease.duration.as_millis() as u64,
            });
            let now = self.io.timers.now();
            self.lease.commits.push_back(LeaseCommit {
                step,
                start: now,
                lease_end: now + self.lease.duration,
                callbacks: Vec::new(),
            });
            self.stats.lease_commits += 1;
        }
        tracing::info!(step, "log snapshot");
        self.send_commit(commit);
        self.pump();
        Some(step)
    }

    /// Snapshot barrier for `table`, released when the redo commit at `step`
    /// is durable.
    pub(crate) fn hold_snapshot(&mut self, table: TableId, step: Step) {
        let barrier = self.barriers.acquire(step, self.io.gc.as_mut());
        self.snap_barriers
            .entry(step)
            .or_default()
            .push((table, barrier));
    }
}
