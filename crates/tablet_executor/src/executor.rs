//! The tablet executor.
//!
//! A single-owner state machine: every public method is one inbound message
//! (a new transaction, a cache result, a commit result, a timer). Work the
//! executor posts to itself is queued as a [`LocalEvent`] and drained before
//! the method returns, so callers never observe a half-processed message.
//!
//! The handlers are split by concern across `scheduler`, `commit`,
//! `part_switch` and `compaction`; this file holds the state they share,
//! page cache plumbing and the broken-tablet path.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tablet_common::config::ExecutorConfig;
use tablet_common::error::{BrokenReason, TabletResult};
use tablet_common::types::{CompactionId, FetchStatus, Label, ReadId, Step, TableId, TaskId, WaitPadId};

use crate::commit::{Barrier, BarrierTable, CommitManager, InFlyBarrier, LeaseState};
use crate::compaction::{CompactionOp, ReadState};
use crate::interfaces::{Collaborators, FetchKind, FetchRequest, FetchResult, SharedUpdate, TimerEvent};
use crate::memory::ResourceArbiter;
use crate::page_cache::PrivatePageCache;
use crate::part_switch::PendingSwitches;
use crate::parts::{LoadedPage, PageFetch, PartView};
use crate::seat::{MemoryToken, Seat};
use crate::stats::{ExecutorStats, ExecutorStatsSnapshot};

/// Work the executor schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalEvent {
    ActivateExecution,
    ActivateCompactionRead,
    ActivateCompactionChanges,
    BrokenTransaction,
}

/// What a wait pad unblocks.
#[derive(Debug)]
pub(crate) enum Waiter {
    Seat(Seat),
    Read(ReadId),
}

pub struct Executor {
    pub(crate) config: ExecutorConfig,
    pub(crate) io: Collaborators,
    pub(crate) cache: PrivatePageCache,
    pub(crate) memory: ResourceArbiter,
    pub(crate) commits: CommitManager,
    pub(crate) barriers: BarrierTable,
    pub(crate) lease: LeaseState,
    pub(crate) switches: PendingSwitches,
    pub(crate) stats: ExecutorStats,

    // ── Scheduling ──
    pub(crate) active: bool,
    /// A transaction failed commit validation; the tablet breaks on the next event.
    pub(crate) broken_transaction: Option<BrokenReason>,
    pub(crate) broken: Option<BrokenReason>,
    pub(crate) activation_queue: VecDeque<Seat>,
    pub(crate) pending_queue: VecDeque<Seat>,
    pub(crate) activate_in_flight: usize,
    pub(crate) next_seat: u64,
    pub(crate) wait_pads: HashMap<WaitPadId, Waiter>,
    /// Seats whose changes ride in the redo commit at the step.
    pub(crate) redo_waiting: BTreeMap<Step, Vec<Seat>>,
    /// Read-only seats completing behind the redo commit at the step.
    pub(crate) ro_waiting: BTreeMap<Step, Vec<Seat>>,
    /// Seats whose change sets are batched for the next redo commit.
    pub(crate) batched: Vec<Seat>,
    pub(crate) flush_scheduled: bool,

    // ── Barriers ──
    pub(crate) in_fly_barriers: BTreeMap<Step, InFlyBarrier>,
    pub(crate) snap_barriers: BTreeMap<Step, Vec<(TableId, Barrier)>>,
    pub(crate) followers_attached: bool,

    // ── Compaction ──
    pub(crate) compactions: HashMap<CompactionId, CompactionOp>,
    pub(crate) next_compaction: u64,
    pub(crate) reads: HashMap<ReadId, ReadState>,
    pub(crate) read_queue: VecDeque<ReadId>,
    pub(crate) read_activating: bool,
    pub(crate) changes_activating: bool,
    pub(crate) next_read: u64,

    pub(crate) events: VecDeque<LocalEvent>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, io: Collaborators) -> TabletResult<Self> {
        config.validate()?;
        let memory = ResourceArbiter::new(config.memory.static_limit);
        let commits = CommitManager::new(config.generation);
        Ok(Self {
            config,
            io,
            cache: PrivatePageCache::new(),
            memory,
            commits,
            barriers: BarrierTable::default(),
            lease: LeaseState::default(),
            switches: PendingSwitches::default(),
            stats: ExecutorStats::default(),
            active: false,
            broken_transaction: None,
            broken: None,
            activation_queue: VecDeque::new(),
            pending_queue: VecDeque::new(),
            activate_in_flight: 0,
            next_seat: 0,
            wait_pads: HashMap::new(),
            redo_waiting: BTreeMap::new(),
            ro_waiting: BTreeMap::new(),
            batched: Vec::new(),
            flush_scheduled: false,
            in_fly_barriers: BTreeMap::new(),
            snap_barriers: BTreeMap::new(),
            followers_attached: false,
            compactions: HashMap::new(),
            next_compaction: 0,
            reads: HashMap::new(),
            read_queue: VecDeque::new(),
            read_activating: false,
            changes_activating: false,
            next_read: 0,
            events: VecDeque::new(),
        })
    }

    /// Boot finished: start executing queued transactions.
    pub fn activate(&mut self) {
        if self.broken.is_some() || self.active {
            return;
        }
        self.active = true;
        tracing::info!(
            tablet = self.config.tablet_id,
            generation = self.config.generation,
            follower = self.config.follower,
            "executor active"
        );
        self.plan_transaction_activation();
        self.pump();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn broken_reason(&self) -> Option<&BrokenReason> {
        self.broken.as_ref()
    }

    pub fn cache(&self) -> &PrivatePageCache {
        &self.cache
    }

    /// Last log step issued.
    pub fn step(&self) -> Step {
        self.commits.step()
    }

    pub fn pending_part_switches(&self) -> usize {
        self.switches.len()
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot(
            self.cache.snapshot(),
            self.memory.snapshot(),
            self.switches.len() as u64,
            self.io.gc.introspect_state_size(),
        )
    }

    /// Own parts currently lent to other tablets.
    pub fn borrowed_parts(&self) -> Vec<Label> {
        self.io.borrow.borrowed_parts()
    }

    // ── Local events ───────────────────────────────────────────────────────

    pub(crate) fn post(&mut self, event: LocalEvent) {
        self.events.push_back(event);
    }

    /// Drain self-posted work.
    pub(crate) fn pump(&mut self) {
        while let Some(event) = self.events.pop_front() {
            if self.broken.is_some() {
                self.events.clear();
                return;
            }
            match event {
                LocalEvent::ActivateExecution => self.on_activate_execution(),
                LocalEvent::ActivateCompactionRead => self.on_activate_compaction_read(),
                LocalEvent::ActivateCompactionChanges => self.on_activate_compaction_changes(),
                LocalEvent::BrokenTransaction => {
                    if let Some(reason) = self.broken_transaction.take() {
                        self.become_broken(reason);
                    }
                }
            }
        }
    }

    pub fn on_timer(&mut self, event: TimerEvent) {
        if self.broken.is_some() {
            return;
        }
        match event {
            TimerEvent::LeaseExtend => self.on_lease_extend(),
            TimerEvent::FlushLog => {
                self.flush_scheduled = false;
                self.flush_batched_log();
            }
        }
        self.pump();
    }

    pub fn resource_allocated(&mut self, task: TaskId) {
        if self.broken.is_some() {
            return;
        }
        let Some(seat) = self.memory.resource_allocated(task) else {
            tracing::warn!(task = %task, "allocation for unknown task");
            return;
        };
        tracing::debug!(seat = %seat.id, task = %task, limit = seat.current_memory_limit, "memory granted");
        self.activation_queue.push_back(seat);
        self.plan_transaction_activation();
        self.pump();
    }

    /// Drop a captured memory grant nobody attached.
    pub fn release_memory_token(&mut self, token: MemoryToken) -> bool {
        self.memory.release_token(token, self.io.broker.as_mut())
    }

    // ── Page cache plumbing ────────────────────────────────────────────────

    /// Wake everything blocked on `pads`.
    pub(crate) fn activate_waiting(&mut self, pads: Vec<WaitPadId>) {
        let mut transactions = false;
        let mut reads = false;
        for pad in pads {
            match self.wait_pads.remove(&pad) {
                Some(Waiter::Seat(seat)) => {
                    self.activation_queue.push_back(seat);
                    transactions = true;
                }
                Some(Waiter::Read(id)) => {
                    self.read_queue.push_back(id);
                    reads = true;
                }
                None => {
                    self.become_broken(BrokenReason::UnknownWaitPad(pad));
                    return;
                }
            }
        }
        if transactions {
            self.plan_transaction_activation();
        }
        if reads {
            self.plan_compaction_read_activation();
        }
    }

    /// Shared cache answered a fetch we sent.
    pub fn on_fetch_result(&mut self, result: FetchResult) {
        if self.broken.is_some() {
            return;
        }
        match result.kind {
            FetchKind::Cache | FetchKind::CacheSync => self.on_cache_result(result),
            FetchKind::PendingInit => self.on_pending_init_result(result),
        }
        self.pump();
    }

    fn on_cache_result(&mut self, result: FetchResult) {
        if !self.cache.has_collection(&result.label) {
            tracing::debug!(label = %result.label, "fetch result for a forgotten collection");
            return;
        }
        if result.status != FetchStatus::Ok {
            if result.status == FetchStatus::NoData {
                self.stats.alerts_req_nodata += 1;
            }
            self.become_broken(BrokenReason::PageFetchFailed {
                label: result.label,
                status: result.status,
            });
            return;
        }
        for page in result.pages {
            let pads = self.cache.provide_page(&result.label, page);
            self.activate_waiting(pads);
            if self.broken.is_some() {
                return;
            }
        }
    }

    /// Another tablet asked us for pages of a collection we hold.
    pub fn on_shared_request(&mut self, requester: u64, request: FetchRequest) {
        if self.broken.is_some() {
            return;
        }
        let label = request.fetch.label;
        if !self.cache.has_collection(&label) {
            self.io.shared_cache.respond(
                requester,
                FetchResult {
                    label,
                    kind: request.kind,
                    status: FetchStatus::Race,
                    pages: Vec::new(),
                },
            );
            return;
        }

        let mut cached = Vec::new();
        let mut left = Vec::new();
        for &page in &request.fetch.pages {
            match self.cache.lookup(&label, page) {
                Some(body) => cached.push(LoadedPage { page, body }),
                None => left.push(page),
            }
        }
        if !cached.is_empty() {
            tracing::debug!(requester, label = %label, pages = cached.len(), "cache hit for shared request");
            self.io.shared_cache.respond(
                requester,
                FetchResult {
                    label,
                    kind: request.kind,
                    status: FetchStatus::Ok,
                    pages: cached,
                },
            );
        }
        if !left.is_empty() {
            tracing::debug!(requester, label = %label, pages = left.len(), "cache miss for shared request");
            self.io.shared_cache.forward(
                requester,
                FetchRequest {
                    priority: request.priority,
                    kind: request.kind,
                    fetch: PageFetch { label, pages: left },
                },
            );
        }
    }

    /// Shared cache accepted or evicted page bodies.
    pub fn on_shared_updated(&mut self, updates: BTreeMap<Label, SharedUpdate>) {
        if self.broken.is_some() {
            return;
        }
        for (label, update) in updates {
            if !self.cache.has_collection(&label) {
                tracing::warn!(label = %label, "shared update for unknown collection");
                continue;
            }
            for page in update.accepted {
                self.cache.update_shared_body(&label, page);
            }
            for page in update.dropped {
                self.cache.drop_shared_body(&label, page);
            }
        }
    }

    /// Forget a collection whose part left the table.
    pub(crate) fn drop_single_cache(&mut self, label: Label) {
        let pads = self.cache.forget_collection(&label);
        self.activate_waiting(pads);
        if !self.cache.has_collection(&label) {
            self.io.shared_cache.invalidate(label);
        }
    }

    pub(crate) fn add_single_cache(&mut self, label: Label, page_count: u32, page_size: u64) {
        self.cache.register_collection(label, page_count, page_size);
        self.io.shared_cache.attach(label, page_count);
    }

    /// Register the page collections of parts restored at boot.
    pub fn attach_boot_parts(&mut self, table: TableId, parts: &[PartView]) {
        for part in parts {
            self.add_single_cache(part.label, part.page_count, part.page_size);
            self.request_in_mem_pages(table, part);
        }
        tracing::debug!(table = %table, parts = parts.len(), "boot parts attached");
    }

    // ── Broken tablet ──────────────────────────────────────────────────────

    /// Stop for good. The owner is told once; every parked consumer is
    /// dropped and later messages are ignored.
    pub(crate) fn become_broken(&mut self, reason: BrokenReason) {
        if self.broken.is_some() {
            return;
        }
        tracing::error!(tablet = self.config.tablet_id, reason = %reason, "executor broken");
        self.broken = Some(reason.clone());
        self.active = false;
        self.events.clear();

        let mut seats: Vec<Seat> = self.activation_queue.drain(..).collect();
        seats.extend(self.pending_queue.drain(..));
        seats.extend(self.batched.drain(..));
        seats.extend(std::mem::take(&mut self.redo_waiting).into_values().flatten());
        seats.extend(std::mem::take(&mut self.ro_waiting).into_values().flatten());
        for (_, waiter) in self.wait_pads.drain() {
            if let Waiter::Seat(seat) = waiter {
                seats.push(seat);
            }
        }
        seats.extend(self.memory.cancel_all(self.io.broker.as_mut()));
        tracing::debug!(seats = seats.len(), "dropping seats of broken executor");
        self.stats.tx_in_fly = self.stats.tx_in_fly.saturating_sub(seats.len() as u64);
        self.stats.tx_pending = 0;
        for mut seat in seats {
            self.unpin_seat(&mut seat);
            self.memory.free_static(&mut seat, 0);
        }

        self.release_compactions();
        self.release_commit_barriers();
        self.io.shared_cache.unregister();

        self.io.owner.on_broken(&reason);
        self.io.owner.detach();
    }
}
