//! Compaction result integrator and compaction reads.
//!
//! A compaction runs outside the executor on a subset snapshot taken by
//! [`Executor::prepare_compaction`]. The snapshot holds a GC barrier at the
//! step it was taken and locks the subset's page collections. The result
//! is folded back in a single `Data` commit carrying the part switch record
//! followers replay; the barrier then moves to that commit and is released
//! once it is durable and acknowledged by followers.
//!
//! Compaction reads are page-level readers driven like transactions: they
//! run against the private cache, pin what they touched, and are re-run
//! once the missing pages arrive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tablet_common::error::{BrokenReason, TabletError, TabletResult};
use tablet_common::types::{
    BlobId, CompactionId, Epoch, Label, PageId, ReadId, Step, TableId,
};

use crate::commit::{Barrier, CommitKind, InFlyBarrier, LogCommit};
use crate::executor::{Executor, LocalEvent, Waiter};
use crate::interfaces::{CompactionChanges, FetchKind, FetchRequest, Priority};
use crate::page_cache::PrivatePageCache;
use crate::parts::{
    replace_slices, PageFetch, PartComponents, PartView, Slice, Subset, TxStatusComponents,
    TxStatusPart,
};
use crate::seat::PageEnv;
use crate::wire::{
    bundle_change, encode_change_slices, encode_remove_slices, BundleDelta, CompactionStateChanges,
    IntroducedBundle, Overlay, PartSwitchRecord, TableSnapshoted,
};

/// Tx status parts up to this size travel inline in the switch record.
pub const INLINE_TX_STATUS_LIMIT: usize = 131_072;

/// What the compaction scan receives.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionTicket {
    pub id: CompactionId,
    pub table: TableId,
    pub subset: Subset,
}

/// A part produced by compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactedPart {
    pub view: PartView,
    /// Blobs a follower reads to open the part.
    pub meta_blobs: Vec<BlobId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Done {
        parts: Vec<CompactedPart>,
        tx_status: Vec<TxStatusPart>,
    },
    Failed,
    Cancelled,
}

impl CompactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionOutcome::Done { .. } => "done",
            CompactionOutcome::Failed => "failed",
            CompactionOutcome::Cancelled => "cancelled",
        }
    }
}

pub(crate) struct CompactionOp {
    table: TableId,
    subset: Subset,
    barrier: Barrier,
}

// ── Compaction reads ───────────────────────────────────────────────────────

/// Page-level reader run by the executor until it finishes.
pub trait CompactionRead {
    /// Returns false when some page was missing.
    fn execute(&mut self, env: &mut ReadEnv<'_>) -> bool;
}

pub struct ReadEnv<'a> {
    cache: &'a PrivatePageCache,
    pages: PageEnv,
}

impl<'a> ReadEnv<'a> {
    fn new(cache: &'a PrivatePageCache) -> Self {
        Self {
            cache,
            pages: PageEnv::default(),
        }
    }

    pub fn page(&mut self, label: Label, page: PageId) -> Option<Arc<[u8]>> {
        self.pages.lookup(self.cache, label, page)
    }
}

pub(crate) struct ReadState {
    read: Box<dyn CompactionRead>,
    retries: u32,
    pinned: BTreeMap<Label, BTreeSet<PageId>>,
}

fn run_read(cache: &PrivatePageCache, read: &mut dyn CompactionRead) -> (bool, PageEnv) {
    let mut env = ReadEnv::new(cache);
    let finished = read.execute(&mut env);
    (finished, env.pages)
}

fn corrupted(err: TabletError) -> BrokenReason {
    BrokenReason::Corrupted(err.to_string())
}

impl Executor {
    // ── Compaction lifecycle ───────────────────────────────────────────────

    /// Snapshot the parts of `table` for a compaction scan.
    pub fn prepare_compaction(&mut self, table: TableId) -> TabletResult<CompactionTicket> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        if self.config.follower {
            return Err(TabletError::Role("compaction is leader only"));
        }
        if !self.io.database.table_exists(table) {
            return Err(TabletError::UnknownTable(table));
        }

        let head = self.io.database.head(table);
        let subset = self.io.database.subset(table, head);
        let barrier = self
            .barriers
            .acquire(self.commits.step(), self.io.gc.as_mut());
        for part in &subset.flatten {
            self.cache.lock_collection(&part.label);
        }

        self.next_compaction += 1;
        let id = CompactionId(self.next_compaction);
        tracing::debug!(compaction = %id, table = %table, parts = subset.flatten.len(), head = %subset.head, "compaction prepared");
        self.compactions.insert(
            id,
            CompactionOp {
                table,
                subset: subset.clone(),
                barrier,
            },
        );
        Ok(CompactionTicket { id, table, subset })
    }

    /// Ask the strategy to schedule a forced compaction of `table`.
    pub fn force_compaction(&mut self, table: TableId) -> TabletResult<bool> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        if !self.io.database.table_exists(table) {
            return Err(TabletError::UnknownTable(table));
        }
        Ok(self.io.compaction.prepare_force_compaction(table))
    }

    pub fn on_compaction_result(
        &mut self,
        id: CompactionId,
        outcome: CompactionOutcome,
    ) -> TabletResult<()> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        let op = self
            .compactions
            .remove(&id)
            .ok_or(TabletError::UnknownCompaction(id))?;
        let table = op.table;
        let exists = self.io.database.table_exists(table);
        let abandoned = !exists || matches!(outcome, CompactionOutcome::Cancelled);
        tracing::info!(compaction = %id, table = %table, head = %op.subset.head, outcome = outcome.as_str(), abandoned, "compaction finished");

        match outcome {
            _ if abandoned => {
                if exists {
                    self.io.compaction.cancelled_compaction(id, table);
                }
                self.stats.compactions_cancelled += 1;
                self.release_barrier(op.barrier);
                self.unlock_subset(&op.subset);
            }
            CompactionOutcome::Failed => {
                self.release_barrier(op.barrier);
                self.unlock_subset(&op.subset);
                self.become_broken(BrokenReason::CompactionFailed { table });
            }
            CompactionOutcome::Done { parts, tx_status } => {
                if let Err(reason) = self.integrate_compaction(id, op, parts, tx_status) {
                    self.become_broken(reason);
                }
            }
            CompactionOutcome::Cancelled => {}
        }

        self.plan_transaction_activation();
        self.pump();
        Ok(())
    }

    fn integrate_compaction(
        &mut self,
        id: CompactionId,
        op: CompactionOp,
        parts: Vec<CompactedPart>,
        tx_status: Vec<TxStatusPart>,
    ) -> Result<(), BrokenReason> {
        let CompactionOp {
            table,
            subset,
            barrier,
        } = op;

        self.flush_batched_log();
        let mut commit = self.commits.begin(CommitKind::Data);
        commit.wait_follower_gc_ack = true;
        let step = commit.step;

        let mut record = PartSwitchRecord::new(table);
        if subset.head > Epoch::zero() {
            self.io
                .redo
                .cut_log(table, step, subset.head, &mut commit.gc_delta);
            record.table_snapshoted = Some(TableSnapshoted {
                table,
                generation: self.config.generation,
                step,
                head: subset.head,
            });
        }

        for part in &parts {
            self.add_single_cache(part.view.label, part.view.page_count, part.view.page_size);
            commit.gc_delta.created.extend(part.view.blobs.iter().copied());
        }
        for part in &tx_status {
            commit.gc_delta.created.extend(part.blobs.iter().copied());
        }

        let mut views: Vec<PartView> = parts.iter().map(|p| p.view.clone()).collect();
        self.io.database.replace(table, views.clone(), &subset);
        self.io
            .database
            .replace_tx_status(table, tx_status.clone(), &subset);

        let updated = self.io.database.lookup_slices(table, &subset.labels());
        self.utilize_subset(&subset, &updated, &mut commit);

        let write_deltas = self.config.compaction.write_bundle_deltas;
        for gone in &subset.flatten {
            match updated.get(&gone.label) {
                Some(_) if write_deltas => record.bundle_deltas.push(BundleDelta {
                    label: gone.label,
                    delta: encode_remove_slices(&gone.slices).map_err(corrupted)?,
                }),
                Some(found) => record
                    .changed_bundles
                    .push(bundle_change(gone.label, found).map_err(corrupted)?),
                None => record.leaving_bundles.push(gone.label),
            }
        }
        record
            .leaving_bundles
            .extend(subset.cold.iter().map(|p| p.label));
        record
            .leaving_tx_status
            .extend(subset.tx_status.iter().map(|p| p.label));

        let logic = self.io.compaction.complete_compaction(id, table, &views);
        self.apply_compaction_changes(&mut record, &logic.changes, logic.strategy, &mut views)?;

        for (part, view) in parts.iter().zip(&views) {
            let overlay = Overlay::new(view.slices.clone());
            record.introduced_parts.push(IntroducedBundle {
                components: PartComponents {
                    label: view.label,
                    epoch: view.epoch,
                    meta_blobs: part.meta_blobs.clone(),
                    legacy: overlay.encode_legacy().map_err(corrupted)?,
                    opaque: overlay.encode_opaque().map_err(corrupted)?,
                },
                level: logic.changes.new_parts_level,
            });
        }
        for part in &tx_status {
            record.introduced_tx_status.push(TxStatusComponents {
                label: part.label,
                epoch: part.epoch,
                blobs: part.blobs.clone(),
                data: (part.data.len() <= INLINE_TX_STATUS_LIMIT).then(|| part.data.clone()),
            });
        }
        commit.switches.push(record.encode().map_err(corrupted)?);

        self.in_fly_barriers.insert(step, InFlyBarrier::new(barrier));
        self.unlock_subset(&subset);
        tracing::info!(
            compaction = %id,
            table = %table,
            step,
            parts = views.len(),
            leaving = record.leaving_bundles.len(),
            deltas = record.bundle_deltas.len(),
            changed = record.changed_bundles.len(),
            "compaction integrated"
        );
        self.send_commit(commit);
        self.stats.compactions_integrated += 1;

        if logic.mem_compacted {
            let mem_size = self.io.database.table_mem_size(table);
            self.io.compaction.update_in_mem_stats(table, 0, mem_size);
        }
        for snapshot in logic.completed_snapshots {
            self.io.owner.snapshot_complete(table, snapshot);
        }
        self.io.owner.compaction_complete(table);

        if self.io.redo.may_flush_snapshot() {
            self.make_log_snapshot();
        }
        Ok(())
    }

    /// Hand consumed parts to the borrow logic and schedule deletion of the
    /// blobs it releases. Parts with surviving slices stay.
    fn utilize_subset(
        &mut self,
        subset: &Subset,
        updated: &BTreeMap<Label, Vec<Slice>>,
        commit: &mut LogCommit,
    ) {
        for part in &subset.flatten {
            if updated.contains_key(&part.label) {
                continue;
            }
            if self.io.borrow.bundle_compacted(part.label, commit) {
                commit.gc_delta.deleted.extend(part.blobs.iter().copied());
            }
            self.drop_single_cache(part.label);
        }
        for part in &subset.cold {
            self.io.borrow.bundle_compacted(part.label, commit);
        }
        for part in &subset.tx_status {
            if self.io.borrow.bundle_compacted(part.label, commit) {
                commit.gc_delta.deleted.extend(part.blobs.iter().copied());
            }
        }
    }

    fn unlock_subset(&mut self, subset: &Subset) {
        for part in &subset.flatten {
            if let Some(pads) = self.cache.unlock_collection(&part.label) {
                self.io.shared_cache.invalidate(part.label);
                self.activate_waiting(pads);
            }
        }
    }

    /// Fold strategy changes into `record` and the database. `results` are
    /// the parts of the compaction being integrated, if any: their slices are
    /// updated in place instead of being written as changes.
    pub(crate) fn apply_compaction_changes(
        &mut self,
        record: &mut PartSwitchRecord,
        changes: &CompactionChanges,
        strategy: u32,
        results: &mut [PartView],
    ) -> Result<(), BrokenReason> {
        let table = record.table;
        if !changes.state_changes.is_empty() {
            record.compaction_changes = Some(CompactionStateChanges {
                table,
                strategy,
                key_values: changes
                    .state_changes
                    .iter()
                    .map(|(k, v)| (*k, v.clone()))
                    .collect(),
            });
        }
        if changes.slice_changes.is_empty() {
            return Ok(());
        }

        let labels: Vec<Label> = changes.slice_changes.iter().map(|c| c.label).collect();
        let mut pending = self.io.database.lookup_slices(table, &labels);
        let write_deltas = self.config.compaction.write_bundle_deltas;

        for change in &changes.slice_changes {
            let Some(current) = pending.get_mut(&change.label) else {
                return Err(BrokenReason::MissingSlices {
                    table,
                    label: change.label,
                });
            };
            *current = replace_slices(current, &change.new_slices);
            if let Some(result) = results.iter_mut().find(|p| p.label == change.label) {
                result.slices = current.clone();
            } else if write_deltas {
                record.bundle_deltas.push(BundleDelta {
                    label: change.label,
                    delta: encode_change_slices(&change.new_slices).map_err(corrupted)?,
                });
            }
        }

        if !write_deltas {
            for (label, slices) in &pending {
                if results.iter().any(|p| p.label == *label) {
                    continue;
                }
                let change = bundle_change(*label, slices).map_err(corrupted)?;
                match record.changed_bundles.iter_mut().find(|c| c.label == *label) {
                    Some(existing) => *existing = change,
                    None => record.changed_bundles.push(change),
                }
            }
        }
        self.io.database.replace_slices(table, pending);
        Ok(())
    }

    /// Persist strategy changes made outside a compaction.
    pub(crate) fn commit_compaction_changes(
        &mut self,
        table: TableId,
        changes: CompactionChanges,
        strategy: u32,
    ) -> Option<Step> {
        if changes.is_empty() {
            return None;
        }
        self.flush_batched_log();
        let mut commit = self.commits.begin(CommitKind::Misc);
        let mut record = PartSwitchRecord::new(table);
        let encoded = self
            .apply_compaction_changes(&mut record, &changes, strategy, &mut [])
            .and_then(|()| record.encode().map_err(corrupted));
        match encoded {
            Ok(bytes) => commit.switches.push(bytes),
            Err(reason) => {
                self.become_broken(reason);
                return None;
            }
        }
        let step = commit.step;
        self.send_commit(commit);
        Some(step)
    }

    /// The strategy has changes for `table` it wants persisted.
    pub fn request_changes(&mut self, table: TableId) -> TabletResult<()> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        self.io.compaction.request_changes(table);
        if !self.changes_activating {
            self.changes_activating = true;
            self.post(LocalEvent::ActivateCompactionChanges);
        }
        self.pump();
        Ok(())
    }

    pub(crate) fn on_activate_compaction_changes(&mut self) {
        self.changes_activating = false;
        for (table, changes, strategy) in self.io.compaction.apply_changes() {
            self.commit_compaction_changes(table, changes, strategy);
            if self.broken.is_some() {
                return;
            }
        }
    }

    // ── Compaction reads ───────────────────────────────────────────────────

    /// Run `read` now. Returns `ReadId(0)` when it finished right away;
    /// otherwise it is re-run as its pages arrive.
    pub fn begin_read(&mut self, mut read: Box<dyn CompactionRead>) -> TabletResult<ReadId> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        self.stats.compaction_reads += 1;
        let (finished, pages) = run_read(&self.cache, read.as_mut());
        if finished {
            return Ok(ReadId(0));
        }

        self.next_read += 1;
        let id = ReadId(self.next_read);
        let mut state = ReadState {
            read,
            retries: 0,
            pinned: BTreeMap::new(),
        };
        self.postpone_compaction_read(id, &mut state, pages);
        if self.broken.is_none() {
            self.reads.insert(id, state);
        }
        self.pump();
        Ok(id)
    }

    /// Drop a postponed read and its pins. Returns false for unknown ids.
    pub fn cancel_read(&mut self, id: ReadId) -> bool {
        match self.reads.remove(&id) {
            Some(mut state) => {
                self.unpin_read_pages(&mut state.pinned);
                tracing::debug!(read = %id, retries = state.retries, "compaction read cancelled");
                true
            }
            None => false,
        }
    }

    /// Re-pin what the last attempt touched, drop older pins, and load the
    /// missing pages.
    fn postpone_compaction_read(&mut self, id: ReadId, state: &mut ReadState, pages: PageEnv) {
        if !pages.has_to_load() {
            self.become_broken(BrokenReason::ReadWithoutDemands { read: id });
            return;
        }

        let mut pinned: BTreeMap<Label, BTreeSet<PageId>> = BTreeMap::new();
        let mut new_pins = 0usize;
        for (label, touched) in pages.touches.iter().chain(pages.to_load.iter()) {
            for &page in touched {
                let kept = state
                    .pinned
                    .get_mut(label)
                    .is_some_and(|old| old.remove(&page));
                let fresh = pinned.entry(*label).or_default().insert(page);
                if !kept && fresh {
                    self.cache.pin(label, page);
                    new_pins += 1;
                }
            }
        }
        let unpinned = self.unpin_read_pages(&mut state.pinned);
        state.pinned = pinned;

        let pad = self.cache.new_pad();
        let mut load_pages = 0u64;
        let mut load_bytes = 0u64;
        for (label, wanted) in &pages.to_load {
            let wanted: Vec<PageId> = wanted.iter().copied().collect();
            let (requested, bytes) = self.cache.load(label, &wanted, Some(pad));
            if requested.is_empty() {
                continue;
            }
            load_pages += requested.len() as u64;
            load_bytes += bytes;
            self.io.shared_cache.request(FetchRequest {
                priority: Priority::Background,
                kind: FetchKind::Cache,
                fetch: PageFetch {
                    label: *label,
                    pages: requested,
                },
            });
        }
        self.stats.pages_requested += load_pages;
        self.stats.bytes_requested += load_bytes;
        tracing::debug!(read = %id, load_pages, load_bytes, new_pins, unpinned, "compaction read postponed");

        if self.cache.has_pad(&pad) {
            self.wait_pads.insert(pad, Waiter::Read(id));
        } else {
            self.read_queue.push_back(id);
            self.plan_compaction_read_activation();
        }
    }

    /// Drop every compaction and read of a broken tablet, returning their
    /// pins, collection locks and barriers.
    pub(crate) fn release_compactions(&mut self) {
        for (_, mut state) in std::mem::take(&mut self.reads) {
            self.unpin_read_pages(&mut state.pinned);
        }
        self.read_queue.clear();
        for (_, op) in std::mem::take(&mut self.compactions) {
            for part in &op.subset.flatten {
                self.cache.unlock_collection(&part.label);
            }
            self.barriers.release(op.barrier, self.io.gc.as_mut());
        }
    }

    fn unpin_read_pages(&mut self, pinned: &mut BTreeMap<Label, BTreeSet<PageId>>) -> usize {
        let mut unpinned = 0;
        for (label, pages) in std::mem::take(pinned) {
            for page in pages {
                self.cache.unpin(&label, page);
                unpinned += 1;
            }
        }
        unpinned
    }

    pub(crate) fn plan_compaction_read_activation(&mut self) {
        if !self.read_queue.is_empty() && !self.read_activating {
            self.read_activating = true;
            self.post(LocalEvent::ActivateCompactionRead);
        }
    }

    pub(crate) fn on_activate_compaction_read(&mut self) {
        self.read_activating = false;
        let queue = std::mem::take(&mut self.read_queue);
        for id in queue {
            let Some(mut state) = self.reads.remove(&id) else {
                continue;
            };
            state.retries += 1;
            self.stats.compaction_read_retries += 1;
            let (finished, pages) = run_read(&self.cache, state.read.as_mut());
            if finished {
                self.unpin_read_pages(&mut state.pinned);
                tracing::debug!(read = %id, retries = state.retries, "compaction read finished");
                continue;
            }
            self.postpone_compaction_read(id, &mut state, pages);
            if self.broken.is_some() {
                return;
            }
            self.reads.insert(id, state);
        }
    }

    /// Postponed compaction reads.
    pub fn reads_in_flight(&self) -> usize {
        self.reads.len()
    }
}
