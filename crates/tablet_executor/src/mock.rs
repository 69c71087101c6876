//! In-memory collaborators.
//!
//! Every mock keeps its state behind an `Arc<Mutex<_>>` shared with the
//! [`MockCollaborators`] that created it, so a test can hand the boxed
//! collaborators to an executor and still inspect and script them
//! afterwards. None of them implements any policy of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tablet_common::error::BrokenReason;
use tablet_common::types::{
    BlobId, CompactionId, Epoch, Label, PageId, SeatId, Step, SwitchHandle, TableId, TaskId,
};

use crate::commit::{GcDelta, LogCommit};
use crate::interfaces::{
    BlobReader, BorrowLogic, CollectGarbageResult, Collaborators, CompactionChanges,
    CompactionLogicResult, CompactionStrategy, FetchRequest, FetchResult, GcLogic, GcStateSize,
    LoaderStep, LogWriter, Owner, PartLoader, RedoLog, ResourceBroker, SharedCacheClient,
    TableDatabase, TaskStatus, TimerEvent, Timers,
};
use crate::parts::{
    remove_slices, CachePolicy, ChangeSet, ColdPart, LoadedPage, PageFetch, PartComponents,
    PartView, Slice, Subset, TxStatusPart,
};
use crate::seat::{Completed, MemoryToken, TerminationReason, Transaction, TxContext};
use crate::wire::Overlay;

pub type Shared<T> = Arc<Mutex<T>>;

fn shared<T: Default>() -> Shared<T> {
    Arc::new(Mutex::new(T::default()))
}

// ── Table database ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub head: Epoch,
    pub parts: Vec<PartView>,
    pub cold: Vec<ColdPart>,
    pub tx_status: Vec<TxStatusPart>,
    pub rows: BTreeMap<Vec<u8>, Vec<u8>>,
    pub cache_policy: CachePolicy,
    pub cold_borrow: bool,
    pub mem_size: u64,
}

impl MemTable {
    pub fn part(&self, label: &Label) -> Option<&PartView> {
        self.parts.iter().find(|p| &p.label == label)
    }

    pub fn labels(&self) -> Vec<Label> {
        self.parts.iter().map(|p| p.label).collect()
    }
}

/// How a loader for one label behaves.
#[derive(Debug, Clone)]
pub struct LoaderScript {
    /// Pages the loader asks for once before it is ready.
    pub fetch: Option<Vec<PageId>>,
    pub view: PartView,
}

#[derive(Debug, Default)]
pub struct DatabaseState {
    pub tables: BTreeMap<TableId, MemTable>,
    /// Returned by the next `validate_commit`.
    pub validation_failure: Option<String>,
    pub loaders: BTreeMap<Label, LoaderScript>,
    /// Slices `subset` reports for a part instead of all of them.
    pub subset_slices: BTreeMap<Label, Vec<Slice>>,
    pub loader_saves: Vec<(Label, usize)>,
    pub stamps: Vec<u64>,
    writes: Vec<(TableId, Vec<u8>, Option<Vec<u8>>)>,
}

impl DatabaseState {
    pub fn table_mut(&mut self, table: TableId) -> &mut MemTable {
        self.tables.entry(table).or_default()
    }
}

pub struct MockDatabase {
    state: Shared<DatabaseState>,
}

impl MockDatabase {
    fn with_table<R>(&self, table: TableId, f: impl FnOnce(&MemTable) -> R) -> Option<R> {
        self.state.lock().tables.get(&table).map(f)
    }
}

impl TableDatabase for MockDatabase {
    fn table_exists(&self, table: TableId) -> bool {
        self.state.lock().tables.contains_key(&table)
    }

    fn cache_policy(&self, table: TableId) -> CachePolicy {
        self.with_table(table, |t| t.cache_policy).unwrap_or_default()
    }

    fn cold_borrow(&self, table: TableId) -> bool {
        self.with_table(table, |t| t.cold_borrow).unwrap_or(false)
    }

    fn head(&self, table: TableId) -> Epoch {
        self.with_table(table, |t| t.head).unwrap_or_default()
    }

    fn table_mem_size(&self, table: TableId) -> u64 {
        self.with_table(table, |t| t.mem_size).unwrap_or(0)
    }

    fn begin(&mut self, stamp: u64) {
        let mut state = self.state.lock();
        state.stamps.push(stamp);
        state.writes.clear();
    }

    fn read(&self, table: TableId, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock();
        if let Some((_, _, value)) = state
            .writes
            .iter()
            .rev()
            .find(|(t, k, _)| *t == table && k.as_slice() == key)
        {
            return value.clone();
        }
        state.tables.get(&table)?.rows.get(key).cloned()
    }

    fn update(&mut self, table: TableId, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.state.lock().writes.push((table, key, value));
    }

    fn validate_commit(&self) -> Result<(), String> {
        match &self.state.lock().validation_failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn commit(&mut self, stamp: u64, success: bool) -> ChangeSet {
        let mut state = self.state.lock();
        let writes = std::mem::take(&mut state.writes);
        if !success || writes.is_empty() {
            return ChangeSet {
                serial: stamp,
                ..Default::default()
            };
        }
        let redo = bincode::serialize(&writes).unwrap_or_default();
        let mut affects = BTreeSet::new();
        for (table, key, value) in writes {
            affects.insert(table);
            let rows = &mut state.table_mut(table).rows;
            match value {
                Some(value) => rows.insert(key, value),
                None => rows.remove(&key),
            };
        }
        ChangeSet {
            serial: stamp,
            redo,
            affects: affects.into_iter().collect(),
            ..Default::default()
        }
    }

    fn merge(&mut self, table: TableId, part: PartView) {
        self.state.lock().table_mut(table).parts.push(part);
    }

    fn merge_cold(&mut self, table: TableId, part: ColdPart) {
        self.state.lock().table_mut(table).cold.push(part);
    }

    fn merge_tx_status(&mut self, table: TableId, part: TxStatusPart) {
        self.state.lock().table_mut(table).tx_status.push(part);
    }

    fn replace(&mut self, table: TableId, parts: Vec<PartView>, subset: &Subset) {
        let mut state = self.state.lock();
        let t = state.table_mut(table);
        let mut emptied = BTreeSet::new();
        for gone in &subset.flatten {
            if let Some(part) = t.parts.iter_mut().find(|p| p.label == gone.label) {
                part.slices = remove_slices(&part.slices, &gone.slices);
                if part.slices.is_empty() {
                    emptied.insert(part.label);
                }
            }
        }
        t.parts.retain(|p| !emptied.contains(&p.label));
        t.cold.retain(|c| !subset.cold.iter().any(|g| g.label == c.label));
        t.parts.extend(parts);
    }

    fn replace_tx_status(&mut self, table: TableId, parts: Vec<TxStatusPart>, subset: &Subset) {
        let mut state = self.state.lock();
        let t = state.table_mut(table);
        t.tx_status
            .retain(|p| !subset.tx_status.iter().any(|g| g.label == p.label));
        t.tx_status.extend(parts);
    }

    fn lookup_slices(&self, table: TableId, labels: &[Label]) -> BTreeMap<Label, Vec<Slice>> {
        let state = self.state.lock();
        let Some(t) = state.tables.get(&table) else {
            return BTreeMap::new();
        };
        labels
            .iter()
            .filter_map(|label| t.part(label).map(|p| (*label, p.slices.clone())))
            .collect()
    }

    fn replace_slices(&mut self, table: TableId, slices: BTreeMap<Label, Vec<Slice>>) {
        let mut state = self.state.lock();
        let t = state.table_mut(table);
        for part in t.parts.iter_mut() {
            if let Some(updated) = slices.get(&part.label) {
                part.slices = updated.clone();
            }
        }
    }

    fn subset(&self, table: TableId, head: Epoch) -> Subset {
        let state = self.state.lock();
        let Some(t) = state.tables.get(&table) else {
            return Subset::empty(table, head);
        };
        let mut subset = Subset::empty(table, head);
        for part in t.parts.iter().filter(|p| p.epoch < head) {
            let mut part = part.clone();
            if let Some(slices) = state.subset_slices.get(&part.label) {
                part.slices = slices.clone();
            }
            subset.flatten.push(part);
        }
        subset
            .cold
            .extend(t.cold.iter().filter(|p| p.epoch < head).cloned());
        subset
            .tx_status
            .extend(t.tx_status.iter().filter(|p| p.epoch < head).cloned());
        subset
    }

    fn subset_of(&self, table: TableId, labels: &[Label], head: Epoch) -> Subset {
        let state = self.state.lock();
        let Some(t) = state.tables.get(&table) else {
            return Subset::empty(table, head);
        };
        let wanted: BTreeSet<&Label> = labels.iter().collect();
        let mut subset = Subset::empty(table, head.min(t.head));
        subset
            .flatten
            .extend(t.parts.iter().filter(|p| wanted.contains(&p.label)).cloned());
        subset
            .cold
            .extend(t.cold.iter().filter(|p| wanted.contains(&p.label)).cloned());
        subset
            .tx_status
            .extend(t.tx_status.iter().filter(|p| wanted.contains(&p.label)).cloned());
        subset
    }

    fn open_loader(
        &mut self,
        _table: TableId,
        components: &PartComponents,
        meta: BTreeMap<BlobId, Vec<u8>>,
    ) -> Box<dyn PartLoader> {
        let script = self.state.lock().loaders.get(&components.label).cloned();
        let script = script.unwrap_or_else(|| {
            let overlay =
                Overlay::decode(&components.legacy, &components.opaque).unwrap_or_default();
            LoaderScript {
                fetch: None,
                view: PartView {
                    label: components.label,
                    epoch: components.epoch,
                    slices: overlay.slices,
                    page_count: 4,
                    page_size: 128,
                    blobs: meta.keys().copied().collect(),
                },
            }
        });
        Box::new(MockLoader {
            state: self.state.clone(),
            fetch: script.fetch,
            view: script.view,
        })
    }

    fn load_tx_status(
        &mut self,
        _table: TableId,
        label: Label,
        epoch: Epoch,
        data: Vec<u8>,
    ) -> TxStatusPart {
        TxStatusPart {
            label,
            epoch,
            data,
            blobs: Vec::new(),
        }
    }
}

pub struct MockLoader {
    state: Shared<DatabaseState>,
    fetch: Option<Vec<PageId>>,
    view: PartView,
}

impl PartLoader for MockLoader {
    fn run(&mut self) -> LoaderStep {
        match &self.fetch {
            Some(pages) => LoaderStep::Fetch(PageFetch {
                label: self.view.label,
                pages: pages.clone(),
            }),
            None => LoaderStep::Ready(self.view.clone()),
        }
    }

    fn save(&mut self, pages: Vec<LoadedPage>) {
        self.state.lock().loader_saves.push((self.view.label, pages.len()));
        self.fetch = None;
    }
}

// ── Log logic ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RedoState {
    pub written: Vec<(Step, SeatId)>,
    pub batched: Vec<SeatId>,
    pub flushed: Vec<(Step, usize)>,
    pub cuts: Vec<(TableId, Step, Epoch)>,
    pub confirmed: Vec<Step>,
    pub snaps: Vec<Step>,
    pub confirmed_snaps: Vec<Step>,
    pub may_flush_snapshot: bool,
}

pub struct MockRedo {
    state: Shared<RedoState>,
}

impl RedoLog for MockRedo {
    fn write(&mut self, commit: &mut LogCommit, seat: SeatId, change: &ChangeSet) {
        commit.redo.extend_from_slice(&change.redo);
        self.state.lock().written.push((commit.step, seat));
    }

    fn batch(&mut self, seat: SeatId, _change: &ChangeSet) {
        self.state.lock().batched.push(seat);
    }

    fn has_batched(&self) -> bool {
        !self.state.lock().batched.is_empty()
    }

    fn flush_batched(&mut self, commit: &mut LogCommit) -> usize {
        let mut state = self.state.lock();
        let count = state.batched.len();
        for seat in std::mem::take(&mut state.batched) {
            state.written.push((commit.step, seat));
        }
        state.flushed.push((commit.step, count));
        count
    }

    fn cut_log(&mut self, table: TableId, step: Step, head: Epoch, _gc: &mut GcDelta) {
        self.state.lock().cuts.push((table, step, head));
    }

    fn confirm(&mut self, step: Step) {
        self.state.lock().confirmed.push(step);
    }

    fn snap_to_log(&mut self, commit: &mut LogCommit) {
        self.state.lock().snaps.push(commit.step);
    }

    fn confirm_snap(&mut self, step: Step) {
        self.state.lock().confirmed_snaps.push(step);
    }

    fn may_flush_snapshot(&self) -> bool {
        self.state.lock().may_flush_snapshot
    }
}

#[derive(Debug, Default)]
pub struct GcState {
    pub held: Vec<Step>,
    pub released: Vec<Step>,
    pub logged: Vec<Step>,
    pub results: Vec<CollectGarbageResult>,
}

impl GcState {
    /// Steps held and not released yet.
    pub fn active(&self) -> Vec<Step> {
        let mut active = self.held.clone();
        for step in &self.released {
            if let Some(at) = active.iter().position(|s| s == step) {
                active.remove(at);
            }
        }
        active
    }
}

pub struct MockGc {
    state: Shared<GcState>,
}

impl GcLogic for MockGc {
    fn hold_barrier(&mut self, step: Step) {
        self.state.lock().held.push(step);
    }

    fn release_barrier(&mut self, step: Step) {
        self.state.lock().released.push(step);
    }

    fn active_barrier(&self) -> Option<Step> {
        self.state.lock().active().into_iter().min()
    }

    fn on_commit_log(&mut self, step: Step) {
        self.state.lock().logged.push(step);
    }

    fn on_collect_garbage_result(&mut self, result: CollectGarbageResult) {
        self.state.lock().results.push(result);
    }

    fn snap_to_log(&mut self, _commit: &mut LogCommit) {}

    fn introspect_state_size(&self) -> GcStateSize {
        let state = self.state.lock();
        GcStateSize {
            committed: state.logged.len() as u64,
            uncommitted: state.active().len() as u64,
        }
    }
}

#[derive(Debug, Default)]
pub struct BorrowState {
    pub loans: Vec<(Label, TableId, Step)>,
    pub tx_status_loans: Vec<(Label, TableId, Step)>,
    pub borrows: Vec<(Label, u64)>,
    pub compacted: Vec<Label>,
    /// Parts still borrowed elsewhere: their blobs are kept when compacted.
    pub shared: BTreeSet<Label>,
    pub updates: Vec<(Label, u64)>,
    pub confirmations: Vec<(Label, Label)>,
    pub gc_barrier: Option<Step>,
    /// `set_gc_barrier` reports changed loans.
    pub loans_complete_on_barrier: bool,
}

pub struct MockBorrow {
    state: Shared<BorrowState>,
}

impl BorrowLogic for MockBorrow {
    fn loan_bundle(&mut self, label: Label, table: TableId, commit: &mut LogCommit) {
        self.state.lock().loans.push((label, table, commit.step));
    }

    fn loan_tx_status(&mut self, label: Label, table: TableId, commit: &mut LogCommit) {
        self.state
            .lock()
            .tx_status_loans
            .push((label, table, commit.step));
    }

    fn borrow_bundle(&mut self, label: Label, borrower: u64, _commit: &mut LogCommit) {
        self.state.lock().borrows.push((label, borrower));
    }

    fn bundle_compacted(&mut self, label: Label, _commit: &mut LogCommit) -> bool {
        let mut state = self.state.lock();
        state.compacted.push(label);
        !state.shared.contains(&label)
    }

    fn update_borrow(&mut self, label: Label, borrower: u64, _commit: &mut LogCommit) {
        self.state.lock().updates.push((label, borrower));
    }

    fn confirm_update_loan(&mut self, label: Label, borrow_id: Label, _commit: &mut LogCommit) {
        self.state.lock().confirmations.push((label, borrow_id));
    }

    fn borrowed_parts(&self) -> Vec<Label> {
        self.state.lock().loans.iter().map(|(l, _, _)| *l).collect()
    }

    fn set_gc_barrier(&mut self, barrier: Option<Step>) -> bool {
        let mut state = self.state.lock();
        let changed = state.gc_barrier != barrier;
        state.gc_barrier = barrier;
        changed && state.loans_complete_on_barrier
    }
}

// ── Compaction strategy ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CompactionState {
    pub in_mem: Vec<(TableId, u64, u64)>,
    pub completed: Vec<(CompactionId, TableId, Vec<Label>)>,
    pub cancelled: Vec<(CompactionId, TableId)>,
    pub borrowed: Vec<(TableId, Label, Epoch)>,
    pub removed: Vec<(TableId, Vec<Label>)>,
    pub forced: Vec<TableId>,
    pub requested: Vec<TableId>,
    /// Returned by the next `complete_compaction`.
    pub next_result: Option<CompactionLogicResult>,
    /// Returned by the next `apply_changes`.
    pub pending_changes: Vec<(TableId, CompactionChanges, u32)>,
    pub borrowed_level: u32,
}

pub struct MockCompaction {
    state: Shared<CompactionState>,
}

impl CompactionStrategy for MockCompaction {
    fn update_in_mem_stats(&mut self, table: TableId, ops: u64, mem_size: u64) {
        self.state.lock().in_mem.push((table, ops, mem_size));
    }

    fn complete_compaction(
        &mut self,
        id: CompactionId,
        table: TableId,
        parts: &[PartView],
    ) -> CompactionLogicResult {
        let mut state = self.state.lock();
        state
            .completed
            .push((id, table, parts.iter().map(|p| p.label).collect()));
        state.next_result.take().unwrap_or_default()
    }

    fn cancelled_compaction(&mut self, id: CompactionId, table: TableId) {
        self.state.lock().cancelled.push((id, table));
    }

    fn borrowed_part(&mut self, table: TableId, label: Label, epoch: Epoch) {
        self.state.lock().borrowed.push((table, label, epoch));
    }

    fn borrowed_part_level(&self) -> u32 {
        self.state.lock().borrowed_level
    }

    fn removed_parts(&mut self, table: TableId, labels: &[Label]) {
        self.state.lock().removed.push((table, labels.to_vec()));
    }

    fn prepare_force_compaction(&mut self, table: TableId) -> bool {
        self.state.lock().forced.push(table);
        true
    }

    fn request_changes(&mut self, table: TableId) {
        self.state.lock().requested.push(table);
    }

    fn apply_changes(&mut self) -> Vec<(TableId, CompactionChanges, u32)> {
        std::mem::take(&mut self.state.lock().pending_changes)
    }
}

// ── Transport ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SharedCacheState {
    pub requests: Vec<FetchRequest>,
    pub attached: Vec<(Label, u32)>,
    pub invalidated: Vec<Label>,
    pub touched: Vec<BTreeMap<Label, Vec<PageId>>>,
    pub unregistered: bool,
    pub responses: Vec<(u64, FetchResult)>,
    pub forwarded: Vec<(u64, FetchRequest)>,
}

impl SharedCacheState {
    /// Pages requested for `label` so far.
    pub fn requested_pages(&self, label: &Label) -> Vec<PageId> {
        self.requests
            .iter()
            .filter(|r| &r.fetch.label == label)
            .flat_map(|r| r.fetch.pages.iter().copied())
            .collect()
    }
}

pub struct MockSharedCache {
    state: Shared<SharedCacheState>,
}

impl SharedCacheClient for MockSharedCache {
    fn request(&mut self, request: FetchRequest) {
        self.state.lock().requests.push(request);
    }

    fn attach(&mut self, label: Label, page_count: u32) {
        self.state.lock().attached.push((label, page_count));
    }

    fn invalidate(&mut self, label: Label) {
        self.state.lock().invalidated.push(label);
    }

    fn touch(&mut self, touched: BTreeMap<Label, Vec<PageId>>) {
        self.state.lock().touched.push(touched);
    }

    fn unregister(&mut self) {
        self.state.lock().unregistered = true;
    }

    fn respond(&mut self, requester: u64, result: FetchResult) {
        self.state.lock().responses.push((requester, result));
    }

    fn forward(&mut self, requester: u64, request: FetchRequest) {
        self.state.lock().forwarded.push((requester, request));
    }
}

pub struct MockBlobs {
    state: Shared<Vec<(Vec<BlobId>, SwitchHandle)>>,
}

impl BlobReader for MockBlobs {
    fn read(&mut self, blobs: Vec<BlobId>, switch: SwitchHandle) {
        self.state.lock().push((blobs, switch));
    }
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub submitted: Vec<(TaskId, u64)>,
    pub updated: Vec<(TaskId, u64)>,
    pub finished: Vec<(TaskId, TaskStatus)>,
}

pub struct MockBroker {
    state: Shared<BrokerState>,
}

impl ResourceBroker for MockBroker {
    fn submit(&mut self, task: TaskId, memory: u64) {
        self.state.lock().submitted.push((task, memory));
    }

    fn update(&mut self, task: TaskId, memory: u64) {
        self.state.lock().updated.push((task, memory));
    }

    fn finish(&mut self, task: TaskId, status: TaskStatus) {
        self.state.lock().finished.push((task, status));
    }
}

pub struct MockLog {
    state: Shared<Vec<LogCommit>>,
}

impl LogWriter for MockLog {
    fn send(&mut self, commit: LogCommit) {
        self.state.lock().push(commit);
    }
}

#[derive(Debug, Default)]
pub struct TimerState {
    pub now: Duration,
    pub scheduled: Vec<(Duration, TimerEvent)>,
}

pub struct MockTimers {
    state: Shared<TimerState>,
}

impl Timers for MockTimers {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule(&mut self, at: Duration, event: TimerEvent) {
        self.state.lock().scheduled.push((at, event));
    }
}

#[derive(Debug, Default)]
pub struct OwnerState {
    pub broken: Vec<BrokenReason>,
    pub detached: u32,
    pub lease_dropped: u32,
    pub loans_changed: u32,
    pub gc_acks: Vec<Step>,
    pub compactions: Vec<TableId>,
    pub snapshots: Vec<(TableId, Step)>,
}

pub struct MockOwner {
    state: Shared<OwnerState>,
}

impl Owner for MockOwner {
    fn on_broken(&mut self, reason: &BrokenReason) {
        self.state.lock().broken.push(reason.clone());
    }

    fn detach(&mut self) {
        self.state.lock().detached += 1;
    }

    fn lease_dropped(&mut self) {
        self.state.lock().lease_dropped += 1;
    }

    fn completed_loans_changed(&mut self) {
        self.state.lock().loans_changed += 1;
    }

    fn follower_gc_ack(&mut self, step: Step) {
        self.state.lock().gc_acks.push(step);
    }

    fn compaction_complete(&mut self, table: TableId) {
        self.state.lock().compactions.push(table);
    }

    fn snapshot_complete(&mut self, table: TableId, step: Step) {
        self.state.lock().snapshots.push((table, step));
    }
}

// ── Bundle ─────────────────────────────────────────────────────────────────

/// Shared state of one set of mocks.
#[derive(Clone, Default)]
pub struct MockCollaborators {
    pub database: Shared<DatabaseState>,
    pub redo: Shared<RedoState>,
    pub gc: Shared<GcState>,
    pub borrow: Shared<BorrowState>,
    pub compaction: Shared<CompactionState>,
    pub shared_cache: Shared<SharedCacheState>,
    pub blobs: Shared<Vec<(Vec<BlobId>, SwitchHandle)>>,
    pub broker: Shared<BrokerState>,
    pub log: Shared<Vec<LogCommit>>,
    pub timers: Shared<TimerState>,
    pub owner: Shared<OwnerState>,
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxed collaborators backed by this state.
    pub fn boxed(&self) -> Collaborators {
        Collaborators {
            database: Box::new(MockDatabase {
                state: self.database.clone(),
            }),
            redo: Box::new(MockRedo {
                state: self.redo.clone(),
            }),
            gc: Box::new(MockGc {
                state: self.gc.clone(),
            }),
            borrow: Box::new(MockBorrow {
                state: self.borrow.clone(),
            }),
            compaction: Box::new(MockCompaction {
                state: self.compaction.clone(),
            }),
            shared_cache: Box::new(MockSharedCache {
                state: self.shared_cache.clone(),
            }),
            blobs: Box::new(MockBlobs {
                state: self.blobs.clone(),
            }),
            broker: Box::new(MockBroker {
                state: self.broker.clone(),
            }),
            log: Box::new(MockLog {
                state: self.log.clone(),
            }),
            timers: Box::new(MockTimers {
                state: self.timers.clone(),
            }),
            owner: Box::new(MockOwner {
                state: self.owner.clone(),
            }),
        }
    }

    /// Steps of every commit sent so far.
    pub fn sent_steps(&self) -> Vec<Step> {
        self.log.lock().iter().map(|c| c.step).collect()
    }

    pub fn last_commit(&self) -> Option<LogCommit> {
        self.log.lock().last().cloned()
    }
}

// ── Scripted transactions ──────────────────────────────────────────────────

/// What happened to a [`ScriptedTx`].
#[derive(Debug, Default)]
pub struct TxRecord {
    pub executions: u32,
    pub completed: Option<Completed>,
    pub terminated: Option<TerminationReason>,
    pub released_data: u32,
    pub captured: Option<MemoryToken>,
}

/// Transaction whose body is a closure.
pub struct ScriptedTx<F> {
    name: String,
    body: F,
    record: Shared<TxRecord>,
}

impl<F> ScriptedTx<F>
where
    F: FnMut(&mut TxContext<'_>) -> bool,
{
    pub fn new(name: impl Into<String>, body: F) -> (Self, Shared<TxRecord>) {
        let record: Shared<TxRecord> = shared();
        let tx = Self {
            name: name.into(),
            body,
            record: record.clone(),
        };
        (tx, record)
    }
}

impl<F> Transaction for ScriptedTx<F>
where
    F: FnMut(&mut TxContext<'_>) -> bool,
{
    fn execute(&mut self, ctx: &mut TxContext<'_>) -> bool {
        self.record.lock().executions += 1;
        (self.body)(ctx)
    }

    fn complete(&mut self, done: &Completed) {
        self.record.lock().completed = Some(*done);
    }

    fn terminate(&mut self, reason: TerminationReason) {
        self.record.lock().terminated = Some(reason);
    }

    fn release_tx_data(&mut self) {
        self.record.lock().released_data += 1;
    }

    fn memory_captured(&mut self, token: MemoryToken) {
        self.record.lock().captured = Some(token);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
