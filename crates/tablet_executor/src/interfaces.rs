//! Collaborators the executor drives but does not implement.
//!
//! Every external service is an injected trait object. The executor owns the
//! boxes for its whole life and talks to them from its single logical thread;
//! asynchronous replies come back through the executor's `on_*` handlers,
//! matched by the cookie types defined here.

use std::collections::BTreeMap;
use std::time::Duration;

use tablet_common::error::BrokenReason;
use tablet_common::types::{
    BlobId, CompactionId, Epoch, FetchStatus, Label, PageId, SeatId, Step, SwitchHandle, TableId,
    TaskId,
};

use crate::commit::{GcDelta, LogCommit};
use crate::parts::{
    CachePolicy, ChangeSet, ColdPart, LoadedPage, PageFetch, PartComponents, PartView, Slice,
    Subset, TxStatusPart,
};

// ── Table database ─────────────────────────────────────────────────────────

/// The sorted-table engine: stores and merges parts and serves reads.
pub trait TableDatabase {
    fn table_exists(&self, table: TableId) -> bool;
    fn cache_policy(&self, table: TableId) -> CachePolicy;
    /// Borrowed parts of this table stay cold (not loaded locally).
    fn cold_borrow(&self, table: TableId) -> bool;
    /// Epoch of the table's in-memory head.
    fn head(&self, table: TableId) -> Epoch;
    fn table_mem_size(&self, table: TableId) -> u64;

    fn begin(&mut self, stamp: u64);
    fn read(&self, table: TableId, key: &[u8]) -> Option<Vec<u8>>;
    fn update(&mut self, table: TableId, key: Vec<u8>, value: Option<Vec<u8>>);
    fn validate_commit(&self) -> Result<(), String>;
    /// Finish the transaction started by `begin`. Rolls back when `success` is false.
    fn commit(&mut self, stamp: u64, success: bool) -> ChangeSet;

    fn merge(&mut self, table: TableId, part: PartView);
    fn merge_cold(&mut self, table: TableId, part: ColdPart);
    fn merge_tx_status(&mut self, table: TableId, part: TxStatusPart);
    /// Drop the slices of `subset` and add `parts`. Parts with slices left
    /// outside the subset stay in the table.
    fn replace(&mut self, table: TableId, parts: Vec<PartView>, subset: &Subset);
    fn replace_tx_status(&mut self, table: TableId, parts: Vec<TxStatusPart>, subset: &Subset);
    /// Current slices of the given parts that are still in the table.
    fn lookup_slices(&self, table: TableId, labels: &[Label]) -> BTreeMap<Label, Vec<Slice>>;
    fn replace_slices(&mut self, table: TableId, slices: BTreeMap<Label, Vec<Slice>>);
    /// Every part and tx status with epoch below `head`.
    fn subset(&self, table: TableId, head: Epoch) -> Subset;
    /// The named parts, cold parts and tx status. The subset head is `head`
    /// capped at the table's current head.
    fn subset_of(&self, table: TableId, labels: &[Label], head: Epoch) -> Subset;

    /// Build a part loader once the part's metadata blobs are available.
    fn open_loader(
        &mut self,
        table: TableId,
        components: &PartComponents,
        meta: BTreeMap<BlobId, Vec<u8>>,
    ) -> Box<dyn PartLoader>;
    fn load_tx_status(
        &mut self,
        table: TableId,
        label: Label,
        epoch: Epoch,
        data: Vec<u8>,
    ) -> TxStatusPart;
}

/// Step result of a part loader.
pub enum LoaderStep {
    /// The loader needs these pages before it can continue.
    Fetch(PageFetch),
    Ready(PartView),
}

/// Builds a part view from metadata, pulling index pages as needed.
pub trait PartLoader {
    fn run(&mut self) -> LoaderStep;
    fn save(&mut self, pages: Vec<LoadedPage>);
}

// ── Log logic ──────────────────────────────────────────────────────────────

/// Redo, snapshot and alter log encoding.
pub trait RedoLog {
    /// Append a transaction's change set to `commit`.
    fn write(&mut self, commit: &mut LogCommit, seat: SeatId, change: &ChangeSet);
    /// Keep a change set for a later commit.
    fn batch(&mut self, seat: SeatId, change: &ChangeSet);
    fn has_batched(&self) -> bool;
    /// Move batched change sets into `commit`. Returns how many were moved.
    fn flush_batched(&mut self, commit: &mut LogCommit) -> usize;
    fn cut_log(&mut self, table: TableId, step: Step, head: Epoch, gc: &mut GcDelta);
    /// A redo commit became durable.
    fn confirm(&mut self, step: Step);
    /// Write a full log snapshot into `commit`.
    fn snap_to_log(&mut self, commit: &mut LogCommit);
    fn confirm_snap(&mut self, step: Step);
    fn may_flush_snapshot(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStateSize {
    pub committed: u64,
    pub uncommitted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectGarbageResult {
    pub channel: u32,
    pub status: FetchStatus,
    pub barrier: Step,
}

/// Tracks created/deleted blobs and collection barriers.
pub trait GcLogic {
    fn hold_barrier(&mut self, step: Step);
    fn release_barrier(&mut self, step: Step);
    /// Lowest barrier still held, if any.
    fn active_barrier(&self) -> Option<Step>;
    fn on_commit_log(&mut self, step: Step);
    fn on_collect_garbage_result(&mut self, result: CollectGarbageResult);
    fn snap_to_log(&mut self, commit: &mut LogCommit);
    fn introspect_state_size(&self) -> GcStateSize;
}

/// Cross-tablet loan and borrow bookkeeping.
pub trait BorrowLogic {
    fn loan_bundle(&mut self, label: Label, table: TableId, commit: &mut LogCommit);
    fn loan_tx_status(&mut self, label: Label, table: TableId, commit: &mut LogCommit);
    /// Another tablet borrowed one of our bundles.
    fn borrow_bundle(&mut self, label: Label, borrower: u64, commit: &mut LogCommit);
    /// A consumed part left the table. Returns true when its blobs may be deleted.
    fn bundle_compacted(&mut self, label: Label, commit: &mut LogCommit) -> bool;
    fn update_borrow(&mut self, label: Label, borrower: u64, commit: &mut LogCommit);
    fn confirm_update_loan(&mut self, label: Label, borrow_id: Label, commit: &mut LogCommit);
    fn borrowed_parts(&self) -> Vec<Label>;
    /// Returns true when completed loans changed.
    fn set_gc_barrier(&mut self, barrier: Option<Step>) -> bool;
}

// ── Compaction strategy ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceChange {
    pub label: Label,
    pub new_slices: Vec<Slice>,
}

/// Changes the strategy wants persisted alongside (or outside) a compaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompactionChanges {
    pub slice_changes: Vec<SliceChange>,
    pub state_changes: BTreeMap<u64, Option<Vec<u8>>>,
    pub new_parts_level: u32,
}

impl CompactionChanges {
    pub fn is_empty(&self) -> bool {
        self.slice_changes.is_empty() && self.state_changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompactionLogicResult {
    pub changes: CompactionChanges,
    pub strategy: u32,
    /// Steps of table snapshots this compaction satisfied.
    pub completed_snapshots: Vec<Step>,
    pub mem_compacted: bool,
}

/// Decides what and when to compact.
pub trait CompactionStrategy {
    fn update_in_mem_stats(&mut self, table: TableId, ops: u64, mem_size: u64);
    fn complete_compaction(
        &mut self,
        id: CompactionId,
        table: TableId,
        parts: &[PartView],
    ) -> CompactionLogicResult;
    fn cancelled_compaction(&mut self, id: CompactionId, table: TableId);
    fn borrowed_part(&mut self, table: TableId, label: Label, epoch: Epoch);
    /// Compaction level recorded for parts that arrive from outside.
    fn borrowed_part_level(&self) -> u32;
    fn removed_parts(&mut self, table: TableId, labels: &[Label]);
    /// Returns true when a forced compaction was scheduled.
    fn prepare_force_compaction(&mut self, table: TableId) -> bool;
    fn request_changes(&mut self, table: TableId);
    /// Changes requested through `request_changes`, per table.
    fn apply_changes(&mut self) -> Vec<(TableId, CompactionChanges, u32)>;
}

// ── Shared page cache ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Fast,
    Background,
}

/// Why the executor asked for pages. Echoed back in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Pages a parked consumer waits for.
    Cache,
    /// Pages loaded eagerly for always-resident tables.
    CacheSync,
    /// Pages a part loader needs to finish building a part.
    PendingInit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub priority: Priority,
    pub kind: FetchKind,
    pub fetch: PageFetch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub label: Label,
    pub kind: FetchKind,
    pub status: FetchStatus,
    pub pages: Vec<LoadedPage>,
}

/// Unsolicited shared cache notification for one collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SharedUpdate {
    pub accepted: Vec<LoadedPage>,
    pub dropped: Vec<PageId>,
}

/// The cross-tablet page cache service.
pub trait SharedCacheClient {
    fn request(&mut self, request: FetchRequest);
    fn attach(&mut self, label: Label, page_count: u32);
    fn invalidate(&mut self, label: Label);
    fn touch(&mut self, touched: BTreeMap<Label, Vec<PageId>>);
    fn unregister(&mut self);
    /// Answer a page request another actor sent to this tablet.
    fn respond(&mut self, requester: u64, result: FetchResult);
    /// Pass the uncached part of such a request on to the shared cache.
    fn forward(&mut self, requester: u64, request: FetchRequest);
}

/// Reads metadata blobs of parts being assembled.
pub trait BlobReader {
    fn read(&mut self, blobs: Vec<BlobId>, switch: SwitchHandle);
}

// ── Resource broker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Finished,
    Cancelled,
}

/// Grants memory beyond the static pool.
pub trait ResourceBroker {
    fn submit(&mut self, task: TaskId, memory: u64);
    fn update(&mut self, task: TaskId, memory: u64);
    fn finish(&mut self, task: TaskId, status: TaskStatus);
}

// ── Commit transport, timers, owner ────────────────────────────────────────

/// Durable log writer. Results arrive through `Executor::on_commit_result`.
pub trait LogWriter {
    fn send(&mut self, commit: LogCommit);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    LeaseExtend,
    FlushLog,
}

/// Monotonic clock and delayed self-messages.
pub trait Timers {
    fn now(&self) -> Duration;
    fn schedule(&mut self, at: Duration, event: TimerEvent);
}

/// The tablet that owns the executor.
pub trait Owner {
    fn on_broken(&mut self, reason: &BrokenReason);
    fn detach(&mut self);
    fn lease_dropped(&mut self);
    fn completed_loans_changed(&mut self);
    fn follower_gc_ack(&mut self, step: Step);
    fn compaction_complete(&mut self, table: TableId);
    fn snapshot_complete(&mut self, table: TableId, step: Step);
}

/// Everything the executor needs from the outside world.
pub struct Collaborators {
    pub database: Box<dyn TableDatabase>,
    pub redo: Box<dyn RedoLog>,
    pub gc: Box<dyn GcLogic>,
    pub borrow: Box<dyn BorrowLogic>,
    pub compaction: Box<dyn CompactionStrategy>,
    pub shared_cache: Box<dyn SharedCacheClient>,
    pub blobs: Box<dyn BlobReader>,
    pub broker: Box<dyn ResourceBroker>,
    pub log: Box<dyn LogWriter>,
    pub timers: Box<dyn Timers>,
    pub owner: Box<dyn Owner>,
}
