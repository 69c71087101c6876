//! Seats and the environment transactions run in.
//!
//! A seat is one admitted transaction attempt. It is owned by exactly one of
//! the executor's structures at a time: the activation or pending queue, the
//! resource arbiter (parked on memory), a wait pad (parked on pages) or the
//! commit wait lists. Transactions are re-executed from scratch after every
//! park, so the only state that survives is what the seat itself carries:
//! pins, memory grants and the retry counter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tablet_common::types::{Label, PageId, SeatId, Step, TableId, TaskId};

use crate::interfaces::TableDatabase;
use crate::page_cache::PrivatePageCache;
use crate::parts::{PartComponents, TxStatusComponents};

/// Why a seat was retired without committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The transaction asked to stop.
    Cancelled,
    /// Touched pages plus data memory went above `tx_memory_limit`.
    MemoryLimitExceeded,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::MemoryLimitExceeded => "memory_limit_exceeded",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory grant captured by a transaction so it outlives the seat.
///
/// Hand it back with [`TxContext::attach_memory`] in a later transaction, or
/// release it with `Executor::release_memory_token`.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryToken {
    pub(crate) id: u64,
    pub bytes: u64,
}

/// What a transaction learns when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub seat: SeatId,
    /// Log step the changes were written at; `None` for read-only transactions.
    pub step: Option<Step>,
    pub retries: u32,
}

/// User transaction logic.
///
/// `execute` may be called any number of times for a single admission: it
/// returns `false` whenever it touched a page that is not loaded or asked for
/// more memory, and is re-run from scratch once the demand is satisfied.
pub trait Transaction {
    fn execute(&mut self, ctx: &mut TxContext<'_>) -> bool;

    /// Changes are durable (or, for a read-only transaction, consistent).
    fn complete(&mut self, done: &Completed);

    fn terminate(&mut self, _reason: TerminationReason) {}

    /// The seat is about to wait for the resource broker. Drop any cached
    /// data that counted against the transaction's data limit.
    fn release_tx_data(&mut self) {}

    /// Memory captured through [`TxContext::capture_memory`].
    fn memory_captured(&mut self, _token: MemoryToken) {}

    fn name(&self) -> &str {
        "transaction"
    }
}

// ── Page environment ───────────────────────────────────────────────────────

/// Records page touches and misses of one execution attempt.
#[derive(Debug, Default)]
pub struct PageEnv {
    pub(crate) touches: BTreeMap<Label, BTreeSet<PageId>>,
    pub(crate) to_load: BTreeMap<Label, BTreeSet<PageId>>,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
}

impl PageEnv {
    pub(crate) fn lookup(
        &mut self,
        cache: &PrivatePageCache,
        label: Label,
        page: PageId,
    ) -> Option<Arc<[u8]>> {
        if !cache.has_collection(&label) {
            return None;
        }
        match cache.lookup(&label, page) {
            Some(body) => {
                if self.touches.entry(label).or_default().insert(page) {
                    self.cache_hits += 1;
                }
                Some(body)
            }
            None => {
                if self.to_load.entry(label).or_default().insert(page) {
                    self.cache_misses += 1;
                }
                None
            }
        }
    }

    pub(crate) fn has_to_load(&self) -> bool {
        self.to_load.values().any(|pages| !pages.is_empty())
    }

    pub(crate) fn touched_pages(&self) -> u64 {
        self.touches.values().map(|p| p.len() as u64).sum()
    }
}

/// Everything a transaction attempt asked for besides page reads.
#[derive(Debug, Default)]
pub(crate) struct TxEnv {
    pub(crate) pages: PageEnv,
    pub(crate) requested_memory: u64,
    pub(crate) capture_memory: bool,
    pub(crate) attached_memory: Option<MemoryToken>,
    pub(crate) termination: Option<TerminationReason>,
    pub(crate) loan_bundles: Vec<(TableId, PartComponents)>,
    pub(crate) loan_tx_status: Vec<(TableId, TxStatusComponents)>,
    /// Own parts lent to another tablet: `(label, borrower)`.
    pub(crate) borrow_bundles: Vec<(Label, u64)>,
    pub(crate) borrow_updates: Vec<(Label, u64)>,
    pub(crate) loan_confirmations: Vec<(Label, Label)>,
    pub(crate) snapshots: BTreeSet<TableId>,
    /// Part moves between tables: `(source, destination)`.
    pub(crate) moves: Vec<(TableId, TableId)>,
}

impl TxEnv {
    /// Changes that must reach the log even if the database change set is empty.
    pub(crate) fn has_changes(&self) -> bool {
        !self.loan_bundles.is_empty()
            || !self.loan_tx_status.is_empty()
            || !self.borrow_bundles.is_empty()
            || !self.borrow_updates.is_empty()
            || !self.loan_confirmations.is_empty()
            || !self.snapshots.is_empty()
            || !self.moves.is_empty()
    }
}

/// Handle passed to [`Transaction::execute`].
pub struct TxContext<'a> {
    seat: SeatId,
    retries: u32,
    step: Step,
    memory_limit: u64,
    database: &'a mut dyn TableDatabase,
    cache: &'a PrivatePageCache,
    env: &'a mut TxEnv,
}

impl<'a> TxContext<'a> {
    pub(crate) fn new(
        seat: &Seat,
        step: Step,
        database: &'a mut dyn TableDatabase,
        cache: &'a PrivatePageCache,
        env: &'a mut TxEnv,
    ) -> Self {
        Self {
            seat: seat.id,
            retries: seat.retries,
            step,
            memory_limit: seat.current_tx_data_limit,
            database,
            cache,
            env,
        }
    }

    pub fn seat(&self) -> SeatId {
        self.seat
    }

    /// 1 on the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Last log step issued when the attempt started.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Data memory the transaction may use in this attempt.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn read(&self, table: TableId, key: &[u8]) -> Option<Vec<u8>> {
        self.database.read(table, key)
    }

    pub fn update(&mut self, table: TableId, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.database.update(table, key, value);
    }

    /// Body of a page, or `None` when it has to be loaded first. A miss is
    /// remembered and loaded when the transaction returns not done.
    pub fn page(&mut self, label: Label, page: PageId) -> Option<Arc<[u8]>> {
        self.env.pages.lookup(self.cache, label, page)
    }

    /// Ask for more data memory before the next attempt.
    pub fn request_memory(&mut self, bytes: u64) {
        self.env.requested_memory += bytes;
    }

    /// Keep the seat's memory grant after it completes.
    pub fn capture_memory(&mut self) {
        self.env.capture_memory = true;
    }

    /// Reuse memory captured by an earlier transaction.
    pub fn attach_memory(&mut self, token: MemoryToken) {
        self.env.attached_memory = Some(token);
    }

    pub fn terminate(&mut self, reason: TerminationReason) {
        self.env.termination = Some(reason);
    }

    /// Add a part lent by another tablet to `table`.
    pub fn loan_bundle(&mut self, table: TableId, components: PartComponents) {
        self.env.loan_bundles.push((table, components));
    }

    pub fn loan_tx_status(&mut self, table: TableId, components: TxStatusComponents) {
        self.env.loan_tx_status.push((table, components));
    }

    /// Record that `borrower` now also uses one of our parts.
    pub fn borrow_bundle(&mut self, label: Label, borrower: u64) {
        self.env.borrow_bundles.push((label, borrower));
    }

    pub fn update_borrow(&mut self, label: Label, borrower: u64) {
        self.env.borrow_updates.push((label, borrower));
    }

    pub fn confirm_loan(&mut self, label: Label, borrow_id: Label) {
        self.env.loan_confirmations.push((label, borrow_id));
    }

    /// Snapshot `table` at the commit step. The owner is told once the
    /// commit is durable.
    pub fn snapshot_table(&mut self, table: TableId) {
        self.env.snapshots.insert(table);
    }

    /// Move every part of `source` into `destination`, below the
    /// destination's oldest epoch.
    pub fn move_parts(&mut self, source: TableId, destination: TableId) {
        self.env.moves.push((source, destination));
    }
}

// ── Seat ───────────────────────────────────────────────────────────────────

pub struct Seat {
    pub(crate) id: SeatId,
    pub(crate) tx: Box<dyn Transaction>,
    pub(crate) retries: u32,
    /// Static plus broker plus attached memory.
    pub(crate) current_memory_limit: u64,
    pub(crate) current_tx_data_limit: u64,
    /// Bytes of pinned pages.
    pub(crate) memory_touched: u64,
    pub(crate) static_memory: u64,
    pub(crate) granted_memory: u64,
    pub(crate) task: Option<TaskId>,
    pub(crate) pinned: BTreeMap<Label, BTreeSet<PageId>>,
    pub(crate) requested_memory: u64,
    pub(crate) attached_memory: Option<MemoryToken>,
    pub(crate) capture_memory: bool,
    pub(crate) termination: Option<TerminationReason>,
}

impl Seat {
    pub(crate) fn new(id: SeatId, tx: Box<dyn Transaction>) -> Self {
        Self {
            id,
            tx,
            retries: 0,
            current_memory_limit: 0,
            current_tx_data_limit: 0,
            memory_touched: 0,
            static_memory: 0,
            granted_memory: 0,
            task: None,
            pinned: BTreeMap::new(),
            requested_memory: 0,
            attached_memory: None,
            capture_memory: false,
            termination: None,
        }
    }

    pub fn id(&self) -> SeatId {
        self.id
    }

    pub(crate) fn refresh_memory_limit(&mut self) {
        self.current_memory_limit = self.static_memory + self.granted_memory;
    }
}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat")
            .field("id", &self.id)
            .field("tx", &self.tx.name())
            .field("retries", &self.retries)
            .field("current_memory_limit", &self.current_memory_limit)
            .field("memory_touched", &self.memory_touched)
            .field("task", &self.task)
            .finish()
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.tx.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::types::BlobId;

    #[test]
    fn test_page_env_counts_each_page_once() {
        let label = BlobId::new(1, 1, 1, 0);
        let mut cache = PrivatePageCache::new();
        cache.register_collection(label, 4, 10);
        cache.provide_page(&label, crate::parts::LoadedPage::new(0, vec![1]));

        let mut env = PageEnv::default();
        assert!(env.lookup(&cache, label, 0).is_some());
        assert!(env.lookup(&cache, label, 0).is_some());
        assert!(env.lookup(&cache, label, 1).is_none());
        assert!(env.lookup(&cache, label, 1).is_none());

        assert_eq!(env.cache_hits, 1);
        assert_eq!(env.cache_misses, 1);
        assert!(env.has_to_load());
        assert_eq!(env.touched_pages(), 1);
    }

    #[test]
    fn test_unknown_collection_is_not_loaded() {
        let cache = PrivatePageCache::new();
        let mut env = PageEnv::default();
        assert!(env.lookup(&cache, BlobId::new(1, 1, 1, 9), 0).is_none());
        assert!(!env.has_to_load());
    }

    #[test]
    fn test_env_changes_without_database_writes() {
        let mut env = TxEnv::default();
        assert!(!env.has_changes());
        env.snapshots.insert(TableId(3));
        assert!(env.has_changes());
    }
}
