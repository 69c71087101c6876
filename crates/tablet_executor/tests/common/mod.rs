#![allow(dead_code, unused_imports)]

pub use std::cell::{Cell, RefCell};
pub use std::collections::BTreeMap;
pub use std::rc::Rc;
pub use std::time::Duration;

pub use tablet_common::types::{
    BlobId, CompactionId, Epoch, FetchStatus, Label, PageId, ReadId, SeatId, Step, SwitchHandle,
    TableId, TaskId,
};
pub use tablet_common::{BrokenReason, ExecutorConfig, TabletError};
pub use tablet_executor::commit::{CommitKind, LogCommit};
pub use tablet_executor::compaction::{
    CompactedPart, CompactionOutcome, CompactionRead, ReadEnv, INLINE_TX_STATUS_LIMIT,
};
pub use tablet_executor::interfaces::{
    CompactionChanges, CompactionLogicResult, FetchKind, FetchRequest, FetchResult, Priority,
    SharedUpdate, SliceChange, TaskStatus, TimerEvent,
};
pub use tablet_executor::mock::{LoaderScript, MockCollaborators, ScriptedTx, Shared, TxRecord};
pub use tablet_executor::page_cache::LoadState;
pub use tablet_executor::parts::{
    CachePolicy, LoadedPage, PageFetch, PartComponents, PartView, Slice, TxStatusComponents,
    TxStatusPart,
};
pub use tablet_executor::seat::{TerminationReason, Transaction, TxContext};
pub use tablet_executor::wire::{
    bundle_change, encode_remove_slices, BundleDelta, BundleMove, IntroducedBundle, Overlay,
    PartSwitchRecord, TableSnapshoted,
};
pub use tablet_executor::Executor;

pub const TABLET: u64 = 1;
pub const TABLE: TableId = TableId(1);
/// Head epoch of every table the harness creates.
pub const HEAD: Epoch = Epoch(10);

pub fn label(cookie: u32) -> Label {
    BlobId::new(TABLET, 1, 2, cookie)
}

/// Label of a part owned by another tablet.
pub fn foreign_label(cookie: u32) -> Label {
    BlobId::new(77, 3, 4, cookie)
}

pub fn slices(ranges: &[(u64, u64)]) -> Vec<Slice> {
    ranges.iter().map(|&(a, b)| Slice::new(a, b)).collect()
}

pub fn part(label: Label, epoch: i64, ranges: &[(u64, u64)]) -> PartView {
    PartView {
        label,
        epoch: Epoch(epoch),
        slices: slices(ranges),
        page_count: 4,
        page_size: 100,
        blobs: vec![label],
    }
}

pub fn loaded(pages: &[PageId]) -> Vec<LoadedPage> {
    pages
        .iter()
        .map(|&p| LoadedPage::new(p, vec![p as u8; 8]))
        .collect()
}

/// Components of a part whose slices travel as an opaque overlay.
pub fn components(label: Label, epoch: i64, meta_blobs: Vec<BlobId>, ranges: &[(u64, u64)]) -> PartComponents {
    PartComponents {
        label,
        epoch: Epoch(epoch),
        meta_blobs,
        legacy: Vec::new(),
        opaque: Overlay::new(slices(ranges)).encode_opaque().unwrap(),
    }
}

pub fn tx<F>(name: &str, body: F) -> (Box<dyn Transaction>, Shared<TxRecord>)
where
    F: FnMut(&mut TxContext<'_>) -> bool + 'static,
{
    let (tx, record) = ScriptedTx::new(name, body);
    (Box::new(tx), record)
}

/// Writes one row to `TABLE`.
pub fn put(key: &'static [u8]) -> (Box<dyn Transaction>, Shared<TxRecord>) {
    tx("put", move |ctx| {
        ctx.update(TABLE, key.to_vec(), Some(b"value".to_vec()));
        true
    })
}

/// Completes only once every page is cached.
pub fn read_pages(label: Label, pages: Vec<PageId>) -> (Box<dyn Transaction>, Shared<TxRecord>) {
    tx("read_pages", move |ctx| {
        let mut complete = true;
        for &page in &pages {
            complete &= ctx.page(label, page).is_some();
        }
        complete
    })
}

pub struct Harness {
    pub executor: Executor,
    pub mocks: MockCollaborators,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    pub fn follower() -> Self {
        let mut config = ExecutorConfig::default();
        config.follower = true;
        Self::with_config(config)
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        let mocks = MockCollaborators::new();
        mocks.database.lock().table_mut(TABLE).head = HEAD;
        let mut executor = Executor::new(config, mocks.boxed()).unwrap();
        executor.activate();
        Self { executor, mocks }
    }

    pub fn create_table(&self, table: TableId) {
        self.mocks.database.lock().table_mut(table).head = HEAD;
    }

    /// Parts restored at boot: stored in the database and attached to the cache.
    pub fn add_parts(&mut self, table: TableId, parts: Vec<PartView>) {
        self.mocks
            .database
            .lock()
            .table_mut(table)
            .parts
            .extend(parts.iter().cloned());
        self.executor.attach_boot_parts(table, &parts);
    }

    pub fn submit(&mut self, (tx, record): (Box<dyn Transaction>, Shared<TxRecord>)) -> Shared<TxRecord> {
        self.executor.execute(tx).unwrap();
        record
    }

    pub fn confirm(&mut self, step: Step) {
        self.executor.on_commit_result(step, FetchStatus::Ok);
    }

    pub fn provide(&mut self, label: Label, pages: &[PageId]) {
        self.executor.on_fetch_result(FetchResult {
            label,
            kind: FetchKind::Cache,
            status: FetchStatus::Ok,
            pages: loaded(pages),
        });
    }

    pub fn table_labels(&self, table: TableId) -> Vec<Label> {
        self.mocks
            .database
            .lock()
            .tables
            .get(&table)
            .map(|t| t.labels())
            .unwrap_or_default()
    }

    pub fn slices(&self, table: TableId, label: Label) -> Vec<Slice> {
        self.mocks
            .database
            .lock()
            .tables
            .get(&table)
            .and_then(|t| t.part(&label).map(|p| p.slices.clone()))
            .unwrap_or_default()
    }

    pub fn epoch(&self, table: TableId, label: Label) -> Option<Epoch> {
        self.mocks
            .database
            .lock()
            .tables
            .get(&table)
            .and_then(|t| t.part(&label).map(|p| p.epoch))
    }

    pub fn requested(&self, label: Label) -> Vec<PageId> {
        self.mocks.shared_cache.lock().requested_pages(&label)
    }

    pub fn broken(&self) -> Option<BrokenReason> {
        self.executor.broken_reason().cloned()
    }

    pub fn last_commit(&self) -> LogCommit {
        self.mocks.last_commit().unwrap()
    }

    /// First part switch record of the last commit.
    pub fn last_record(&self) -> PartSwitchRecord {
        let commit = self.last_commit();
        PartSwitchRecord::decode(&commit.switches[0]).unwrap()
    }

    pub fn blob_reads(&self) -> Vec<(Vec<BlobId>, SwitchHandle)> {
        self.mocks.blobs.lock().clone()
    }
}
