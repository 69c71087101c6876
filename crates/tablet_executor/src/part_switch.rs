//! Part-switch assembler.
//!
//! A part switch is one table's part-set change at a log step: parts lent by
//! another tablet, parts a follower replays from the leader's log, slice
//! changes and moves. Introduced parts are unusable until their metadata
//! blobs are read and their loader has pulled the index pages it needs, so
//! switches are assembled asynchronously and published in step order:
//! every switch of the front step is applied together, and only once all
//! of them are ready.
//!
//! Bundle stages: `Meta` (metadata blobs in flight) -> `Loader` (index pages
//! in flight through the shared cache) -> `Result` (a part view).
//!
//! Switches are addressed by monotonic [`SwitchHandle`]s so blob read
//! completions find their switch without holding references into the queue.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tablet_common::error::{BrokenReason, TabletError, TabletResult};
use tablet_common::types::{BlobId, Epoch, FetchStatus, Label, Step, SwitchHandle, TableId};

use crate::commit::{GcDelta, LogCommit};
use crate::executor::Executor;
use crate::interfaces::{
    Collaborators, FetchKind, FetchRequest, FetchResult, LoaderStep, PartLoader, Priority,
};
use crate::parts::{
    CachePolicy, ColdPart, PageFetch, PartComponents, PartView, TxStatusComponents, TxStatusPart,
};
use crate::stats::ExecutorStats;
use crate::wire::{
    BundleChange, BundleDelta, BundleMove, IntroducedBundle, Overlay, PartSwitchRecord,
    TableSnapshoted,
};

// ── Stages ─────────────────────────────────────────────────────────────────

/// Metadata blobs of a part being read.
#[derive(Debug)]
pub(crate) struct MetaStage {
    components: PartComponents,
    waiting: BTreeSet<BlobId>,
    loaded: BTreeMap<BlobId, Vec<u8>>,
}

impl MetaStage {
    fn new(components: PartComponents) -> Self {
        let waiting = components.meta_blobs.iter().copied().collect();
        Self {
            components,
            waiting,
            loaded: BTreeMap::new(),
        }
    }

    fn finished(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Returns true when the last awaited blob arrived.
    fn accept(&mut self, blob: BlobId, body: Vec<u8>) -> bool {
        if self.waiting.remove(&blob) {
            self.loaded.insert(blob, body);
        }
        self.finished()
    }
}

pub(crate) struct LoaderStage {
    loader: Box<dyn PartLoader>,
    /// Collection whose pages the loader is waiting for.
    fetching: Option<Label>,
}

pub(crate) enum BundleStage {
    Meta(MetaStage),
    Loader(LoaderStage),
    Result(PartView),
}

impl BundleStage {
    fn as_str(&self) -> &'static str {
        match self {
            BundleStage::Meta(_) => "meta",
            BundleStage::Loader(_) => "loader",
            BundleStage::Result(_) => "result",
        }
    }
}

pub(crate) struct NewBundle {
    label: Label,
    stage: BundleStage,
}

pub(crate) enum TxStatusStage {
    Load {
        /// Data blobs in concatenation order.
        blobs: Vec<BlobId>,
        loaded: BTreeMap<BlobId, Vec<u8>>,
    },
    Result(TxStatusPart),
}

pub(crate) struct NewTxStatus {
    label: Label,
    epoch: Epoch,
    stage: TxStatusStage,
}

/// Who waits for a metadata blob. Indexes point into the switch's vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlobWaiter {
    Bundle(usize),
    TxStatus(usize),
}

// ── Pending part switch ────────────────────────────────────────────────────

pub(crate) struct PendingPartSwitch {
    pub(crate) handle: SwitchHandle,
    pub(crate) table: TableId,
    pub(crate) step: Step,
    /// Set on followers: the leader step to acknowledge once applied.
    pub(crate) follower_update_step: Option<Step>,
    pub(crate) head: Epoch,
    pub(crate) new_bundles: Vec<NewBundle>,
    pub(crate) new_cold: Vec<ColdPart>,
    pub(crate) new_tx_status: Vec<NewTxStatus>,
    pub(crate) changed: Vec<BundleChange>,
    pub(crate) deltas: Vec<BundleDelta>,
    pub(crate) leaving: Vec<Label>,
    pub(crate) leaving_tx_status: Vec<Label>,
    pub(crate) moves: Vec<BundleMove>,
    pub(crate) pending_blobs: BTreeMap<BlobId, Vec<BlobWaiter>>,
    pub(crate) pending_loads: usize,
}

impl PendingPartSwitch {
    fn new(handle: SwitchHandle, table: TableId, step: Step) -> Self {
        Self {
            handle,
            table,
            step,
            follower_update_step: None,
            head: Epoch::zero(),
            new_bundles: Vec::new(),
            new_cold: Vec::new(),
            new_tx_status: Vec::new(),
            changed: Vec::new(),
            deltas: Vec::new(),
            leaving: Vec::new(),
            leaving_tx_status: Vec::new(),
            moves: Vec::new(),
            pending_blobs: BTreeMap::new(),
            pending_loads: 0,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.pending_blobs.is_empty() && self.pending_loads == 0
    }

    /// Returns true the first time `blob` is awaited, i.e. when it must be read.
    fn add_pending_blob(&mut self, blob: BlobId, waiter: BlobWaiter) -> bool {
        let waiters = self.pending_blobs.entry(blob).or_default();
        waiters.push(waiter);
        waiters.len() == 1
    }

    fn is_follower(&self) -> bool {
        self.follower_update_step.is_some()
    }
}

/// Ordered queue of switches. Handles grow by one per push, so a handle's
/// position is its distance from the front handle.
#[derive(Default)]
pub struct PendingSwitches {
    queue: VecDeque<PendingPartSwitch>,
    next_handle: u64,
    /// Length of the ready prefix already scanned.
    ready: usize,
}

impl PendingSwitches {
    pub(crate) fn push(&mut self, table: TableId, step: Step) -> SwitchHandle {
        let handle = SwitchHandle(self.next_handle);
        self.next_handle += 1;
        self.queue
            .push_back(PendingPartSwitch::new(handle, table, step));
        handle
    }

    pub(crate) fn get_mut(&mut self, handle: SwitchHandle) -> Option<&mut PendingPartSwitch> {
        let front = self.queue.front()?.handle.0;
        let index = handle.0.checked_sub(front)?;
        self.queue.get_mut(usize::try_from(index).ok()?)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingPartSwitch> {
        self.queue.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Every switch of the front step, once all of them are ready.
    pub(crate) fn pop_ready_step(&mut self) -> Option<Vec<PendingPartSwitch>> {
        let step = self.queue.front()?.step;
        while self
            .queue
            .get(self.ready)
            .is_some_and(PendingPartSwitch::is_ready)
        {
            self.ready += 1;
        }
        if self.queue.get(self.ready).is_some_and(|s| s.step == step) {
            return None;
        }
        let mut out = Vec::new();
        while self.ready > 0 && self.queue.front().is_some_and(|s| s.step == step) {
            if let Some(switch) = self.queue.pop_front() {
                out.push(switch);
            }
            self.ready -= 1;
        }
        Some(out)
    }
}

// ── Stage drivers ──────────────────────────────────────────────────────────

/// Add a hot part to `switch`. Returns true while the part is still loading.
fn prepare_part(
    io: &mut Collaborators,
    stats: &mut ExecutorStats,
    tablet_id: u64,
    switch: &mut PendingPartSwitch,
    components: PartComponents,
) -> bool {
    let label = components.label;
    if !switch.is_follower()
        && io.database.cold_borrow(switch.table)
        && label.tablet != tablet_id
    {
        switch.new_cold.push(ColdPart {
            label,
            epoch: components.epoch,
            components: components.meta_blobs,
            legacy: components.legacy,
            opaque: components.opaque,
        });
        return false;
    }

    switch.new_bundles.push(NewBundle {
        label,
        stage: BundleStage::Meta(MetaStage::new(components)),
    });
    let index = switch.new_bundles.len() - 1;
    drive_bundle(io, stats, switch, index)
}

/// Push a bundle through as many stages as possible. Returns true when it
/// waits for blobs or pages.
fn drive_bundle(
    io: &mut Collaborators,
    stats: &mut ExecutorStats,
    switch: &mut PendingPartSwitch,
    index: usize,
) -> bool {
    let table = switch.table;
    loop {
        let bundle = &mut switch.new_bundles[index];
        match &mut bundle.stage {
            BundleStage::Meta(stage) if !stage.finished() => {
                let blobs: Vec<BlobId> = stage.waiting.iter().copied().collect();
                let to_read: Vec<BlobId> = blobs
                    .into_iter()
                    .filter(|&blob| switch.add_pending_blob(blob, BlobWaiter::Bundle(index)))
                    .collect();
                if !to_read.is_empty() {
                    io.blobs.read(to_read, switch.handle);
                }
                return true;
            }
            BundleStage::Meta(stage) => {
                let meta = std::mem::take(&mut stage.loaded);
                let loader = io.database.open_loader(table, &stage.components, meta);
                bundle.stage = BundleStage::Loader(LoaderStage {
                    loader,
                    fetching: None,
                });
            }
            BundleStage::Loader(stage) => match stage.loader.run() {
                LoaderStep::Fetch(fetch) => {
                    stage.fetching = Some(fetch.label);
                    switch.pending_loads += 1;
                    stats.pages_requested += fetch.pages.len() as u64;
                    io.shared_cache.request(FetchRequest {
                        priority: Priority::Fast,
                        kind: FetchKind::PendingInit,
                        fetch,
                    });
                    return true;
                }
                LoaderStep::Ready(part) => {
                    bundle.stage = BundleStage::Result(part);
                    stats.bundles_loaded += 1;
                    return false;
                }
            },
            BundleStage::Result(_) => return false,
        }
    }
}

/// Add a tx status part to `switch`. Inline data needs no blob reads.
fn prepare_tx_status(
    io: &mut Collaborators,
    switch: &mut PendingPartSwitch,
    components: TxStatusComponents,
) -> bool {
    let stage = match components.data {
        Some(data) => TxStatusStage::Result(io.database.load_tx_status(
            switch.table,
            components.label,
            components.epoch,
            data,
        )),
        None => TxStatusStage::Load {
            blobs: components.blobs,
            loaded: BTreeMap::new(),
        },
    };
    switch.new_tx_status.push(NewTxStatus {
        label: components.label,
        epoch: components.epoch,
        stage,
    });
    let index = switch.new_tx_status.len() - 1;
    drive_tx_status(io, switch, index)
}

fn drive_tx_status(io: &mut Collaborators, switch: &mut PendingPartSwitch, index: usize) -> bool {
    let table = switch.table;
    let tx_status = &mut switch.new_tx_status[index];
    let TxStatusStage::Load { blobs, loaded } = &mut tx_status.stage else {
        return false;
    };
    let missing: Vec<BlobId> = blobs
        .iter()
        .filter(|b| !loaded.contains_key(b))
        .copied()
        .collect();
    if missing.is_empty() {
        let data: Vec<u8> = blobs
            .iter()
            .filter_map(|b| loaded.remove(b))
            .flatten()
            .collect();
        let part = io
            .database
            .load_tx_status(table, tx_status.label, tx_status.epoch, data);
        tx_status.stage = TxStatusStage::Result(part);
        return false;
    }

    let to_read: Vec<BlobId> = missing
        .into_iter()
        .filter(|&blob| switch.add_pending_blob(blob, BlobWaiter::TxStatus(index)))
        .collect();
    if !to_read.is_empty() {
        io.blobs.read(to_read, switch.handle);
    }
    true
}

/// Route loaded blobs to their waiters. Returns true while some waiter
/// still waits.
fn accept_blobs(
    io: &mut Collaborators,
    stats: &mut ExecutorStats,
    switch: &mut PendingPartSwitch,
    blobs: Vec<(BlobId, Vec<u8>)>,
) -> Result<bool, BrokenReason> {
    let mut waiting = false;
    for (blob, body) in blobs {
        let Some(waiters) = switch.pending_blobs.remove(&blob) else {
            return Err(BrokenReason::UnknownSwitch { blob });
        };
        for waiter in waiters {
            match waiter {
                BlobWaiter::Bundle(index) => {
                    let finished = match switch.new_bundles.get_mut(index).map(|b| &mut b.stage) {
                        Some(BundleStage::Meta(stage)) if !stage.finished() => {
                            stage.accept(blob, body.clone())
                        }
                        _ => return Err(BrokenReason::UnexpectedStage { blob }),
                    };
                    if finished {
                        waiting |= drive_bundle(io, stats, switch, index);
                    }
                }
                BlobWaiter::TxStatus(index) => {
                    let finished = match switch.new_tx_status.get_mut(index).map(|t| &mut t.stage) {
                        Some(TxStatusStage::Load { blobs, loaded }) if blobs.contains(&blob) => {
                            loaded.insert(blob, body.clone());
                            blobs.iter().all(|b| loaded.contains_key(b))
                        }
                        _ => return Err(BrokenReason::UnexpectedStage { blob }),
                    };
                    if finished {
                        waiting |= drive_tx_status(io, switch, index);
                    }
                }
            }
        }
    }
    Ok(waiting)
}

fn corrupted(err: TabletError) -> BrokenReason {
    BrokenReason::Corrupted(err.to_string())
}

// ── Executor: assembly and publication ─────────────────────────────────────

impl Executor {
    fn prepare_external_part(&mut self, handle: SwitchHandle, components: PartComponents) -> bool {
        let tablet_id = self.config.tablet_id;
        match self.switches.get_mut(handle) {
            Some(switch) => prepare_part(&mut self.io, &mut self.stats, tablet_id, switch, components),
            None => false,
        }
    }

    fn prepare_external_tx_status(
        &mut self,
        handle: SwitchHandle,
        components: TxStatusComponents,
    ) -> bool {
        match self.switches.get_mut(handle) {
            Some(switch) => prepare_tx_status(&mut self.io, switch, components),
            None => false,
        }
    }

    /// Metadata blobs requested through the blob reader arrived.
    pub fn on_blob_result(
        &mut self,
        handle: SwitchHandle,
        status: FetchStatus,
        blobs: Vec<(BlobId, Vec<u8>)>,
    ) {
        if self.broken.is_some() {
            return;
        }
        if status != FetchStatus::Ok {
            self.become_broken(BrokenReason::BlobReadFailed { status });
            return;
        }
        let first = blobs.first().map(|(blob, _)| *blob).unwrap_or_default();
        let result = match self.switches.get_mut(handle) {
            Some(switch) => accept_blobs(&mut self.io, &mut self.stats, switch, blobs),
            None => Err(BrokenReason::UnknownSwitch { blob: first }),
        };
        match result {
            Ok(true) => {}
            Ok(false) => self.advance_pending_part_switches(),
            Err(reason) => self.become_broken(reason),
        }
        self.pump();
    }

    /// Index pages a part loader asked for arrived.
    pub(crate) fn on_pending_init_result(&mut self, result: FetchResult) {
        let label = result.label;
        let found = self.switches.iter_mut().find_map(|switch| {
            let index = switch.new_bundles.iter_mut().position(|b| match &mut b.stage {
                BundleStage::Loader(stage) if stage.fetching == Some(label) => {
                    stage.fetching = None;
                    true
                }
                _ => false,
            })?;
            Some((switch.handle, index))
        });
        let Some((handle, index)) = found else {
            tracing::debug!(label = %label, "loader pages for no pending switch");
            return;
        };

        if result.status != FetchStatus::Ok {
            if result.status == FetchStatus::NoData {
                self.stats.alerts_pending_nodata += 1;
            }
            self.become_broken(BrokenReason::PendingLoadFailed {
                label,
                status: result.status,
            });
            return;
        }

        let waiting = match self.switches.get_mut(handle) {
            Some(switch) => {
                if let BundleStage::Loader(stage) = &mut switch.new_bundles[index].stage {
                    stage.loader.save(result.pages);
                }
                switch.pending_loads = switch.pending_loads.saturating_sub(1);
                drive_bundle(&mut self.io, &mut self.stats, switch, index)
            }
            None => true,
        };
        if !waiting {
            self.advance_pending_part_switches();
        }
    }

    pub(crate) fn advance_pending_part_switches(&mut self) {
        self.apply_ready_part_switches();
        if self.switches.is_empty() {
            self.plan_transaction_activation();
        }
    }

    /// Publish ready switches in step order. Returns true when the queue
    /// drained completely.
    pub(crate) fn apply_ready_part_switches(&mut self) -> bool {
        while !self.switches.is_empty() {
            let Some(ready) = self.switches.pop_ready_step() else {
                return false;
            };
            for switch in ready {
                if let Err(reason) = self.apply_external_part_switch(switch) {
                    self.become_broken(reason);
                    return false;
                }
            }
        }
        true
    }

    fn apply_external_part_switch(&mut self, switch: PendingPartSwitch) -> Result<(), BrokenReason> {
        let table = switch.table;

        let mut new_parts = Vec::with_capacity(switch.new_bundles.len());
        for bundle in switch.new_bundles {
            let stage = bundle.stage.as_str();
            let BundleStage::Result(part) = bundle.stage else {
                return Err(BrokenReason::Corrupted(format!(
                    "bundle {} published in {} stage",
                    bundle.label, stage
                )));
            };
            self.add_single_cache(part.label, part.page_count, part.page_size);
            self.request_in_mem_pages(table, &part);
            new_parts.push(part);
        }

        let mut new_tx_status = Vec::with_capacity(switch.new_tx_status.len());
        for tx_status in switch.new_tx_status {
            let TxStatusStage::Result(part) = tx_status.stage else {
                return Err(BrokenReason::Corrupted(format!(
                    "tx status {} published before it loaded",
                    tx_status.label
                )));
            };
            new_tx_status.push(part);
        }

        if !switch.changed.is_empty() {
            let mut updated = BTreeMap::new();
            for change in &switch.changed {
                let overlay = Overlay::decode(&change.legacy, &change.opaque).map_err(corrupted)?;
                if overlay.slices.is_empty() {
                    return Err(BrokenReason::Corrupted(format!(
                        "change for bundle {} has empty slices",
                        change.label
                    )));
                }
                updated.insert(change.label, overlay.slices);
            }
            self.io.database.replace_slices(table, updated);
        }

        if !switch.deltas.is_empty() {
            let labels: Vec<Label> = switch.deltas.iter().map(|d| d.label).collect();
            let mut updated = self.io.database.lookup_slices(table, &labels);
            for delta in &switch.deltas {
                let Some(slices) = updated.get_mut(&delta.label) else {
                    return Err(BrokenReason::MissingSlices {
                        table,
                        label: delta.label,
                    });
                };
                let mut overlay = Overlay::new(std::mem::take(slices));
                overlay.apply_delta(&delta.delta).map_err(corrupted)?;
                *slices = overlay.slices;
            }
            self.io.database.replace_slices(table, updated);
        }

        if let Some(update_step) = switch.follower_update_step {
            let leaving: Vec<Label> = switch
                .leaving
                .iter()
                .chain(switch.leaving_tx_status.iter())
                .copied()
                .collect();
            let subset = self.io.database.subset_of(table, &leaving, switch.head);
            if subset.head != switch.head {
                return Err(BrokenReason::FollowerHeadDiverged { table });
            }
            if !switch.new_cold.is_empty() {
                return Err(BrokenReason::Corrupted(format!(
                    "cold part in a follower switch of {}",
                    table
                )));
            }
            self.io.database.replace(table, new_parts, &subset);
            self.io
                .database
                .replace_tx_status(table, new_tx_status, &subset);
            for gone in &subset.flatten {
                self.drop_single_cache(gone.label);
            }
            self.io.owner.follower_gc_ack(update_step);
        } else {
            for part in new_parts {
                let (label, epoch) = (part.label, part.epoch);
                self.io.database.merge(table, part);
                self.io.compaction.borrowed_part(table, label, epoch);
            }
            for part in switch.new_cold {
                let (label, epoch) = (part.label, part.epoch);
                self.io.database.merge_cold(table, part);
                self.io.compaction.borrowed_part(table, label, epoch);
            }
            for part in new_tx_status {
                self.io.database.merge_tx_status(table, part);
            }
        }

        if !switch.moves.is_empty() {
            self.apply_moves(table, &switch.moves);
        }

        self.stats.part_switches_applied += 1;
        tracing::info!(table = %table, step = switch.step, follower = switch.follower_update_step.is_some(), "part switch applied");
        Ok(())
    }

    /// Replay moves recorded by the leader: rebase and transfer the parts.
    fn apply_moves(&mut self, table: TableId, moves: &[BundleMove]) {
        let mut per_table: BTreeMap<TableId, (Vec<Label>, HashMap<Label, Epoch>)> = BTreeMap::new();
        for mv in moves {
            let (labels, epochs) = per_table.entry(mv.source_table).or_default();
            labels.push(mv.label);
            if let Some(epoch) = mv.rebased_epoch {
                epochs.insert(mv.label, epoch);
            }
        }

        for (source, (labels, epochs)) in per_table {
            let subset = self.io.database.subset_of(source, &labels, Epoch::zero());
            let rebased: Vec<PartView> = subset
                .flatten
                .iter()
                .map(|p| p.clone_with_epoch(epochs.get(&p.label).copied().unwrap_or(p.epoch)))
                .collect();
            self.io.database.replace(source, Vec::new(), &subset);
            self.io.compaction.removed_parts(source, &labels);
            for part in rebased {
                let (label, epoch) = (part.label, part.epoch);
                self.io.database.merge(table, part);
                self.io.compaction.borrowed_part(table, label, epoch);
            }
        }
    }

    /// Always-resident tables keep every data page of a new part sticky.
    pub(crate) fn request_in_mem_pages(&mut self, table: TableId, part: &PartView) {
        if self.io.database.cache_policy(table) != CachePolicy::Ever {
            return;
        }
        let pages = part.data_pages();
        for &page in &pages {
            self.cache.mark_sticky(&part.label, page);
        }
        let (requested, bytes) = self.cache.load(&part.label, &pages, None);
        if requested.is_empty() {
            return;
        }
        self.stats.pages_requested += requested.len() as u64;
        self.stats.bytes_requested += bytes;
        self.io.shared_cache.request(FetchRequest {
            priority: Priority::Background,
            kind: FetchKind::CacheSync,
            fetch: PageFetch {
                label: part.label,
                pages: requested,
            },
        });
    }

    // ── Creation paths ─────────────────────────────────────────────────────

    /// Queue the switches the leader wrote at `step`. All records of the
    /// step are queued before any of them may publish; `update_step` is
    /// acknowledged to the owner once they are applied.
    pub fn add_follower_part_switch(
        &mut self,
        update_step: Step,
        step: Step,
        records: &[Vec<u8>],
    ) -> TabletResult<()> {
        if let Some(reason) = &self.broken {
            return Err(TabletError::Broken(reason.clone()));
        }
        if !self.config.follower {
            return Err(TabletError::Role("part switch replay is follower only"));
        }
        let records = records
            .iter()
            .map(|bytes| PartSwitchRecord::decode(bytes))
            .collect::<TabletResult<Vec<_>>>()?;

        let had_pending = !self.switches.is_empty();
        for record in records {
            self.queue_follower_part_switch(update_step, step, record);
        }
        if !had_pending {
            self.advance_pending_part_switches();
        }
        self.pump();
        Ok(())
    }

    fn queue_follower_part_switch(&mut self, update_step: Step, step: Step, record: PartSwitchRecord) {
        let handle = self.switches.push(record.table, step);
        if let Some(switch) = self.switches.get_mut(handle) {
            switch.follower_update_step = Some(update_step);
            if let Some(snapshoted) = record.table_snapshoted {
                switch.head = snapshoted.head;
            }
            switch.changed = record.changed_bundles;
            switch.deltas = record.bundle_deltas;
            switch.leaving = record.leaving_bundles;
            switch.leaving_tx_status = record.leaving_tx_status;
            switch.moves = record.bundle_moves;
        }
        tracing::debug!(table = %record.table, step, update_step, parts = record.introduced_parts.len(), "follower part switch queued");

        for bundle in record.introduced_parts {
            self.prepare_external_part(handle, bundle.components);
        }
        for tx_status in record.introduced_tx_status {
            self.prepare_external_tx_status(handle, tx_status);
        }
    }

    /// A transaction attached a part lent by another tablet. The switch is
    /// published once the part is loaded.
    pub(crate) fn loan_bundle(
        &mut self,
        commit: &mut LogCommit,
        table: TableId,
        components: PartComponents,
    ) -> Result<(), BrokenReason> {
        let handle = self.switches.push(table, commit.step);
        self.io.borrow.loan_bundle(components.label, table, commit);

        let mut record = PartSwitchRecord::new(table);
        record.table_snapshoted = Some(self.cut_log_for_loan(table, commit.step, components.epoch)?);
        record.introduced_parts.push(IntroducedBundle {
            components: components.clone(),
            level: self.io.compaction.borrowed_part_level(),
        });
        commit.switches.push(record.encode().map_err(corrupted)?);

        tracing::debug!(table = %table, label = %components.label, step = commit.step, "loaned bundle");
        self.prepare_external_part(handle, components);
        Ok(())
    }

    pub(crate) fn loan_tx_status(
        &mut self,
        commit: &mut LogCommit,
        table: TableId,
        components: TxStatusComponents,
    ) -> Result<(), BrokenReason> {
        let handle = self.switches.push(table, commit.step);
        self.io.borrow.loan_tx_status(components.label, table, commit);

        let mut record = PartSwitchRecord::new(table);
        record.table_snapshoted = Some(self.cut_log_for_loan(table, commit.step, components.epoch)?);
        record.introduced_tx_status.push(components.clone());
        commit.switches.push(record.encode().map_err(corrupted)?);

        self.prepare_external_tx_status(handle, components);
        Ok(())
    }

    /// Loaned parts land above the table head, so the log is cut there.
    fn cut_log_for_loan(
        &mut self,
        table: TableId,
        step: Step,
        epoch: Epoch,
    ) -> Result<TableSnapshoted, BrokenReason> {
        let head = Epoch(epoch.0.max(0)).next();
        let mut gc = GcDelta::default();
        self.io.redo.cut_log(table, step, head, &mut gc);
        if !gc.is_empty() {
            return Err(BrokenReason::Corrupted(format!(
                "log cut for a loan on {} touched blobs",
                table
            )));
        }
        Ok(TableSnapshoted {
            table,
            generation: self.config.generation,
            step,
            head,
        })
    }

    /// Move every frozen part of `source` below the oldest part of
    /// `destination`. Newer source epochs stay newer after the rebase.
    pub(crate) fn move_table_parts(
        &mut self,
        commit: &mut LogCommit,
        source: TableId,
        destination: TableId,
    ) -> Result<(), BrokenReason> {
        let source_head = self.io.database.head(source);
        let mut src = self.io.database.subset(source, source_head);
        let dst = self.io.database.subset(destination, Epoch::MAX);
        if src.flatten.is_empty() {
            return Ok(());
        }

        src.flatten
            .sort_by(|a, b| b.epoch.cmp(&a.epoch).then_with(|| a.label.cmp(&b.label)));

        let mut src_epoch = src.flatten[0].epoch;
        let mut dst_epoch = dst
            .flatten
            .iter()
            .map(|p| p.epoch)
            .fold(Epoch::zero(), Epoch::min);
        dst_epoch = Epoch(dst_epoch.0 - 1);

        let mut labels = Vec::with_capacity(src.flatten.len());
        let mut rebased = Vec::with_capacity(src.flatten.len());
        for part in &src.flatten {
            if part.epoch != src_epoch {
                src_epoch = part.epoch;
                dst_epoch = Epoch(dst_epoch.0 - 1);
            }
            labels.push(part.label);
            rebased.push(part.clone_with_epoch(dst_epoch));
        }

        self.io.database.replace(source, Vec::new(), &src);
        self.io.compaction.removed_parts(source, &labels);

        let mut record = PartSwitchRecord::new(destination);
        for part in rebased {
            record.bundle_moves.push(BundleMove {
                label: part.label,
                rebased_epoch: Some(part.epoch),
                source_table: source,
            });
            let (label, epoch) = (part.label, part.epoch);
            self.io.database.merge(destination, part);
            self.io.compaction.borrowed_part(destination, label, epoch);
        }
        commit.switches.push(record.encode().map_err(corrupted)?);
        tracing::info!(source = %source, destination = %destination, parts = labels.len(), step = commit.step, "parts moved");
        Ok(())
    }
}
