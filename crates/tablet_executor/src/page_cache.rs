//! Tablet-private view of the page cache.
//!
//! Tracks, per page collection, the load state and pin count of every page
//! the tablet has looked at, plus the wait pads blocked on in-flight loads.
//! Page bodies are owned by the shared cache; this adapter only keeps
//! references to them while they are useful to the tablet.
//!
//! Page states:
//! - `No`:             body unknown locally
//! - `Requested`:      fetch in flight on behalf of a waiting consumer
//! - `RequestedAsync`: fetch in flight nobody waits for (sticky preload)
//! - `Loaded`:         body available
//!
//! A page is evictable only when unpinned and not sticky.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tablet_common::types::{Label, PageId, WaitPadId};

use crate::parts::LoadedPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    No,
    Requested,
    RequestedAsync,
    Loaded,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::No => "no",
            LoadState::Requested => "requested",
            LoadState::RequestedAsync => "requested_async",
            LoadState::Loaded => "loaded",
        }
    }

    pub fn in_flight(&self) -> bool {
        matches!(self, LoadState::Requested | LoadState::RequestedAsync)
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Page {
    state: LoadState,
    body: Option<Arc<[u8]>>,
    pins: u32,
    sticky: bool,
    waiters: Vec<WaitPadId>,
}

impl Page {
    fn evictable(&self) -> bool {
        self.pins == 0 && !self.sticky && self.state == LoadState::Loaded
    }
}

/// One registered page collection.
#[derive(Debug)]
pub struct CollectionInfo {
    pub label: Label,
    pub page_count: u32,
    pub page_size: u64,
    pages: BTreeMap<PageId, Page>,
    /// Scans holding the collection open.
    users: u32,
    /// Forget requested while users were attached.
    forgotten: bool,
}

impl CollectionInfo {
    fn new(label: Label, page_count: u32, page_size: u64) -> Self {
        Self {
            label,
            page_count,
            page_size,
            pages: BTreeMap::new(),
            users: 0,
            forgotten: false,
        }
    }
}

/// Immutable snapshot of private cache state for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCacheSnapshot {
    pub collections: u64,
    /// Pages with at least one pin.
    pub pinned_set_size: u64,
    /// Pinned pages still waiting for their body.
    pub pinned_load_size: u64,
    pub loaded_bytes: u64,
    pub sticky_bytes: u64,
    pub waiting_pads: u64,
    pub pages_requested: u64,
    pub pages_provided: u64,
    pub pages_evicted: u64,
    pub touches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pages_requested: u64,
    pages_provided: u64,
    pages_evicted: u64,
    touches: u64,
}

#[derive(Debug, Default)]
pub struct PrivatePageCache {
    collections: HashMap<Label, CollectionInfo>,
    /// Wait pad -> pages it still waits for.
    pads: HashMap<WaitPadId, usize>,
    next_pad: u64,
    counters: Counters,
}

impl PrivatePageCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Collections ────────────────────────────────────────────────────────

    /// Returns false if the collection was already registered.
    pub fn register_collection(&mut self, label: Label, page_count: u32, page_size: u64) -> bool {
        if let Some(info) = self.collections.get_mut(&label) {
            info.forgotten = false;
            return false;
        }
        self.collections
            .insert(label, CollectionInfo::new(label, page_count, page_size));
        true
    }

    pub fn has_collection(&self, label: &Label) -> bool {
        self.collections.contains_key(label)
    }

    pub fn info(&self, label: &Label) -> Option<&CollectionInfo> {
        self.collections.get(label)
    }

    pub fn page_size(&self, label: &Label) -> u64 {
        self.collections.get(label).map_or(0, |i| i.page_size)
    }

    /// Hold the collection open for a scan.
    pub fn lock_collection(&mut self, label: &Label) {
        if let Some(info) = self.collections.get_mut(label) {
            info.users += 1;
        }
    }

    /// Release a scan hold. When a deferred forget drops the collection, the
    /// pads released by it are returned.
    pub fn unlock_collection(&mut self, label: &Label) -> Option<Vec<WaitPadId>> {
        let drop_now = match self.collections.get_mut(label) {
            Some(info) => {
                info.users = info.users.saturating_sub(1);
                info.users == 0 && info.forgotten
            }
            None => false,
        };
        drop_now.then(|| self.remove_collection(label))
    }

    /// Drop a collection whose part left the table. Pads waiting on its
    /// pages are released and returned for reactivation. A collection held
    /// by a scan is dropped on the last unlock instead.
    pub fn forget_collection(&mut self, label: &Label) -> Vec<WaitPadId> {
        match self.collections.get_mut(label) {
            Some(info) if info.users > 0 => {
                info.forgotten = true;
                Vec::new()
            }
            Some(_) => self.remove_collection(label),
            None => Vec::new(),
        }
    }

    fn remove_collection(&mut self, label: &Label) -> Vec<WaitPadId> {
        let mut ready = Vec::new();
        if let Some(info) = self.collections.remove(label) {
            for page in info.pages.into_values() {
                for pad in page.waiters {
                    Self::release_pad(&mut self.pads, pad, &mut ready);
                }
            }
        }
        ready
    }

    // ── Lookup and pins ────────────────────────────────────────────────────

    /// Body of a loaded page.
    pub fn lookup(&self, label: &Label, page: PageId) -> Option<Arc<[u8]>> {
        let info = self.collections.get(label)?;
        let page = info.pages.get(&page)?;
        match page.state {
            LoadState::Loaded => page.body.clone(),
            _ => None,
        }
    }

    pub fn state(&self, label: &Label, page: PageId) -> LoadState {
        self.collections
            .get(label)
            .and_then(|i| i.pages.get(&page))
            .map_or(LoadState::No, |p| p.state)
    }

    /// Record a page use by a finished transaction.
    pub fn touch(&mut self, label: &Label, page: PageId) {
        if let Some(info) = self.collections.get_mut(label) {
            if info.pages.contains_key(&page) {
                self.counters.touches += 1;
            }
        }
    }

    pub fn pin(&mut self, label: &Label, page: PageId) -> bool {
        match self.collections.get_mut(label) {
            Some(info) => {
                info.pages.entry(page).or_default().pins += 1;
                true
            }
            None => false,
        }
    }

    /// Returns true when the page has no pins left. Never goes below zero.
    pub fn unpin(&mut self, label: &Label, page: PageId) -> bool {
        let Some(info) = self.collections.get_mut(label) else {
            return false;
        };
        let Some(entry) = info.pages.get_mut(&page) else {
            tracing::error!(label = %label, page, "unpin of untracked page");
            return false;
        };
        if entry.pins == 0 {
            tracing::error!(label = %label, page, "unpin of page without pins");
            return false;
        }
        entry.pins -= 1;
        entry.pins == 0
    }

    pub fn pins(&self, label: &Label, page: PageId) -> u32 {
        self.collections
            .get(label)
            .and_then(|i| i.pages.get(&page))
            .map_or(0, |p| p.pins)
    }

    pub fn is_evictable(&self, label: &Label, page: PageId) -> bool {
        self.collections
            .get(label)
            .and_then(|i| i.pages.get(&page))
            .is_some_and(|p| p.evictable())
    }

    pub fn mark_sticky(&mut self, label: &Label, page: PageId) {
        if let Some(info) = self.collections.get_mut(label) {
            info.pages.entry(page).or_default().sticky = true;
        }
    }

    // ── Loads ──────────────────────────────────────────────────────────────

    pub fn new_pad(&mut self) -> WaitPadId {
        self.next_pad += 1;
        WaitPadId(self.next_pad)
    }

    pub fn has_pad(&self, pad: &WaitPadId) -> bool {
        self.pads.contains_key(pad)
    }

    /// Register `pad` (if any) as waiting for every page in `pages` that is
    /// not loaded yet, and mark never-requested pages as requested.
    ///
    /// Returns the pages that need a fetch and their total size.
    pub fn load(
        &mut self,
        label: &Label,
        pages: &[PageId],
        pad: Option<WaitPadId>,
    ) -> (Vec<PageId>, u64) {
        let Some(info) = self.collections.get_mut(label) else {
            return (Vec::new(), 0);
        };
        let mut requested = Vec::new();
        let mut waiting = 0usize;
        for &id in pages {
            let page = info.pages.entry(id).or_default();
            match page.state {
                LoadState::Loaded => continue,
                LoadState::No => {
                    page.state = if pad.is_some() {
                        LoadState::Requested
                    } else {
                        LoadState::RequestedAsync
                    };
                    requested.push(id);
                }
                LoadState::Requested | LoadState::RequestedAsync => {
                    if pad.is_some() {
                        page.state = LoadState::Requested;
                    }
                }
            }
            if let Some(pad) = pad {
                if !page.waiters.contains(&pad) {
                    page.waiters.push(pad);
                    waiting += 1;
                }
            }
        }
        if let Some(pad) = pad {
            if waiting > 0 {
                *self.pads.entry(pad).or_insert(0) += waiting;
            }
        }
        self.counters.pages_requested += requested.len() as u64;
        let bytes = requested.len() as u64 * info.page_size;
        (requested, bytes)
    }

    /// Deliver a fetched page. Returns the pads whose last awaited page this was.
    pub fn provide_page(&mut self, label: &Label, loaded: LoadedPage) -> Vec<WaitPadId> {
        let mut ready = Vec::new();
        let Some(info) = self.collections.get_mut(label) else {
            return ready;
        };
        let page = info.pages.entry(loaded.page).or_default();
        page.state = LoadState::Loaded;
        page.body = Some(loaded.body);
        self.counters.pages_provided += 1;
        for pad in std::mem::take(&mut page.waiters) {
            Self::release_pad(&mut self.pads, pad, &mut ready);
        }
        ready
    }

    fn release_pad(pads: &mut HashMap<WaitPadId, usize>, pad: WaitPadId, ready: &mut Vec<WaitPadId>) {
        if let Some(pending) = pads.get_mut(&pad) {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                pads.remove(&pad);
                ready.push(pad);
            }
        }
    }

    // ── Shared cache notifications ─────────────────────────────────────────

    /// The shared cache accepted a body for one of our pages.
    pub fn update_shared_body(&mut self, label: &Label, loaded: LoadedPage) {
        if let Some(info) = self.collections.get_mut(label) {
            if let Some(page) = info.pages.get_mut(&loaded.page) {
                if page.state == LoadState::Loaded {
                    page.body = Some(loaded.body);
                }
            }
        }
    }

    /// The shared cache evicted a page. The local reference is dropped unless
    /// the page is pinned or sticky. Returns true when it was dropped.
    pub fn drop_shared_body(&mut self, label: &Label, page: PageId) -> bool {
        let Some(info) = self.collections.get_mut(label) else {
            return false;
        };
        let Some(entry) = info.pages.get_mut(&page) else {
            return false;
        };
        if !entry.evictable() {
            return false;
        }
        entry.state = LoadState::No;
        entry.body = None;
        self.counters.pages_evicted += 1;
        true
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> PageCacheSnapshot {
        let mut snap = PageCacheSnapshot {
            collections: self.collections.len() as u64,
            waiting_pads: self.pads.len() as u64,
            pages_requested: self.counters.pages_requested,
            pages_provided: self.counters.pages_provided,
            pages_evicted: self.counters.pages_evicted,
            touches: self.counters.touches,
            ..Default::default()
        };
        for info in self.collections.values() {
            for page in info.pages.values() {
                let loaded = page.state == LoadState::Loaded;
                if page.pins > 0 {
                    snap.pinned_set_size += 1;
                    if !loaded {
                        snap.pinned_load_size += 1;
                    }
                }
                if loaded {
                    snap.loaded_bytes += info.page_size;
                    if page.sticky {
                        snap.sticky_bytes += info.page_size;
                    }
                }
            }
        }
        snap
    }
}
