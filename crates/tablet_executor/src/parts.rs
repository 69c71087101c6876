//! Part-level data model shared by the executor and its collaborators.
//!
//! Parts are immutable. The executor never looks inside them beyond the
//! label, epoch, slices and page geometry needed for caching and for the
//! part switch records it writes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tablet_common::types::{BlobId, Epoch, Label, PageId, TableId};

/// Inclusive row range of a part that is still visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slice {
    pub first_row: u64,
    pub last_row: u64,
}

impl Slice {
    pub fn new(first_row: u64, last_row: u64) -> Self {
        Self {
            first_row,
            last_row,
        }
    }

    pub fn rows(&self) -> u64 {
        self.last_row - self.first_row + 1
    }

    pub fn overlaps(&self, other: &Slice) -> bool {
        self.first_row <= other.last_row && other.first_row <= self.last_row
    }
}

/// Replace every slice of `current` that overlaps one of `new_slices` with
/// the new slices. The result is sorted by first row.
pub fn replace_slices(current: &[Slice], new_slices: &[Slice]) -> Vec<Slice> {
    let mut out: Vec<Slice> = current
        .iter()
        .filter(|s| !new_slices.iter().any(|n| n.overlaps(s)))
        .copied()
        .collect();
    out.extend_from_slice(new_slices);
    out.sort();
    out.dedup();
    out
}

/// Remove `removed` slices from `current` (exact matches).
pub fn remove_slices(current: &[Slice], removed: &[Slice]) -> Vec<Slice> {
    let gone: BTreeSet<&Slice> = removed.iter().collect();
    current.iter().filter(|s| !gone.contains(s)).copied().collect()
}

/// Fully materialized hot part, ready to be merged into the table database.
#[derive(Debug, Clone, PartialEq)]
pub struct PartView {
    pub label: Label,
    pub epoch: Epoch,
    pub slices: Vec<Slice>,
    /// Pages in the part's page collection.
    pub page_count: u32,
    /// Bytes per page, used for pin accounting.
    pub page_size: u64,
    /// Every blob owned by the part (reported to GC when the part is created).
    pub blobs: Vec<BlobId>,
}

impl PartView {
    pub fn clone_with_epoch(&self, epoch: Epoch) -> PartView {
        PartView {
            epoch,
            ..self.clone()
        }
    }

    pub fn data_pages(&self) -> Vec<PageId> {
        (0..self.page_count).collect()
    }
}

/// Part whose blobs belong to another tablet and are not loaded locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ColdPart {
    pub label: Label,
    pub epoch: Epoch,
    pub components: Vec<Label>,
    pub legacy: Vec<u8>,
    pub opaque: Vec<u8>,
}

/// Committed/removed transaction status part.
#[derive(Debug, Clone, PartialEq)]
pub struct TxStatusPart {
    pub label: Label,
    pub epoch: Epoch,
    pub data: Vec<u8>,
    pub blobs: Vec<BlobId>,
}

/// A consistent selection of a table's parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Subset {
    pub table: TableId,
    /// Epoch of the in-memory head at the moment the subset was taken.
    pub head: Epoch,
    pub flatten: Vec<PartView>,
    pub cold: Vec<ColdPart>,
    pub tx_status: Vec<TxStatusPart>,
}

impl Subset {
    pub fn empty(table: TableId, head: Epoch) -> Self {
        Self {
            table,
            head,
            flatten: Vec::new(),
            cold: Vec::new(),
            tx_status: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flatten.is_empty() && self.cold.is_empty() && self.tx_status.is_empty()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.flatten.iter().any(|p| &p.label == label) || self.cold.iter().any(|p| &p.label == label)
    }

    pub fn labels(&self) -> Vec<Label> {
        self.flatten
            .iter()
            .map(|p| p.label)
            .chain(self.cold.iter().map(|p| p.label))
            .collect()
    }
}

/// Unresolved reference to a hot part: the part can only be used after its
/// metadata blobs are read and its loader has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartComponents {
    pub label: Label,
    pub epoch: Epoch,
    pub meta_blobs: Vec<BlobId>,
    /// Slice overlay in legacy (screen) form.
    pub legacy: Vec<u8>,
    /// Slice overlay in opaque form.
    pub opaque: Vec<u8>,
}

/// Unresolved reference to a tx status part. Small parts carry their data
/// inline and need no blob reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxStatusComponents {
    pub label: Label,
    pub epoch: Epoch,
    pub blobs: Vec<BlobId>,
    pub data: Option<Vec<u8>>,
}

/// Per-table cache residency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Pages are loaded on demand.
    #[default]
    Once,
    /// Pages are loaded eagerly and never evicted.
    Ever,
}

/// Output of committing a transaction against the table database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub serial: u64,
    pub redo: Vec<u8>,
    pub affects: Vec<TableId>,
    pub annex: Vec<BlobId>,
    pub scheme: bool,
    pub removed_row_versions: bool,
}

impl ChangeSet {
    pub fn has_any(&self) -> bool {
        !self.redo.is_empty() || self.scheme || self.removed_row_versions
    }
}

/// A page body delivered by the shared cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPage {
    pub page: PageId,
    pub body: Arc<[u8]>,
}

impl LoadedPage {
    pub fn new(page: PageId, body: impl Into<Arc<[u8]>>) -> Self {
        Self {
            page,
            body: body.into(),
        }
    }
}

/// Pages requested from a single page collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFetch {
    pub label: Label,
    pub pages: Vec<PageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_slices_overwrites_overlapping() {
        let current = vec![Slice::new(0, 9), Slice::new(10, 19), Slice::new(20, 29)];
        let out = replace_slices(&current, &[Slice::new(12, 15)]);
        assert_eq!(out, vec![Slice::new(0, 9), Slice::new(12, 15), Slice::new(20, 29)]);
    }

    #[test]
    fn test_remove_slices_exact() {
        let current = vec![Slice::new(0, 9), Slice::new(10, 19)];
        let out = remove_slices(&current, &[Slice::new(0, 9), Slice::new(40, 50)]);
        assert_eq!(out, vec![Slice::new(10, 19)]);
    }

    #[test]
    fn test_subset_labels_include_cold() {
        let label = |c| BlobId::new(1, 1, 1, c);
        let mut subset = Subset::empty(TableId(1), Epoch(3));
        subset.flatten.push(PartView {
            label: label(1),
            epoch: Epoch(1),
            slices: vec![],
            page_count: 0,
            page_size: 0,
            blobs: vec![],
        });
        subset.cold.push(ColdPart {
            label: label(2),
            epoch: Epoch(2),
            components: vec![],
            legacy: vec![],
            opaque: vec![],
        });
        assert_eq!(subset.labels(), vec![label(1), label(2)]);
        assert!(subset.contains(&label(2)));
        assert!(!subset.is_empty());
    }
}
