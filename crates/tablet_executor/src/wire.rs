//! Persisted part switch records and slice overlays.
//!
//! A part switch record describes one table's part-set change at a log step.
//! Records travel inside log commits and are replayed by followers, so the
//! executor both writes them (compaction, loans, compaction changes) and
//! reads them back (follower part switches).
//!
//! Record envelope: `[len:4][checksum:4][bincode:len]`, little endian,
//! crc32 over the bincode payload.
//!
//! Slices of a bundle that survived a compaction can be persisted two ways:
//! - changed bundle: the full surviving slice set as a legacy screen plus an
//!   opaque overlay (older readers understand only the legacy form)
//! - bundle delta: only the removed or changed slices

use serde::{Deserialize, Serialize};
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{Epoch, Label, Step, TableId};
use thiserror::Error;

use crate::parts::{remove_slices, replace_slices, PartComponents, Slice, TxStatusComponents};

/// Decoding failures of persisted records.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("checksum mismatch: expected {expected:#x}, actual {actual:#x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("slice ending at row {0} has no legacy form")]
    RowOverflow(u64),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

impl From<WireError> for TabletError {
    fn from(e: WireError) -> Self {
        TabletError::Codec(e.to_string())
    }
}

// ── Part switch record ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartSwitchRecord {
    pub table: TableId,
    pub introduced_parts: Vec<IntroducedBundle>,
    pub introduced_tx_status: Vec<TxStatusComponents>,
    pub changed_bundles: Vec<BundleChange>,
    pub bundle_deltas: Vec<BundleDelta>,
    pub leaving_bundles: Vec<Label>,
    pub leaving_tx_status: Vec<Label>,
    pub bundle_moves: Vec<BundleMove>,
    pub table_snapshoted: Option<TableSnapshoted>,
    pub compaction_changes: Option<CompactionStateChanges>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroducedBundle {
    pub components: PartComponents,
    /// Compaction level the strategy assigned to the part.
    pub level: u32,
}

/// Full slice overlay of a bundle that changed without being replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleChange {
    pub label: Label,
    pub legacy: Vec<u8>,
    pub opaque: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDelta {
    pub label: Label,
    pub delta: Vec<u8>,
}

/// Part moved from another table of the same tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMove {
    pub label: Label,
    pub rebased_epoch: Option<Epoch>,
    pub source_table: TableId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshoted {
    pub table: TableId,
    pub generation: u32,
    pub step: Step,
    pub head: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionStateChanges {
    pub table: TableId,
    pub strategy: u32,
    pub key_values: Vec<(u64, Option<Vec<u8>>)>,
}

impl PartSwitchRecord {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    /// True when the record carries nothing a follower would apply.
    pub fn is_empty(&self) -> bool {
        self.introduced_parts.is_empty()
            && self.introduced_tx_status.is_empty()
            && self.changed_bundles.is_empty()
            && self.bundle_deltas.is_empty()
            && self.leaving_bundles.is_empty()
            && self.leaving_tx_status.is_empty()
            && self.bundle_moves.is_empty()
            && self.table_snapshoted.is_none()
            && self.compaction_changes.is_none()
    }

    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        let data = bincode::serialize(self).map_err(WireError::from)?;
        let checksum = crc32fast::hash(&data);
        let mut out = Vec::with_capacity(8 + data.len());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> TabletResult<Self> {
        if bytes.len() < 8 {
            return Err(WireError::Truncated {
                need: 8,
                have: bytes.len(),
            }
            .into());
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let expected = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let body = &bytes[8..];
        if body.len() < len {
            return Err(WireError::Truncated {
                need: len,
                have: body.len(),
            }
            .into());
        }
        let data = &body[..len];
        let actual = crc32fast::hash(data);
        if actual != expected {
            return Err(WireError::Checksum { expected, actual }.into());
        }
        Ok(bincode::deserialize(data).map_err(WireError::from)?)
    }
}

// ── Slice overlays ─────────────────────────────────────────────────────────

/// Legacy screen: half-open row holes `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LegacyScreen {
    holes: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OpaqueOverlay {
    slices: Vec<Slice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum SliceDelta {
    Remove(Vec<Slice>),
    Change(Vec<Slice>),
}

/// Decoded slice overlay of a bundle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Overlay {
    pub slices: Vec<Slice>,
}

impl Overlay {
    pub fn new(slices: Vec<Slice>) -> Self {
        Self { slices }
    }

    pub fn encode_legacy(&self) -> TabletResult<Vec<u8>> {
        let holes = self
            .slices
            .iter()
            .map(|s| {
                let end = s.last_row.checked_add(1).ok_or(WireError::RowOverflow(s.last_row))?;
                Ok((s.first_row, end))
            })
            .collect::<Result<Vec<_>, WireError>>()?;
        let screen = LegacyScreen { holes };
        Ok(bincode::serialize(&screen).map_err(WireError::from)?)
    }

    pub fn encode_opaque(&self) -> TabletResult<Vec<u8>> {
        let overlay = OpaqueOverlay {
            slices: self.slices.clone(),
        };
        Ok(bincode::serialize(&overlay).map_err(WireError::from)?)
    }

    /// Opaque form wins when present; legacy screens are converted.
    pub fn decode(legacy: &[u8], opaque: &[u8]) -> TabletResult<Overlay> {
        if !opaque.is_empty() {
            let overlay: OpaqueOverlay = bincode::deserialize(opaque).map_err(WireError::from)?;
            return Ok(Overlay::new(overlay.slices));
        }
        if !legacy.is_empty() {
            let screen: LegacyScreen = bincode::deserialize(legacy).map_err(WireError::from)?;
            let slices = screen
                .holes
                .into_iter()
                .filter(|(begin, end)| end > begin)
                .map(|(begin, end)| Slice::new(begin, end - 1))
                .collect();
            return Ok(Overlay::new(slices));
        }
        Ok(Overlay::default())
    }

    pub fn apply_delta(&mut self, delta: &[u8]) -> TabletResult<()> {
        let delta: SliceDelta = bincode::deserialize(delta).map_err(WireError::from)?;
        self.slices = match delta {
            SliceDelta::Remove(removed) => remove_slices(&self.slices, &removed),
            SliceDelta::Change(changed) => replace_slices(&self.slices, &changed),
        };
        Ok(())
    }
}

/// Delta removing the given slices from a bundle.
pub fn encode_remove_slices(removed: &[Slice]) -> TabletResult<Vec<u8>> {
    Ok(bincode::serialize(&SliceDelta::Remove(removed.to_vec())).map_err(WireError::from)?)
}

/// Delta replacing overlapping slices of a bundle with `changed`.
pub fn encode_change_slices(changed: &[Slice]) -> TabletResult<Vec<u8>> {
    Ok(bincode::serialize(&SliceDelta::Change(changed.to_vec())).map_err(WireError::from)?)
}

/// Both overlay forms of a bundle's surviving slices.
pub fn bundle_change(label: Label, slices: &[Slice]) -> TabletResult<BundleChange> {
    let overlay = Overlay::new(slices.to_vec());
    Ok(BundleChange {
        label,
        legacy: overlay.encode_legacy()?,
        opaque: overlay.encode_opaque()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::types::BlobId;

    fn label(cookie: u32) -> Label {
        BlobId::new(10, 2, 5, cookie)
    }

    #[test]
    fn test_record_envelope_detects_corruption() {
        let mut record = PartSwitchRecord::new(TableId(4));
        record.leaving_bundles.push(label(1));
        let mut bytes = record.encode().unwrap();
        assert_eq!(PartSwitchRecord::decode(&bytes).unwrap(), record);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = PartSwitchRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, TabletError::Codec(_)));
    }

    #[test]
    fn test_record_truncated() {
        let record = PartSwitchRecord::new(TableId(4));
        let bytes = record.encode().unwrap();
        assert!(PartSwitchRecord::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(PartSwitchRecord::decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_legacy_and_opaque_decode_to_same_slices() {
        let overlay = Overlay::new(vec![Slice::new(0, 9), Slice::new(20, 29)]);
        let legacy = overlay.encode_legacy().unwrap();
        let opaque = overlay.encode_opaque().unwrap();
        assert_eq!(Overlay::decode(&legacy, &[]).unwrap(), overlay);
        assert_eq!(Overlay::decode(&[], &opaque).unwrap(), overlay);
        assert_eq!(Overlay::decode(&legacy, &opaque).unwrap(), overlay);
        assert_eq!(Overlay::decode(&[], &[]).unwrap(), Overlay::default());
    }

    #[test]
    fn test_last_row_has_no_legacy_form() {
        let overlay = Overlay::new(vec![Slice::new(0, 9), Slice::new(10, u64::MAX)]);
        let err = overlay.encode_legacy().unwrap_err();
        assert!(matches!(err, TabletError::Codec(_)));
        assert!(bundle_change(label(1), &overlay.slices).is_err());

        let opaque = overlay.encode_opaque().unwrap();
        assert_eq!(Overlay::decode(&[], &opaque).unwrap(), overlay);
    }

    #[test]
    fn test_remove_delta_matches_changed_bundle() {
        let before = vec![Slice::new(0, 9), Slice::new(10, 19), Slice::new(20, 29)];
        let compacted = vec![Slice::new(10, 19)];
        let surviving = remove_slices(&before, &compacted);

        let mut via_delta = Overlay::new(before.clone());
        via_delta
            .apply_delta(&encode_remove_slices(&compacted).unwrap())
            .unwrap();

        let change = bundle_change(label(3), &surviving).unwrap();
        let via_change = Overlay::decode(&change.legacy, &change.opaque).unwrap();

        assert_eq!(via_delta, via_change);
        assert_eq!(via_delta.slices, vec![Slice::new(0, 9), Slice::new(20, 29)]);
    }

    #[test]
    fn test_change_delta_replaces_overlapping() {
        let mut overlay = Overlay::new(vec![Slice::new(0, 9), Slice::new(10, 19)]);
        overlay
            .apply_delta(&encode_change_slices(&[Slice::new(10, 14)]).unwrap())
            .unwrap();
        assert_eq!(overlay.slices, vec![Slice::new(0, 9), Slice::new(10, 14)]);
    }
}
