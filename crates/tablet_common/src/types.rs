use serde::{Deserialize, Serialize};
use std::fmt;

/// Log step of a tablet generation. Advanced by every durable commit.
pub type Step = u32;

/// Page index inside a page collection.
pub type PageId = u32;

/// Local table identifier inside a tablet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TableId(pub u32);

/// Unique id of one admitted transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeatId(pub u64);

/// Token linking a blocked consumer to the page loads that unblock it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitPadId(pub u64);

/// Compaction read registered with the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadId(pub u64);

/// Resource broker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Stable handle of a pending part switch (monotonic, never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchHandle(pub u64);

/// Compaction task serial assigned by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompactionId(pub u64);

/// Part epoch. Parts with a lower epoch hold older data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Epoch(pub i64);

impl Epoch {
    pub const MIN: Epoch = Epoch(i64::MIN);
    pub const MAX: Epoch = Epoch(i64::MAX);

    pub fn zero() -> Epoch {
        Epoch(0)
    }

    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }
}

/// Identity of a stored blob. Page collections and parts are labelled by
/// the id of their leading blob.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct BlobId {
    pub tablet: u64,
    pub generation: u32,
    pub step: u32,
    pub cookie: u32,
}

impl BlobId {
    pub fn new(tablet: u64, generation: u32, step: u32, cookie: u32) -> Self {
        Self {
            tablet,
            generation,
            step,
            cookie,
        }
    }
}

/// Label of a page collection or a part.
pub type Label = BlobId;

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

impl fmt::Display for SeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seat:{}", self.0)
    }
}

impl fmt::Display for WaitPadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad:{}", self.0)
    }
}

impl fmt::Display for ReadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "read:{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

impl fmt::Display for SwitchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "switch:{}", self.0)
    }
}

impl fmt::Display for CompactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compaction:{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Epoch::MAX => f.write_str("epoch:max"),
            Epoch::MIN => f.write_str("epoch:min"),
            Epoch(e) => write!(f, "epoch:{}", e),
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}]",
            self.tablet, self.generation, self.step, self.cookie
        )
    }
}

/// Status of a storage round trip (shared cache fetch, blob read, commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchStatus {
    Ok,
    /// The requested data is absent from storage.
    NoData,
    /// The collection is unknown to the responder.
    Race,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::NoData => "nodata",
            FetchStatus::Race => "race",
            FetchStatus::Error => "error",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
