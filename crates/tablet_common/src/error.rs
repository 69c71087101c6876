use thiserror::Error;

use crate::types::{
    BlobId, CompactionId, FetchStatus, Label, ReadId, SeatId, Step, TableId, WaitPadId,
};

/// Convenience alias for `Result<T, TabletError>`.
pub type TabletResult<T> = Result<T, TabletError>;

/// Error classification for escalation decisions.
///
/// - `UserError`:   bad configuration or an invalid call from the owner
/// - `Transient`:   the tablet cannot serve the request right now
/// - `InternalBug`: malformed persisted data or broken protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Errors returned to callers of the executor.
///
/// Conditions that make the tablet unusable are not returned here: they are
/// recorded as a [`BrokenReason`] and surfaced through the owner's detach path.
/// `Broken` is only returned to reject work admitted after that transition.
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Tablet is broken: {0}")]
    Broken(BrokenReason),

    #[error("Unknown table: {0}")]
    UnknownTable(TableId),

    #[error("Unknown compaction: {0}")]
    UnknownCompaction(CompactionId),

    #[error("Operation not allowed in this role: {0}")]
    Role(&'static str),

    #[error("Lease dropped")]
    LeaseDropped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TabletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabletError::Config(_)
            | TabletError::UnknownTable(_)
            | TabletError::UnknownCompaction(_)
            | TabletError::Role(_) => ErrorKind::UserError,
            TabletError::Broken(_) | TabletError::LeaseDropped | TabletError::Io(_) => {
                ErrorKind::Transient
            }
            TabletError::Codec(_) => ErrorKind::InternalBug,
        }
    }
}

/// Why a tablet stopped processing. Recorded once, never cleared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokenReason {
    #[error("commit failed for step {step}")]
    CommitFailed { step: Step },

    #[error("page fetch for {label} failed with {status}")]
    PageFetchFailed { label: Label, status: FetchStatus },

    #[error("pending part load for {label} failed with {status}")]
    PendingLoadFailed { label: Label, status: FetchStatus },

    #[error("blob read failed with {status}")]
    BlobReadFailed { status: FetchStatus },

    #[error("{seat} failed commit validation: {reason}")]
    ValidationFailed { seat: SeatId, reason: String },

    #[error("{read} postponed with nothing to load")]
    ReadWithoutDemands { read: ReadId },

    #[error("unexpected wait pad {0} triggered")]
    UnknownWaitPad(WaitPadId),

    #[error("loaded blob {blob} for a waiter in an unexpected state")]
    UnexpectedStage { blob: BlobId },

    #[error("loaded blob {blob} for an unknown part switch")]
    UnknownSwitch { blob: BlobId },

    #[error("compaction failed on {table}")]
    CompactionFailed { table: TableId },

    #[error("follower head diverged on {table}")]
    FollowerHeadDiverged { table: TableId },

    #[error("slices of {label} not found in {table}")]
    MissingSlices { table: TableId, label: Label },

    #[error("commit result for unknown barrier at step {step}")]
    UnknownBarrier { step: Step },

    #[error("malformed persisted record: {0}")]
    Corrupted(String),
}
