pub mod commit;
pub mod compaction;
pub mod executor;
pub mod interfaces;
pub mod memory;
pub mod mock;
pub mod page_cache;
pub mod part_switch;
pub mod parts;
pub mod scheduler;
pub mod seat;
pub mod stats;
pub mod wire;

#[cfg(test)]
mod tests;

pub use commit::{CommitKind, CommitManager, GcDelta, LeaseCallback, LogCommit};
pub use compaction::{
    CompactedPart, CompactionOutcome, CompactionRead, CompactionTicket, ReadEnv,
};
pub use executor::Executor;
pub use interfaces::Collaborators;
pub use parts::{PartComponents, PartView, Slice, Subset, TxStatusComponents, TxStatusPart};
pub use seat::{Completed, MemoryToken, TerminationReason, Transaction, TxContext};
pub use stats::{ExecutorStats, ExecutorStatsSnapshot};
pub use wire::PartSwitchRecord;

// Re-export from tablet_common for convenience
pub use tablet_common::{BrokenReason, ExecutorConfig, TabletError, TabletResult};
