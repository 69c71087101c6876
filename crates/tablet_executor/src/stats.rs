//! Executor counters.
//!
//! Plain `u64` fields mutated from the executor's single logical thread;
//! `snapshot()` copies them out together with the page cache and memory
//! views for observability.

use crate::interfaces::GcStateSize;
use crate::memory::MemorySnapshot;
use crate::page_cache::PageCacheSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Admitted seats not yet completed or terminated.
    pub tx_in_fly: u64,
    /// Seats in the pending queue.
    pub tx_pending: u64,
    pub tx_executed: u64,
    pub tx_completed: u64,
    pub tx_terminated: u64,
    pub tx_read_only: u64,
    /// Seats that had to be re-executed at least once.
    pub tx_retried: u64,
    pub tx_postponed: u64,
    pub tx_memory_waits: u64,
    pub tx_cache_hits: u64,
    pub tx_cache_misses: u64,
    pub pages_requested: u64,
    pub bytes_requested: u64,

    pub commits_redo: u64,
    pub commits_snap: u64,
    pub commits_data: u64,
    pub commits_misc: u64,
    pub commits_confirmed: u64,
    pub batched_change_sets: u64,

    pub part_switches_applied: u64,
    pub bundles_loaded: u64,
    pub compactions_integrated: u64,
    pub compactions_cancelled: u64,
    pub compaction_reads: u64,
    pub compaction_read_retries: u64,

    pub lease_commits: u64,
    pub lease_extensions: u64,

    /// Shared cache answered a transaction fetch with NODATA.
    pub alerts_req_nodata: u64,
    /// Shared cache answered a loader fetch with NODATA.
    pub alerts_pending_nodata: u64,
}

impl ExecutorStats {
    pub fn snapshot(
        &self,
        cache: PageCacheSnapshot,
        memory: MemorySnapshot,
        pending_part_switches: u64,
        gc: GcStateSize,
    ) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            counters: self.clone(),
            cache,
            memory,
            pending_part_switches,
            gc,
        }
    }
}

/// Immutable snapshot of executor state for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub counters: ExecutorStats,
    pub cache: PageCacheSnapshot,
    pub memory: MemorySnapshot,
    pub pending_part_switches: u64,
    pub gc: GcStateSize,
}
