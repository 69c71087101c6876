//! Resource arbiter: static memory pool plus broker-granted memory.
//!
//! Every seat starts on the static pool. A seat that needs more than the pool
//! can give is parked here, keyed by its broker task, until the broker
//! reports the allocation. Grants may be captured by a transaction at commit
//! and re-attached to a later seat.

use std::collections::HashMap;

use tablet_common::types::TaskId;

use crate::interfaces::{ResourceBroker, TaskStatus};
use crate::seat::{MemoryToken, Seat};

#[derive(Debug, Clone, Copy, Default)]
struct Captured {
    task: Option<TaskId>,
    static_bytes: u64,
    granted_bytes: u64,
}

/// Immutable snapshot of arbiter state for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub static_limit: u64,
    pub static_used: u64,
    pub dynamic_used: u64,
    pub postponed_seats: u64,
    pub captured_tokens: u64,
    pub broker_requests: u64,
    pub captures: u64,
    pub attaches: u64,
}

pub struct ResourceArbiter {
    static_limit: u64,
    static_used: u64,
    dynamic_used: u64,
    next_task: u64,
    next_token: u64,
    /// Seats parked until the broker grants their task.
    postponed: HashMap<TaskId, Seat>,
    /// Limit last requested per live task.
    requested: HashMap<TaskId, u64>,
    captured: HashMap<u64, Captured>,
    broker_requests: u64,
    captures: u64,
    attaches: u64,
}

impl ResourceArbiter {
    pub fn new(static_limit: u64) -> Self {
        Self {
            static_limit,
            static_used: 0,
            dynamic_used: 0,
            next_task: 0,
            next_token: 0,
            postponed: HashMap::new(),
            requested: HashMap::new(),
            captured: HashMap::new(),
            broker_requests: 0,
            captures: 0,
            attaches: 0,
        }
    }

    pub fn remained_static(&self) -> u64 {
        self.static_limit.saturating_sub(self.static_used)
    }

    /// Set the seat's static share to `bytes`.
    pub fn alloc_static(&mut self, seat: &mut Seat, bytes: u64) {
        debug_assert!(seat.task.is_none(), "static memory for a seat with a broker task");
        self.static_used = self.static_used - seat.static_memory + bytes;
        seat.static_memory = bytes;
        seat.refresh_memory_limit();
    }

    /// Shrink the seat's static share to `keep` bytes.
    pub fn free_static(&mut self, seat: &mut Seat, keep: u64) {
        let keep = keep.min(seat.static_memory);
        self.static_used -= seat.static_memory - keep;
        seat.static_memory = keep;
        seat.refresh_memory_limit();
    }

    /// Submit (or resubmit) a broker task for `limit` bytes and park the seat
    /// until it is granted.
    pub fn request_limit(
        &mut self,
        mut seat: Seat,
        limit: u64,
        broker: &mut dyn ResourceBroker,
    ) -> TaskId {
        let task = match seat.task {
            Some(task) => {
                broker.update(task, limit);
                task
            }
            None => {
                self.next_task += 1;
                let task = TaskId(self.next_task);
                seat.task = Some(task);
                broker.submit(task, limit);
                task
            }
        };
        self.broker_requests += 1;
        self.requested.insert(task, limit);
        tracing::debug!(seat = %seat.id, task = %task, limit, "seat waits for memory");
        self.postponed.insert(task, seat);
        task
    }

    /// Broker granted `task`. Returns the seat that waited for it.
    pub fn resource_allocated(&mut self, task: TaskId) -> Option<Seat> {
        let mut seat = self.postponed.remove(&task)?;
        let limit = self.requested.get(&task).copied().unwrap_or(0);
        self.dynamic_used = self.dynamic_used - seat.granted_memory + limit;
        seat.granted_memory = limit;
        seat.refresh_memory_limit();
        Some(seat)
    }

    pub fn is_postponed(&self, task: &TaskId) -> bool {
        self.postponed.contains_key(task)
    }

    /// Fold a captured grant into the seat.
    pub fn attach_memory(
        &mut self,
        seat: &mut Seat,
        token: MemoryToken,
        broker: &mut dyn ResourceBroker,
    ) -> bool {
        let Some(captured) = self.captured.remove(&token.id) else {
            tracing::warn!(seat = %seat.id, token = token.id, "attach of unknown memory token");
            return false;
        };
        seat.static_memory += captured.static_bytes;
        seat.granted_memory += captured.granted_bytes;
        match (seat.task, captured.task) {
            (None, Some(task)) => seat.task = Some(task),
            (Some(own), Some(task)) => {
                broker.finish(task, TaskStatus::Finished);
                self.requested.remove(&task);
                broker.update(own, seat.granted_memory);
                self.requested.insert(own, seat.granted_memory);
            }
            (_, None) => {}
        }
        seat.refresh_memory_limit();
        self.attaches += 1;
        true
    }

    /// Release everything the seat holds. When the transaction asked to
    /// capture its memory, the grant is kept and returned as a token.
    pub fn release_memory(
        &mut self,
        seat: &mut Seat,
        broker: &mut dyn ResourceBroker,
    ) -> Option<MemoryToken> {
        let static_bytes = std::mem::take(&mut seat.static_memory);
        let granted_bytes = std::mem::take(&mut seat.granted_memory);
        let task = seat.task.take();
        seat.refresh_memory_limit();

        if std::mem::take(&mut seat.capture_memory) {
            self.next_token += 1;
            let id = self.next_token;
            self.captured.insert(
                id,
                Captured {
                    task,
                    static_bytes,
                    granted_bytes,
                },
            );
            self.captures += 1;
            return Some(MemoryToken {
                id,
                bytes: static_bytes + granted_bytes,
            });
        }

        self.static_used -= static_bytes;
        self.dynamic_used -= granted_bytes;
        if let Some(task) = task {
            self.requested.remove(&task);
            broker.finish(task, TaskStatus::Finished);
        }
        None
    }

    /// Drop a captured grant nobody re-attached.
    pub fn release_token(&mut self, token: MemoryToken, broker: &mut dyn ResourceBroker) -> bool {
        let Some(captured) = self.captured.remove(&token.id) else {
            return false;
        };
        self.static_used -= captured.static_bytes;
        self.dynamic_used -= captured.granted_bytes;
        if let Some(task) = captured.task {
            self.requested.remove(&task);
            broker.finish(task, TaskStatus::Finished);
        }
        true
    }

    /// Cancel every outstanding task. Parked seats are returned to the caller.
    pub fn cancel_all(&mut self, broker: &mut dyn ResourceBroker) -> Vec<Seat> {
        let mut seats: Vec<Seat> = self.postponed.drain().map(|(_, seat)| seat).collect();
        seats.sort_by_key(|s| s.id);
        for seat in &seats {
            if let Some(task) = seat.task {
                broker.finish(task, TaskStatus::Cancelled);
            }
        }
        for (_, captured) in self.captured.drain() {
            if let Some(task) = captured.task {
                broker.finish(task, TaskStatus::Cancelled);
            }
        }
        self.requested.clear();
        seats
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            static_limit: self.static_limit,
            static_used: self.static_used,
            dynamic_used: self.dynamic_used,
            postponed_seats: self.postponed.len() as u64,
            captured_tokens: self.captured.len() as u64,
            broker_requests: self.broker_requests,
            captures: self.captures,
            attaches: self.attaches,
        }
    }
}
