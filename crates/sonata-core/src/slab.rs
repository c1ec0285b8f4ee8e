// src/slab.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::conn::Connection;
use crate::error::{SonataError, SonataResult};

/// Stable identifier of a connection slot. Doubles as the multiplexer token.
pub type ConnId = usize;

struct FreeList {
    stack: Vec<ConnId>,
    in_use: Vec<bool>,
}

/// Fixed-capacity arena of connections, allocated once at startup.
///
/// Each slot sits behind its own mutex. One-shot readiness means at most one
/// thread wants a given slot at a time, so the lock is uncontended; it exists
/// so that the hand-off between the reactor and a worker stays safe.
pub struct ConnectionSlab {
    slots: Box<[Mutex<Connection>]>,
    free: Mutex<FreeList>,
    active: AtomicUsize,
}

impl ConnectionSlab {
    /// Allocate every connection (and its buffers) up front.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Mutex<Connection>> =
            (0..capacity).map(|_| Mutex::new(Connection::new())).collect();

        Self {
            slots: slots.into_boxed_slice(),
            // Reverse so the lowest index is handed out first.
            free: Mutex::new(FreeList {
                stack: (0..capacity).rev().collect(),
                in_use: vec![false; capacity],
            }),
            active: AtomicUsize::new(0),
        }
    }

    /// O(1) allocation of a free slot.
    pub fn allocate(&self) -> SonataResult<ConnId> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let id = free.stack.pop().ok_or(SonataError::SlabFull)?;
        free.in_use[id] = true;
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// O(1) return of a slot to the free list. Double frees are ignored.
    pub fn release(&self, id: ConnId) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        match free.in_use.get(id) {
            Some(true) => {}
            _ => return,
        }
        free.in_use[id] = false;
        free.stack.push(id);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Lock the connection in slot `id`. A poisoned slot is recovered: the
    /// connection's own state decides what happens next.
    pub fn lock(&self, id: ConnId) -> Option<MutexGuard<'_, Connection>> {
        self.slots
            .get(id)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
