//! Active Semaphore List
//!
//! Maps a semaphore's address to the queue of processes blocked on it.
//! Only semaphores with at least one waiter have a descriptor; the
//! descriptor goes back to the free list the moment its queue drains.
//!
//! The list is kept sorted by address between two permanent sentinels
//! (address 0 and `u32::MAX`), so every search has a predecessor and a
//! successor without special cases at either end.

use super::process::{PcbPool, ProcQueue, ProcessId};
use crate::{KernelError, KernelResult, MAX_PROC};

/// Address of a semaphore's integer value (its identity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SemAddr(pub u32);

impl SemAddr {
    /// Check for the null address
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Descriptors available to real semaphores
pub const SEMD_COUNT: usize = MAX_PROC;

const NODE_COUNT: usize = SEMD_COUNT + 2;
const HEAD: usize = 0;
const TAIL: usize = 1;

#[derive(Debug, Clone, Copy)]
struct Semd {
    next: Option<usize>,
    key: u32,
    queue: ProcQueue,
}

impl Semd {
    const fn new() -> Self {
        Self {
            next: None,
            key: 0,
            queue: ProcQueue::new(),
        }
    }
}

/// Active Semaphore List
pub struct Asl {
    nodes: [Semd; NODE_COUNT],
    free: Option<usize>,
}

impl Asl {
    /// Create list holding only the two sentinels
    pub fn new() -> Self {
        let mut nodes = [Semd::new(); NODE_COUNT];
        nodes[HEAD].key = 0;
        nodes[HEAD].next = Some(TAIL);
        nodes[TAIL].key = u32::MAX;

        // chain descriptors 2.. into the free list
        for index in 2..NODE_COUNT {
            nodes[index].next = if index + 1 < NODE_COUNT {
                Some(index + 1)
            } else {
                None
            };
        }

        Self {
            nodes,
            free: Some(2),
        }
    }

    /// Block `id` on `sem`, creating the descriptor if needed
    pub fn insert_blocked(
        &mut self,
        pool: &mut PcbPool,
        sem: SemAddr,
        id: ProcessId,
    ) -> KernelResult<()> {
        let pred = self.predecessor(sem);
        let node = match self.nodes[pred].next {
            Some(next) if next != TAIL && self.nodes[next].key == sem.0 => next,
            next => {
                let node = self.free.ok_or(KernelError::OutOfDescriptors)?;
                self.free = self.nodes[node].next;
                self.nodes[node] = Semd {
                    next,
                    key: sem.0,
                    queue: ProcQueue::new(),
                };
                self.nodes[pred].next = Some(node);
                node
            }
        };

        pool.insert_tail(&mut self.nodes[node].queue, id);
        pool.get_mut(id).sem_addr = Some(sem);
        Ok(())
    }

    /// Wake the first process blocked on `sem`
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, sem: SemAddr) -> Option<ProcessId> {
        let (pred, node) = self.find(sem)?;
        let id = pool.remove_head(&mut self.nodes[node].queue)?;
        pool.get_mut(id).sem_addr = None;
        self.release_if_drained(pred, node);
        Some(id)
    }

    /// Remove `id` from whichever semaphore queue it is blocked on
    pub fn out_blocked(&mut self, pool: &mut PcbPool, id: ProcessId) -> Option<ProcessId> {
        let mut pred = HEAD;
        while let Some(node) = self.nodes[pred].next {
            if node == TAIL {
                break;
            }
            if pool.remove(&mut self.nodes[node].queue, id).is_some() {
                pool.get_mut(id).sem_addr = None;
                self.release_if_drained(pred, node);
                return Some(id);
            }
            pred = node;
        }
        None
    }

    /// First process blocked on `sem`, without removing it
    pub fn head_blocked(&self, pool: &PcbPool, sem: SemAddr) -> Option<ProcessId> {
        let (_, node) = self.find(sem)?;
        pool.head(&self.nodes[node].queue)
    }

    /// Number of processes blocked on `sem`
    pub fn queue_len(&self, pool: &PcbPool, sem: SemAddr) -> usize {
        self.find(sem)
            .map(|(_, node)| pool.len(&self.nodes[node].queue))
            .unwrap_or(0)
    }

    /// Number of processes blocked on any semaphore
    pub fn blocked_len(&self, pool: &PcbPool) -> usize {
        self.active()
            .map(|node| pool.len(&self.nodes[node].queue))
            .sum()
    }

    /// Number of live descriptors
    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Addresses of every semaphore with waiters, ascending
    pub fn semaphores(&self) -> impl Iterator<Item = SemAddr> + '_ {
        self.active().map(move |node| SemAddr(self.nodes[node].key))
    }

    fn active(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.nodes[HEAD].next;
        core::iter::from_fn(move || {
            let node = cursor.filter(|&n| n != TAIL)?;
            cursor = self.nodes[node].next;
            Some(node)
        })
    }

    /// Last node whose key is below `sem`
    fn predecessor(&self, sem: SemAddr) -> usize {
        let mut pred = HEAD;
        while let Some(next) = self.nodes[pred].next {
            if self.nodes[next].key >= sem.0 {
                break;
            }
            pred = next;
        }
        pred
    }

    fn find(&self, sem: SemAddr) -> Option<(usize, usize)> {
        let pred = self.predecessor(sem);
        let node = self.nodes[pred].next?;
        (node != TAIL && self.nodes[node].key == sem.0).then_some((pred, node))
    }

    fn release_if_drained(&mut self, pred: usize, node: usize) {
        if self.nodes[node].queue.is_empty() {
            self.nodes[pred].next = self.nodes[node].next;
            self.nodes[node].next = self.free;
            self.free = Some(node);
        }
    }
}

impl Default for Asl {
    fn default() -> Self {
        Self::new()
    }
}
