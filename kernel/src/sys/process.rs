//! Process Control Blocks
//!
//! A fixed arena of [`MAX_PROC`] PCBs plus the two structures built from
//! their links:
//! - Process queues: circular, doubly linked, addressed by their tail
//! - Process trees: parent, first child and a doubly linked sibling list
//!
//! Links are arena indices ([`ProcessId`]), so a recycled PCB can never be
//! reached through a stale pointer. The free list is itself a process queue.
//!
//! ```text
//!            tail
//!             │
//!   ┌───┐   ┌─▼─┐   ┌───┐
//! ┌►│ A │◄─►│ C │◄─►│ B │◄┐   C.next = A (head), A.prev = C
//! │ └───┘   └───┘   └───┘ │
//! └───────────────────────┘
//! ```

use super::asl::SemAddr;
use crate::hal::State;
use crate::mm::Asid;
use crate::MAX_PROC;

/// Process handle (index into the PCB arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(u16);

impl ProcessId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Process control block
#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    next: Option<ProcessId>,
    prev: Option<ProcessId>,
    parent: Option<ProcessId>,
    child: Option<ProcessId>,
    next_sib: Option<ProcessId>,
    prev_sib: Option<ProcessId>,

    /// Saved processor state
    pub state: State,
    /// Accumulated CPU time in microseconds
    pub cpu_time: u32,
    /// Semaphore this process is blocked on
    pub sem_addr: Option<SemAddr>,
    /// Support structure, if the process has one
    pub support: Option<Asid>,
}

impl Pcb {
    const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            parent: None,
            child: None,
            next_sib: None,
            prev_sib: None,
            state: State::zeroed(),
            cpu_time: 0,
            sem_addr: None,
            support: None,
        }
    }

    /// Parent process
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    /// Most recently attached child
    pub fn first_child(&self) -> Option<ProcessId> {
        self.child
    }

    /// Next (older) sibling
    pub fn next_sibling(&self) -> Option<ProcessId> {
        self.next_sib
    }
}

/// Process queue, referenced through its tail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcQueue {
    tail: Option<ProcessId>,
}

impl ProcQueue {
    /// Create empty queue
    pub const fn new() -> Self {
        Self { tail: None }
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    /// Tail element
    pub fn tail(&self) -> Option<ProcessId> {
        self.tail
    }
}

/// PCB arena with its free list
pub struct PcbPool {
    pcbs: [Pcb; MAX_PROC],
    free: ProcQueue,
    free_count: usize,
}

impl PcbPool {
    /// Create a pool with every PCB on the free list
    pub fn new() -> Self {
        let mut pool = Self {
            pcbs: [Pcb::new(); MAX_PROC],
            free: ProcQueue::new(),
            free_count: 0,
        };
        for index in 0..MAX_PROC {
            pool.free(ProcessId(index as u16));
        }
        pool
    }

    /// Take a PCB off the free list, with every field reset
    pub fn alloc(&mut self) -> Option<ProcessId> {
        let id = unlink_head(&mut self.pcbs, &mut self.free)?;
        self.free_count -= 1;
        self.pcbs[id.index()] = Pcb::new();
        Some(id)
    }

    /// Return a PCB to the free list
    ///
    /// The caller must already have unlinked it from every queue and tree.
    pub fn free(&mut self, id: ProcessId) {
        link_tail(&mut self.pcbs, &mut self.free, id);
        self.free_count += 1;
    }

    /// Number of PCBs on the free list
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of allocated PCBs
    pub fn live_count(&self) -> usize {
        MAX_PROC - self.free_count
    }

    /// Get PCB
    pub fn get(&self, id: ProcessId) -> &Pcb {
        &self.pcbs[id.index()]
    }

    /// Get mutable PCB
    pub fn get_mut(&mut self, id: ProcessId) -> &mut Pcb {
        &mut self.pcbs[id.index()]
    }

    // ========================================================================
    // Process queues
    // ========================================================================

    /// Insert at the tail of `queue`
    pub fn insert_tail(&mut self, queue: &mut ProcQueue, id: ProcessId) {
        link_tail(&mut self.pcbs, queue, id);
    }

    /// Remove the head of `queue`
    pub fn remove_head(&mut self, queue: &mut ProcQueue) -> Option<ProcessId> {
        unlink_head(&mut self.pcbs, queue)
    }

    /// Remove `id` from anywhere in `queue`
    ///
    /// Returns `None` if `id` is not linked into this queue.
    pub fn remove(&mut self, queue: &mut ProcQueue, id: ProcessId) -> Option<ProcessId> {
        if !self.contains(queue, id) {
            return None;
        }
        let tail = queue.tail?;
        let (prev, next) = {
            let pcb = &self.pcbs[id.index()];
            (pcb.prev?, pcb.next?)
        };

        if prev == id {
            queue.tail = None;
        } else {
            self.pcbs[prev.index()].next = Some(next);
            self.pcbs[next.index()].prev = Some(prev);
            if tail == id {
                queue.tail = Some(prev);
            }
        }

        let pcb = &mut self.pcbs[id.index()];
        pcb.next = None;
        pcb.prev = None;
        Some(id)
    }

    /// Head of `queue` without removing it
    pub fn head(&self, queue: &ProcQueue) -> Option<ProcessId> {
        queue.tail.and_then(|tail| self.pcbs[tail.index()].next)
    }

    /// Check whether `id` is linked into `queue`
    pub fn contains(&self, queue: &ProcQueue, id: ProcessId) -> bool {
        self.iter(queue).any(|member| member == id)
    }

    /// Number of processes in `queue`
    pub fn len(&self, queue: &ProcQueue) -> usize {
        self.iter(queue).count()
    }

    /// Iterate from head to tail
    pub fn iter<'a>(&'a self, queue: &ProcQueue) -> QueueIter<'a> {
        QueueIter {
            pool: self,
            next: self.head(queue),
            tail: queue.tail,
        }
    }

    // ========================================================================
    // Process trees
    // ========================================================================

    /// Check if `id` has children
    pub fn has_children(&self, id: ProcessId) -> bool {
        self.pcbs[id.index()].child.is_some()
    }

    /// Make `child` the first child of `parent`
    pub fn attach_child(&mut self, parent: ProcessId, child: ProcessId) {
        let old_first = self.pcbs[parent.index()].child;
        if let Some(old) = old_first {
            self.pcbs[old.index()].prev_sib = Some(child);
        }

        let pcb = &mut self.pcbs[child.index()];
        pcb.parent = Some(parent);
        pcb.next_sib = old_first;
        pcb.prev_sib = None;
        self.pcbs[parent.index()].child = Some(child);
    }

    /// Detach and return the first child of `parent`
    pub fn detach_first_child(&mut self, parent: ProcessId) -> Option<ProcessId> {
        let child = self.pcbs[parent.index()].child?;
        self.detach(child)
    }

    /// Detach `child` from its parent, wherever it sits among its siblings
    pub fn detach(&mut self, child: ProcessId) -> Option<ProcessId> {
        let (parent, prev, next) = {
            let pcb = &self.pcbs[child.index()];
            (pcb.parent?, pcb.prev_sib, pcb.next_sib)
        };

        match prev {
            Some(prev) => self.pcbs[prev.index()].next_sib = next,
            None => self.pcbs[parent.index()].child = next,
        }
        if let Some(next) = next {
            self.pcbs[next.index()].prev_sib = prev;
        }

        let pcb = &mut self.pcbs[child.index()];
        pcb.parent = None;
        pcb.next_sib = None;
        pcb.prev_sib = None;
        Some(child)
    }
}

impl Default for PcbPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a process queue
pub struct QueueIter<'a> {
    pool: &'a PcbPool,
    next: Option<ProcessId>,
    tail: Option<ProcessId>,
}

impl Iterator for QueueIter<'_> {
    type Item = ProcessId;

    fn next(&mut self) -> Option<ProcessId> {
        let current = self.next?;
        self.next = if Some(current) == self.tail {
            None
        } else {
            self.pool.pcbs[current.index()].next
        };
        Some(current)
    }
}

fn link_tail(pcbs: &mut [Pcb], queue: &mut ProcQueue, id: ProcessId) {
    match queue.tail {
        None => {
            pcbs[id.index()].next = Some(id);
            pcbs[id.index()].prev = Some(id);
        }
        Some(tail) => {
            let head = pcbs[tail.index()].next;
            pcbs[id.index()].next = head;
            pcbs[id.index()].prev = Some(tail);
            pcbs[tail.index()].next = Some(id);
            if let Some(head) = head {
                pcbs[head.index()].prev = Some(id);
            }
        }
    }
    queue.tail = Some(id);
}

fn unlink_head(pcbs: &mut [Pcb], queue: &mut ProcQueue) -> Option<ProcessId> {
    let tail = queue.tail?;
    let head = pcbs[tail.index()].next?;

    if head == tail {
        queue.tail = None;
    } else {
        let new_head = pcbs[head.index()].next;
        pcbs[tail.index()].next = new_head;
        if let Some(new_head) = new_head {
            pcbs[new_head.index()].prev = Some(tail);
        }
    }

    pcbs[head.index()].next = None;
    pcbs[head.index()].prev = None;
    Some(head)
}
