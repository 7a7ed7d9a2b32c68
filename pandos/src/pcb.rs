//! Process control blocks, process queues, and the process tree.
//!
//! PCBs live in a fixed arena of [`MAXPROC`] slots; links between them are
//! slot indices ([`PcbRef`]), so no block owns another and the termination
//! walk stays iterative. Free blocks thread through the same arena on a
//! singly-linked free list.
//!
//! Process queues are circular and doubly linked, addressed by their tail:
//! the head is always `tail.next`. A PCB is on at most one queue at a time.
//! The process tree links a parent to its first child, and children to each
//! other through a singly-linked sibling chain; insertion is LIFO at the
//! first-child position.
//!
//! PCBs get reused; allocation zero-initializes every field so no value from
//! a previous owner survives.

use crate::MAXPROC;
use crate::asl::SemKey;
use crate::kcontext::NativeHandle;
use crate::support::SupRef;
use umach::cpu::{ProcessorState, Status};

/// Index of a PCB slot in the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PcbRef(usize);

impl PcbRef {
    /// The raw slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// One process control block.
#[derive(Default)]
pub struct Pcb {
    next: Option<PcbRef>,
    prev: Option<PcbRef>,
    parent: Option<PcbRef>,
    child: Option<PcbRef>,
    sib: Option<PcbRef>,

    /// Saved processor state.
    pub state: ProcessorState,
    /// Accumulated CPU time, in microseconds.
    pub time: u64,
    /// The semaphore this process is blocked on, if any.
    pub sem_key: Option<SemKey>,
    /// The support structure backing this process, if it has one.
    pub support: Option<SupRef>,
    /// The kernel execution context of this process.
    pub native: Option<NativeHandle>,
    /// Effective status word while kernel-native code of this process runs.
    pub kstatus: Status,
}

/// The PCB arena plus its free list.
pub struct PcbPool {
    slots: Vec<Pcb>,
    free_head: Option<PcbRef>,
}

impl Default for PcbPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PcbPool {
    /// A pool with every slot free.
    pub fn new() -> Self {
        let mut pool = Self {
            slots: (0..MAXPROC).map(|_| Pcb::default()).collect(),
            free_head: None,
        };
        for i in (0..MAXPROC).rev() {
            pool.slots[i].next = pool.free_head;
            pool.free_head = Some(PcbRef(i));
        }
        pool
    }

    /// Borrow a PCB.
    #[inline]
    pub fn get(&self, p: PcbRef) -> &Pcb {
        &self.slots[p.0]
    }

    /// Borrow a PCB mutably.
    #[inline]
    pub fn get_mut(&mut self, p: PcbRef) -> &mut Pcb {
        &mut self.slots[p.0]
    }

    /// Allocate a zero-initialized PCB, or `None` when the pool is exhausted.
    /// Never blocks.
    pub fn alloc(&mut self) -> Option<PcbRef> {
        let p = self.free_head?;
        self.free_head = self.slots[p.0].next;
        self.slots[p.0] = Pcb::default();
        Some(p)
    }

    /// Return a PCB to the free list, dropping its kernel execution context.
    pub fn free(&mut self, p: PcbRef) {
        self.slots[p.0].native = None;
        self.slots[p.0].next = self.free_head;
        self.free_head = Some(p);
    }

    fn entry_exists(&self, tail: Option<PcbRef>, p: PcbRef) -> bool {
        let Some(tail) = tail else { return false };
        let head = self.slots[tail.0].next.expect("queue is circular");
        let mut cur = head;
        loop {
            if cur == p {
                return true;
            }
            cur = self.slots[cur.0].next.expect("queue is circular");
            if cur == head {
                return false;
            }
        }
    }

    /// Whether the queue addressed by `tail` is empty.
    pub fn empty_proc_q(&self, tail: Option<PcbRef>) -> bool {
        tail.is_none()
    }

    /// Enqueue `p` at the tail of the queue.
    pub fn insert_proc_q(&mut self, tail: &mut Option<PcbRef>, p: PcbRef) {
        match *tail {
            None => {
                self.slots[p.0].next = Some(p);
                self.slots[p.0].prev = Some(p);
            }
            Some(t) => {
                let head = self.slots[t.0].next.expect("queue is circular");
                self.slots[p.0].next = Some(head);
                self.slots[head.0].prev = Some(p);
                self.slots[t.0].next = Some(p);
                self.slots[p.0].prev = Some(t);
            }
        }
        *tail = Some(p);
    }

    /// Dequeue the head of the queue.
    pub fn remove_proc_q(&mut self, tail: &mut Option<PcbRef>) -> Option<PcbRef> {
        let head = self.head_proc_q(*tail)?;
        self.out_proc_q(tail, head)
    }

    /// Remove a specific PCB from the queue, wherever it sits. Returns `None`
    /// if it is not on this queue.
    pub fn out_proc_q(&mut self, tail: &mut Option<PcbRef>, p: PcbRef) -> Option<PcbRef> {
        if !self.entry_exists(*tail, p) {
            return None;
        }

        if *tail == Some(p) && self.slots[p.0].next == Some(p) {
            // Only element.
            *tail = None;
        } else {
            let prev = self.slots[p.0].prev.expect("queue is circular");
            let next = self.slots[p.0].next.expect("queue is circular");
            self.slots[prev.0].next = Some(next);
            self.slots[next.0].prev = Some(prev);
            if *tail == Some(p) {
                *tail = Some(prev);
            }
        }

        self.slots[p.0].next = None;
        self.slots[p.0].prev = None;
        Some(p)
    }

    /// Peek at the head of the queue.
    pub fn head_proc_q(&self, tail: Option<PcbRef>) -> Option<PcbRef> {
        tail.and_then(|t| self.slots[t.0].next)
    }

    /// Number of PCBs on the queue.
    pub fn queue_len(&self, tail: Option<PcbRef>) -> usize {
        let Some(head) = self.head_proc_q(tail) else {
            return 0;
        };
        let mut n = 1;
        let mut cur = self.slots[head.0].next.expect("queue is circular");
        while cur != head {
            n += 1;
            cur = self.slots[cur.0].next.expect("queue is circular");
        }
        n
    }

    /// Whether `p` has no children.
    pub fn empty_child(&self, p: PcbRef) -> bool {
        self.slots[p.0].child.is_none()
    }

    /// Make `p` the first child of `parent`.
    pub fn insert_child(&mut self, parent: PcbRef, p: PcbRef) {
        self.slots[p.0].sib = self.slots[parent.0].child;
        self.slots[p.0].parent = Some(parent);
        self.slots[parent.0].child = Some(p);
    }

    /// Detach and return the first child of `p`.
    pub fn remove_child(&mut self, p: PcbRef) -> Option<PcbRef> {
        let child = self.slots[p.0].child?;
        self.slots[p.0].child = self.slots[child.0].sib;
        self.slots[child.0].parent = None;
        self.slots[child.0].sib = None;
        Some(child)
    }

    /// Detach `p` from its parent, wherever it sits in the sibling chain.
    /// Returns `None` if `p` has no parent.
    pub fn out_child(&mut self, p: PcbRef) -> Option<PcbRef> {
        let parent = self.slots[p.0].parent?;

        if self.slots[parent.0].child == Some(p) {
            self.slots[parent.0].child = self.slots[p.0].sib;
        } else {
            let mut prev = self.slots[parent.0].child.expect("p is a child of parent");
            while self.slots[prev.0].sib != Some(p) {
                prev = self.slots[prev.0].sib.expect("p is a child of parent");
            }
            self.slots[prev.0].sib = self.slots[p.0].sib;
        }

        self.slots[p.0].parent = None;
        self.slots[p.0].sib = None;
        Some(p)
    }

    /// The first child of `p`.
    pub fn first_child(&self, p: PcbRef) -> Option<PcbRef> {
        self.slots[p.0].child
    }

    /// The next sibling of `p`.
    pub fn next_sibling(&self, p: PcbRef) -> Option<PcbRef> {
        self.slots[p.0].sib
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(pool: &mut PcbPool) -> Vec<PcbRef> {
        std::iter::from_fn(|| pool.alloc()).collect()
    }

    #[test]
    fn pool_capacity_and_reuse() {
        let mut pool = PcbPool::new();
        let all = drain_all(&mut pool);
        assert_eq!(all.len(), MAXPROC);
        assert!(pool.alloc().is_none(), "exhausted pool returns none");

        pool.free(all[3]);
        assert_eq!(pool.alloc(), Some(all[3]));
    }

    #[test]
    fn allocation_zeroes_every_field() {
        let mut pool = PcbPool::new();
        let p = pool.alloc().unwrap();
        pool.get_mut(p).time = 1234;
        pool.get_mut(p).sem_key = Some(SemKey(7));
        pool.get_mut(p).state.set_v0(99);
        let mut q = None;
        pool.insert_proc_q(&mut q, p);
        pool.out_proc_q(&mut q, p);
        pool.free(p);

        let p2 = pool.alloc().unwrap();
        assert_eq!(p2, p);
        let pcb = pool.get(p2);
        assert_eq!(pcb.time, 0);
        assert_eq!(pcb.sem_key, None);
        assert_eq!(pcb.state.v0(), 0);
        assert!(pcb.next.is_none() && pcb.prev.is_none());
        assert!(pcb.parent.is_none() && pcb.child.is_none() && pcb.sib.is_none());
    }

    #[test]
    fn queue_is_fifo() {
        let mut pool = PcbPool::new();
        let (a, b, c) = (
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
        );
        let mut q = None;
        assert!(pool.empty_proc_q(q));
        pool.insert_proc_q(&mut q, a);
        pool.insert_proc_q(&mut q, b);
        pool.insert_proc_q(&mut q, c);
        assert_eq!(pool.head_proc_q(q), Some(a));
        assert_eq!(pool.remove_proc_q(&mut q), Some(a));
        assert_eq!(pool.remove_proc_q(&mut q), Some(b));
        assert_eq!(pool.remove_proc_q(&mut q), Some(c));
        assert_eq!(pool.remove_proc_q(&mut q), None);
        assert!(pool.empty_proc_q(q));
    }

    #[test]
    fn out_proc_q_removes_from_the_middle_and_fixes_the_tail() {
        let mut pool = PcbPool::new();
        let (a, b, c) = (
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
        );
        let mut q = None;
        pool.insert_proc_q(&mut q, a);
        pool.insert_proc_q(&mut q, b);
        pool.insert_proc_q(&mut q, c);

        assert_eq!(pool.out_proc_q(&mut q, b), Some(b));
        assert_eq!(pool.out_proc_q(&mut q, b), None, "not on the queue twice");
        // Removing the tail moves the tail pointer back.
        assert_eq!(pool.out_proc_q(&mut q, c), Some(c));
        assert_eq!(q, Some(a));
        assert_eq!(pool.remove_proc_q(&mut q), Some(a));
    }

    #[test]
    fn tree_insertion_is_lifo_and_out_child_handles_middles() {
        let mut pool = PcbPool::new();
        let parent = pool.alloc().unwrap();
        let (a, b, c) = (
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
            pool.alloc().unwrap(),
        );
        pool.insert_child(parent, a);
        pool.insert_child(parent, b);
        pool.insert_child(parent, c);
        assert!(!pool.empty_child(parent));

        // LIFO: last inserted is the first child.
        assert_eq!(pool.first_child(parent), Some(c));

        // Remove from the middle of the sibling chain.
        assert_eq!(pool.out_child(b), Some(b));
        assert_eq!(pool.out_child(b), None, "already detached");

        assert_eq!(pool.remove_child(parent), Some(c));
        assert_eq!(pool.remove_child(parent), Some(a));
        assert_eq!(pool.remove_child(parent), None);
        assert!(pool.empty_child(parent));
    }
}
