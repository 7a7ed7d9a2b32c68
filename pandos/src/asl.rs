//! Kernel semaphores and the Active Semaphore List.
//!
//! A kernel semaphore is a signed integer cell in the kernel's semaphore
//! table, addressed by a stable [`SemKey`]. A non-negative value is free
//! capacity; a negative value's magnitude is the number of processes queued
//! under that key on the ASL. The first 49 keys are wired: one per peripheral
//! (sub-)device, plus the pseudo-clock. Everything else — support-layer
//! mutexes, the master semaphore, private semaphores, whatever a workload
//! registers — is allocated after them.
//!
//! The ASL itself holds one descriptor per semaphore *with at least one
//! waiter*, on a singly-linked list sorted by key between two permanent
//! sentinels (keys 0 and MAX), so the traversal never tests for the ends.
//! A descriptor whose queue drains goes straight back to the free list.

use crate::pcb::{PcbPool, PcbRef};
use crate::{MAXPROC, NUM_DEVICES};

/// Address of a kernel semaphore: its index in the [`SemTable`]. Doubles as
/// the ASL sort key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SemKey(pub usize);

/// Key of the device semaphore for interrupt line `line`, device `dev`;
/// `recv` selects a terminal's receiver sub-device.
pub fn device_sem_key(line: u32, dev: usize, recv: bool) -> SemKey {
    let base = (line as usize - 3 + recv as usize) * 8;
    SemKey(1 + base + dev)
}

/// Key of the pseudo-clock semaphore.
pub const PSEUDO_CLOCK: SemKey = SemKey(1 + NUM_DEVICES);

/// The kernel semaphore table.
pub struct SemTable {
    cells: Vec<i32>,
}

impl Default for SemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SemTable {
    /// A table with the 48 device semaphores and the pseudo-clock wired in,
    /// all zero. Index 0 is reserved so no live key collides with the low
    /// ASL sentinel.
    pub fn new() -> Self {
        Self {
            cells: vec![0; 1 + NUM_DEVICES + 1],
        }
    }

    /// Register a new semaphore with the given initial value.
    pub fn alloc(&mut self, initial: i32) -> SemKey {
        self.cells.push(initial);
        SemKey(self.cells.len() - 1)
    }

    /// Current value.
    #[inline]
    pub fn value(&self, key: SemKey) -> i32 {
        self.cells[key.0]
    }

    /// Overwrite the value.
    #[inline]
    pub fn set(&mut self, key: SemKey, value: i32) {
        self.cells[key.0] = value;
    }

    /// Decrement and return the new value.
    #[inline]
    pub fn decrement(&mut self, key: SemKey) -> i32 {
        self.cells[key.0] -= 1;
        self.cells[key.0]
    }

    /// Increment and return the new value.
    #[inline]
    pub fn increment(&mut self, key: SemKey) -> i32 {
        self.cells[key.0] += 1;
        self.cells[key.0]
    }

    /// Whether `key` is a device or pseudo-clock semaphore — the ones whose
    /// waiters count as soft-blocked, because an interrupt will eventually
    /// wake them.
    pub fn is_device_key(&self, key: SemKey) -> bool {
        (1..=NUM_DEVICES + 1).contains(&key.0)
    }
}

/// The ASL is exhausted; the caller cannot block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AslExhausted;

const ASL_CAPACITY: usize = MAXPROC + 2;
const LOW_SENTINEL: SemKey = SemKey(0);
const HIGH_SENTINEL: SemKey = SemKey(usize::MAX);

struct Semd {
    next: Option<usize>,
    key: SemKey,
    queue: Option<PcbRef>,
}

/// The Active Semaphore List.
pub struct Asl {
    nodes: Vec<Semd>,
    free_head: Option<usize>,
}

impl Default for Asl {
    fn default() -> Self {
        Self::new()
    }
}

impl Asl {
    /// An empty list: the two sentinels in place, everything else free.
    pub fn new() -> Self {
        let mut nodes: Vec<Semd> = (0..ASL_CAPACITY)
            .map(|_| Semd { next: None, key: LOW_SENTINEL, queue: None })
            .collect();
        nodes[0].key = LOW_SENTINEL;
        nodes[0].next = Some(1);
        nodes[1].key = HIGH_SENTINEL;
        nodes[1].next = None;

        let mut asl = Self { nodes, free_head: None };
        for i in (2..ASL_CAPACITY).rev() {
            asl.release(i);
        }
        asl
    }

    fn release(&mut self, i: usize) {
        self.nodes[i].next = self.free_head;
        self.nodes[i].key = LOW_SENTINEL;
        self.nodes[i].queue = None;
        self.free_head = Some(i);
    }

    fn acquire(&mut self) -> Option<usize> {
        let i = self.free_head?;
        self.free_head = self.nodes[i].next;
        self.nodes[i].next = None;
        self.nodes[i].queue = None;
        Some(i)
    }

    /// The node before where `key` lives (or would live).
    fn find_prev(&self, key: SemKey) -> usize {
        let mut prev = 0;
        let mut cur = self.nodes[prev].next.expect("high sentinel in place");
        while self.nodes[cur].key != HIGH_SENTINEL && self.nodes[cur].key < key {
            prev = cur;
            cur = self.nodes[cur].next.expect("high sentinel in place");
        }
        prev
    }

    fn drop_if_empty(&mut self, prev: usize, node: usize) {
        if self.nodes[node].queue.is_none() {
            self.nodes[prev].next = self.nodes[node].next;
            self.release(node);
        }
    }

    /// Queue `p` under `key`, creating the descriptor on first use, and
    /// record the key in the PCB. Fails only when the descriptor pool is
    /// exhausted.
    pub fn insert_blocked(
        &mut self,
        pool: &mut PcbPool,
        key: SemKey,
        p: PcbRef,
    ) -> Result<(), AslExhausted> {
        let prev = self.find_prev(key);
        let mut node = self.nodes[prev].next.expect("high sentinel in place");

        if self.nodes[node].key != key {
            let fresh = self.acquire().ok_or(AslExhausted)?;
            self.nodes[fresh].next = self.nodes[prev].next;
            self.nodes[prev].next = Some(fresh);
            self.nodes[fresh].key = key;
            node = fresh;
        }

        let mut queue = self.nodes[node].queue;
        pool.insert_proc_q(&mut queue, p);
        self.nodes[node].queue = queue;
        pool.get_mut(p).sem_key = Some(key);
        Ok(())
    }

    /// Dequeue the longest waiter under `key`, clearing its blocked key. The
    /// descriptor is returned to the free list if its queue drains.
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, key: SemKey) -> Option<PcbRef> {
        let prev = self.find_prev(key);
        let node = self.nodes[prev].next.expect("high sentinel in place");
        if self.nodes[node].key != key {
            return None;
        }

        let mut queue = self.nodes[node].queue;
        let p = pool.remove_proc_q(&mut queue);
        self.nodes[node].queue = queue;
        if let Some(p) = p {
            pool.get_mut(p).sem_key = None;
        }
        self.drop_if_empty(prev, node);
        p
    }

    /// Remove `p` from whatever queue it is blocked on. The blocked key is
    /// deliberately left in the PCB: termination needs it to tell device
    /// semaphores from ordinary ones.
    pub fn out_blocked(&mut self, pool: &mut PcbPool, p: PcbRef) -> Option<PcbRef> {
        let key = pool.get(p).sem_key?;
        let prev = self.find_prev(key);
        let node = self.nodes[prev].next.expect("high sentinel in place");
        if self.nodes[node].key != key {
            return None;
        }

        let mut queue = self.nodes[node].queue;
        let out = pool.out_proc_q(&mut queue, p);
        self.nodes[node].queue = queue;
        self.drop_if_empty(prev, node);
        out
    }

    /// Peek at the longest waiter under `key`.
    pub fn head_blocked(&self, pool: &PcbPool, key: SemKey) -> Option<PcbRef> {
        let prev = self.find_prev(key);
        let node = self.nodes[prev].next.expect("high sentinel in place");
        if self.nodes[node].key != key {
            return None;
        }
        pool.head_proc_q(self.nodes[node].queue)
    }

    /// Number of waiters under `key`; a descriptor exists iff this is
    /// non-zero.
    pub fn waiters(&self, pool: &PcbPool, key: SemKey) -> usize {
        let prev = self.find_prev(key);
        let node = self.nodes[prev].next.expect("high sentinel in place");
        if self.nodes[node].key != key {
            return 0;
        }
        pool.queue_len(self.nodes[node].queue)
    }

    /// The keys of every active descriptor, in list order (sorted).
    pub fn active_keys(&self) -> Vec<SemKey> {
        let mut keys = Vec::new();
        let mut cur = self.nodes[0].next;
        while let Some(i) = cur {
            if self.nodes[i].key != HIGH_SENTINEL {
                keys.push(self.nodes[i].key);
            }
            cur = self.nodes[i].next;
        }
        keys
    }
}
