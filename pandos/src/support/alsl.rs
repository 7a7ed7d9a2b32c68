//! Shared-region semaphores: the Active Logical Semaphore List and
//! SYS19/SYS20.
//!
//! A logical semaphore is an ordinary integer living at a shared virtual
//! address inside KUSEGSHARE, reached through the global page table like any
//! user access — including taking a page fault on the way. The ALSL holds one
//! descriptor per *blocked* U-proc, tagged with the semaphore's address, on a
//! circular doubly-linked list addressed by its tail: insertion is FIFO, and
//! V wakes the oldest matching entry by linear search from the head.
//!
//! Blocking uses the caller's private semaphore, with the same
//! release-and-sleep pairing as the delay facility.

use crate::asl::{SemKey, SemTable};
use crate::kcontext::KernelCtx;
use crate::support::{ExcSlot, SupRef, Trap, vm};
use crate::{KUSEGSHARE_PAGES, VPN_KUSEGSHARE_BASE};
use umach::addressing::{PAGE_SIZE, Va};

const ALSL_CAPACITY: usize = crate::MAX_UPROCS;

struct AlslNode {
    next: usize,
    prev: usize,
    sem: Va,
    sup: Option<SupRef>,
}

/// The Active Logical Semaphore List.
pub struct Alsl {
    nodes: Vec<AlslNode>,
    free: Vec<usize>,
    tail: Option<usize>,
    /// Mutual exclusion over the list.
    pub mutex: SemKey,
}

impl Alsl {
    /// An empty list.
    pub fn new(sems: &mut SemTable) -> Self {
        Self {
            nodes: (0..ALSL_CAPACITY)
                .map(|_| AlslNode { next: 0, prev: 0, sem: Va::new(0), sup: None })
                .collect(),
            free: (0..ALSL_CAPACITY).collect(),
            tail: None,
            mutex: sems.alloc(1),
        }
    }

    /// Queue `sup` as the newest waiter on `sem`. Fails when the descriptor
    /// pool is dry.
    pub fn insert(&mut self, sem: Va, sup: SupRef) -> Result<(), Trap> {
        let node = self.free.pop().ok_or(Trap::PoolExhausted)?;
        self.nodes[node].sem = sem;
        self.nodes[node].sup = Some(sup);
        match self.tail {
            None => {
                self.nodes[node].next = node;
                self.nodes[node].prev = node;
            }
            Some(tail) => {
                let head = self.nodes[tail].next;
                self.nodes[node].next = head;
                self.nodes[head].prev = node;
                self.nodes[tail].next = node;
                self.nodes[node].prev = tail;
            }
        }
        self.tail = Some(node);
        Ok(())
    }

    /// Remove and return the *oldest* waiter on `sem`, if any.
    pub fn remove_oldest(&mut self, sem: Va) -> Option<SupRef> {
        let tail = self.tail?;
        let head = self.nodes[tail].next;
        let mut cur = head;
        let found = loop {
            if self.nodes[cur].sem == sem {
                break Some(cur);
            }
            cur = self.nodes[cur].next;
            if cur == head {
                break None;
            }
        }?;

        let sup = self.nodes[found].sup;
        if self.nodes[found].next == found {
            // Only node on the list.
            self.tail = None;
        } else {
            let prev = self.nodes[found].prev;
            let next = self.nodes[found].next;
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
            if self.tail == Some(found) {
                self.tail = Some(prev);
            }
        }
        self.nodes[found].sup = None;
        self.free.push(found);
        sup
    }

    /// Number of blocked U-procs on the list.
    pub fn len(&self) -> usize {
        ALSL_CAPACITY - self.free.len()
    }

    /// Whether nobody is blocked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The cell must be a word inside the shared region.
fn validate_shared(va: Va) -> Result<(), Trap> {
    let base = VPN_KUSEGSHARE_BASE << 12;
    let end = base + KUSEGSHARE_PAGES as u32 * PAGE_SIZE;
    if !(base..end).contains(&va.into_u32()) || !va.aligned() {
        return Err(Trap::OutsideSharedRegion);
    }
    Ok(())
}

/// SYS19: P the shared semaphore at `a1`.
pub(crate) fn sys_p_logical(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let va = Va::new(
        ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize].a1(),
    );
    validate_shared(va)?;

    let value = vm::rmw_user_word(ctx, va, -1)?;
    if value >= 0 {
        ctx.resume_from(sup, ExcSlot::General);
        return Ok(());
    }

    let mutex = ctx.sys_ref().support.alsl.mutex;
    ctx.passeren(mutex);
    if let Err(trap) = ctx.sys_mut().support.alsl.insert(va, sup) {
        ctx.verhogen(mutex);
        return Err(trap);
    }

    // Release the list and commit to sleep as one step.
    let priv_sem = ctx.sys_ref().support.pool.get(sup).priv_sem;
    ctx.masked(|ctx| {
        ctx.verhogen(mutex);
        ctx.passeren(priv_sem);
    });

    ctx.resume_from(sup, ExcSlot::General);
    Ok(())
}

/// SYS20: V the shared semaphore at `a1`, waking the oldest waiter.
pub(crate) fn sys_v_logical(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let va = Va::new(
        ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize].a1(),
    );
    validate_shared(va)?;

    let value = vm::rmw_user_word(ctx, va, 1)?;
    if value > 0 {
        ctx.resume_from(sup, ExcSlot::General);
        return Ok(());
    }

    let mutex = ctx.sys_ref().support.alsl.mutex;
    ctx.passeren(mutex);
    let woken = ctx.sys_mut().support.alsl.remove_oldest(va);
    if let Some(blocked) = woken {
        let priv_sem = ctx.sys_ref().support.pool.get(blocked).priv_sem;
        ctx.verhogen(priv_sem);
    }
    ctx.verhogen(mutex);

    ctx.resume_from(sup, ExcSlot::General);
    Ok(())
}
