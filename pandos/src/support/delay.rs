//! The delay facility: the Active Delay List, its daemon, and SYS18.
//!
//! Sleeping U-procs sit on the ADL sorted by absolute wake-time, bracketed by
//! two sentinel descriptors (wake-times 0 and MAX) so insertion never tests
//! the ends. A kernel-mode daemon rides the pseudo-clock: every tick it takes
//! the ADL mutex, pops every expired sleeper, and Vs each one's private
//! semaphore.
//!
//! SYS18 inserts the caller and then releases the mutex and sleeps on its
//! private semaphore as one interrupts-off step. Without that pairing the
//! daemon could V a private semaphore after the caller released the list but
//! before it committed to sleep, and the wake-up would be lost.

use crate::asl::{SemKey, SemTable};
use crate::kcontext::{Body, KernelCtx};
use crate::support::{ExcSlot, SupRef, Trap};
use crate::{MAX_UPROCS, SECOND};
use umach::addressing::PAGE_SIZE;
use umach::cpu::{ProcessorState, Status, reg};

const ADL_CAPACITY: usize = MAX_UPROCS + 2;

struct DelayNode {
    next: Option<usize>,
    wake: u64,
    sup: Option<SupRef>,
}

/// The Active Delay List.
pub struct Adl {
    nodes: Vec<DelayNode>,
    free: Option<usize>,
    /// Mutual exclusion over the list.
    pub mutex: SemKey,
}

impl Adl {
    /// An empty list: head sentinel at wake-time 0, tail sentinel at MAX,
    /// the rest free.
    pub fn new(sems: &mut SemTable) -> Self {
        let mut nodes: Vec<DelayNode> = (0..ADL_CAPACITY)
            .map(|_| DelayNode { next: None, wake: 0, sup: None })
            .collect();
        nodes[0].next = Some(1);
        nodes[1].wake = u64::MAX;

        let mut adl = Self { nodes, free: None, mutex: sems.alloc(1) };
        for i in (2..ADL_CAPACITY).rev() {
            adl.release(i);
        }
        adl
    }

    fn release(&mut self, i: usize) {
        self.nodes[i] = DelayNode { next: self.free, wake: 0, sup: None };
        self.free = Some(i);
    }

    /// Queue `sup` to wake at `wake`, keeping the list sorted. Fails when the
    /// descriptor pool is dry.
    pub fn insert(&mut self, wake: u64, sup: SupRef) -> Result<(), Trap> {
        let node = self.free.ok_or(Trap::PoolExhausted)?;
        self.free = self.nodes[node].next;
        self.nodes[node].wake = wake;
        self.nodes[node].sup = Some(sup);

        let mut prev = 0;
        let mut cur = self.nodes[prev].next.expect("tail sentinel in place");
        while self.nodes[cur].wake != u64::MAX && self.nodes[cur].wake < wake {
            prev = cur;
            cur = self.nodes[cur].next.expect("tail sentinel in place");
        }
        self.nodes[node].next = Some(cur);
        self.nodes[prev].next = Some(node);
        Ok(())
    }

    /// Pop the earliest sleeper if its wake-time has arrived.
    pub fn pop_expired(&mut self, now: u64) -> Option<SupRef> {
        let head = self.nodes[0].next.expect("tail sentinel in place");
        if self.nodes[head].wake == u64::MAX || self.nodes[head].wake > now {
            return None;
        }
        let sup = self.nodes[head].sup;
        self.nodes[0].next = self.nodes[head].next;
        self.release(head);
        sup
    }

    /// The earliest pending wake-time, if anyone sleeps.
    pub fn head_wake(&self) -> Option<u64> {
        let head = self.nodes[0].next.expect("tail sentinel in place");
        (self.nodes[head].wake != u64::MAX).then(|| self.nodes[head].wake)
    }
}

/// The delay daemon: one pass over the expired prefix per pseudo-clock tick.
fn daemon(ctx: &mut KernelCtx<'_>) {
    loop {
        ctx.wait_clock();
        let mutex = ctx.sys_ref().support.adl.mutex;
        ctx.passeren(mutex);
        let now = ctx.now();
        while let Some(sup) = ctx.sys_mut().support.adl.pop_expired(now) {
            let priv_sem = ctx.sys_ref().support.pool.get(sup).priv_sem;
            ctx.verhogen(priv_sem);
        }
        ctx.verhogen(mutex);
    }
}

/// Launch the delay daemon as a kernel-mode process (ASID 0). Called by the
/// instantiator; a failure to create the daemon takes the instantiator down.
pub(crate) fn start_daemon(ctx: &mut KernelCtx<'_>) -> bool {
    let mut state = ProcessorState::new();
    state.status = Status::IEP | Status::IM_ALL | Status::TE;
    state.gpr[reg::SP] = ctx.sys_ref().machine.ram.top().into_u32() - PAGE_SIZE;
    let body: Body = Box::new(|ctx| daemon(ctx));
    ctx.create_process(state, None, Some(body)).is_some()
}

/// SYS18: sleep for `a1` seconds. Negative requests trap; descriptor
/// exhaustion traps.
pub(crate) fn sys_delay(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let seconds = ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize]
        .a1() as i32;
    if seconds < 0 {
        return Err(Trap::NegativeDelay);
    }
    let wake = ctx.now() + seconds as u64 * SECOND;

    let mutex = ctx.sys_ref().support.adl.mutex;
    ctx.passeren(mutex);
    if let Err(trap) = ctx.sys_mut().support.adl.insert(wake, sup) {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn adl() -> Adl {
        Adl::new(&mut SemTable::new())
    }

    #[test]
    fn insertion_keeps_wake_order() {
        let mut adl = adl();
        adl.insert(300, SupRef::test(0)).unwrap();
        adl.insert(100, SupRef::test(1)).unwrap();
        adl.insert(200, SupRef::test(2)).unwrap();

        assert_eq!(adl.head_wake(), Some(100));
        assert_eq!(adl.pop_expired(250), Some(SupRef::test(1)));
        assert_eq!(adl.pop_expired(250), Some(SupRef::test(2)));
        assert_eq!(adl.pop_expired(250), None, "300 has not expired");
        assert_eq!(adl.pop_expired(300), Some(SupRef::test(0)));
        assert_eq!(adl.head_wake(), None);
    }

    #[test]
    fn pool_is_bounded() {
        let mut adl = adl();
        for i in 0..MAX_UPROCS {
            adl.insert(i as u64, SupRef::test(i)).unwrap();
        }
        assert_eq!(adl.insert(99, SupRef::test(0)), Err(Trap::PoolExhausted));
        // Draining frees descriptors for reuse.
        assert!(adl.pop_expired(u64::MAX - 1).is_some());
        assert!(adl.insert(99, SupRef::test(0)).is_ok());
    }
}
