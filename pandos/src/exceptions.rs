//! The unified exception dispatcher and the nucleus services.
//!
//! The machine deposits the saved state in [`System::machine`]`.cpu` (status
//! pushed, PC at the trapping instruction) and the loop in [`crate::initial`]
//! hands the typed event here. Interrupts go to [`crate::interrupts`]; TLB
//! refills are resolved against the current process's page tables; TLB
//! invalid/modified exceptions pass up through the page-fault slot; program
//! traps and user-mode system calls pass up through the general slot; a
//! process with no support structure dies, subtree and all.
//!
//! The nucleus services themselves (create, terminate, P, V, device wait,
//! clock wait, CPU time) are methods on [`System`], invoked by kernel-native
//! code through its [`crate::kcontext::KernelCtx`]. A user-mode process can
//! only reach them by trapping, and system call numbers 1..=8 from user mode
//! are privileged: the dispatcher rewrites them into reserved-instruction
//! program traps before passing up.

use crate::asl::{PSEUDO_CLOCK, SemKey, device_sem_key};
use crate::initial::System;
use crate::interrupts;
use crate::kcontext::{self, Body};
use crate::pcb::PcbRef;
use crate::support::{ExcSlot, SupRef, vm};
use umach::Event;
use umach::cpu::{ExceptionCode, ProcessorState};
use umach::tlb::{EntryHi, TlbEntry};

/// Where control goes after handling an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Control {
    /// Reload the saved state and keep running the current process.
    Resume,
    /// The current process blocked, died or was preempted; reschedule.
    Schedule,
    /// Activate the current process's context on the given exception slot.
    PassUp(ExcSlot),
}

/// Dispatch one machine event.
pub(crate) fn handle_event(sys: &mut System, ev: Event) -> Control {
    match ev {
        Event::Interrupt => interrupts::handle(sys),
        Event::Refill { hi, store } => refill(sys, hi, store),
        Event::Exception(code) => match code {
            ExceptionCode::Interrupt => interrupts::handle(sys),
            ExceptionCode::TlbMod
            | ExceptionCode::TlbLoadInvalid
            | ExceptionCode::TlbStoreInvalid => pass_up_or_die(sys, ExcSlot::PageFault),
            ExceptionCode::Syscall => syscall_handler(sys),
            _ => pass_up_or_die(sys, ExcSlot::General),
        },
    }
}

/// TLB refill: write the page-table entry for the missing page into the TLB
/// and retry. The entry need not be valid — a retry of an invalid entry
/// raises the TLB-invalid exception that reaches the pager.
fn refill(sys: &mut System, hi: EntryHi, store: bool) -> Control {
    let Some(cur) = sys.nucleus.current else {
        return Control::Schedule;
    };
    let Some(sup) = sys.nucleus.pcbs.get(cur).support else {
        // No page table to consult.
        sys.terminate_subtree(cur);
        return Control::Schedule;
    };
    match vm::lookup_pte(sys, sup, hi.vpn()) {
        Some(pte) => {
            sys.machine.tlb.write_random(TlbEntry { hi: pte.hi, lo: pte.lo });
            Control::Resume
        }
        None => {
            // An access outside every page table is a plain bad address; a
            // refill leaves the cause register untouched, so write it here.
            sys.machine.cpu.cause.set_exc_code(if store {
                ExceptionCode::AddressStore
            } else {
                ExceptionCode::AddressLoad
            });
            pass_up_or_die(sys, ExcSlot::General)
        }
    }
}

/// A SYSCALL from user mode. Numbers 1..=8 are privileged: they become
/// reserved-instruction program traps. Everything else is the support
/// layer's business and passes up as-is (the support layer advances the PC).
fn syscall_handler(sys: &mut System) -> Control {
    let num = sys.machine.cpu.a0();
    if (1..=8).contains(&num) {
        sys.machine
            .cpu
            .cause
            .set_exc_code(ExceptionCode::ReservedInstruction);
    }
    pass_up_or_die(sys, ExcSlot::General)
}

/// Copy the saved state into the support structure and hand control to the
/// matching handler context — or, with no support structure, terminate the
/// whole subtree.
pub(crate) fn pass_up_or_die(sys: &mut System, slot: ExcSlot) -> Control {
    let cur = sys
        .nucleus
        .current
        .expect("an exception implies a running process");
    match sys.nucleus.pcbs.get(cur).support {
        None => {
            sys.terminate_subtree(cur);
            Control::Schedule
        }
        Some(sup) => {
            let saved = sys.machine.cpu.clone();
            sys.support.pool.get_mut(sup).except_state[slot as usize] = saved;
            Control::PassUp(slot)
        }
    }
}

impl System {
    /// Charge the running slice to the current process.
    pub(crate) fn charge_current(&mut self) {
        if let Some(cur) = self.nucleus.current {
            let elapsed = self.machine.now().saturating_sub(self.nucleus.quantum_start);
            self.nucleus.pcbs.get_mut(cur).time += elapsed;
        }
    }

    /// Block the current process on `key`: charge its time, queue it on the
    /// ASL, and leave the processor idle for the scheduler.
    fn block_current(&mut self, key: SemKey) {
        let cur = self
            .nucleus
            .current
            .expect("only a running process blocks");
        self.charge_current();
        let n = &mut self.nucleus;
        n.asl
            .insert_blocked(&mut n.pcbs, key, cur)
            .expect("descriptor pool covers every process");
        n.current = None;
    }

    /// P: decrement; on a negative result the caller blocked (FIFO).
    pub(crate) fn do_passeren(&mut self, key: SemKey) -> bool {
        if self.nucleus.sems.decrement(key) < 0 {
            self.block_current(key);
            true
        } else {
            false
        }
    }

    /// V: increment; wake the longest waiter if any.
    pub(crate) fn do_verhogen(&mut self, key: SemKey) {
        if self.nucleus.sems.increment(key) <= 0 {
            let n = &mut self.nucleus;
            if let Some(p) = n.asl.remove_blocked(&mut n.pcbs, key) {
                n.pcbs.insert_proc_q(&mut n.ready, p);
            }
        }
    }

    /// Wait for the named (sub-)device: always blocks; the interrupt handler
    /// wakes the waiter with the device status in its v0.
    pub(crate) fn do_wait_io(&mut self, line: u32, dev: usize, recv: bool) {
        let key = device_sem_key(line, dev, recv);
        self.nucleus.sems.decrement(key);
        self.nucleus.soft_block_cnt += 1;
        self.block_current(key);
    }

    /// Wait for the next pseudo-clock tick: always blocks; the interval
    /// timer wakes every waiter at once.
    pub(crate) fn do_wait_clock(&mut self) {
        self.nucleus.sems.decrement(PSEUDO_CLOCK);
        self.nucleus.soft_block_cnt += 1;
        self.block_current(PSEUDO_CLOCK);
    }

    /// Accumulated CPU time of the current process, running slice included.
    pub(crate) fn cpu_time(&self) -> u64 {
        let cur = self
            .nucleus
            .current
            .expect("only a running process asks for its time");
        let elapsed = self.machine.now().saturating_sub(self.nucleus.quantum_start);
        self.nucleus.pcbs.get(cur).time + elapsed
    }

    /// Create a child of the current process from a saved state; returns
    /// `None` on PCB pool exhaustion.
    pub(crate) fn do_create_process(
        &mut self,
        state: ProcessorState,
        support: Option<SupRef>,
        body: Option<Body>,
    ) -> Option<PcbRef> {
        let p = self.nucleus.pcbs.alloc()?;
        let handle = kcontext::spawn(body, self.yield_tx.clone());
        {
            let pcb = self.nucleus.pcbs.get_mut(p);
            pcb.state = state;
            let mut ks = pcb.state.status;
            ks.pop();
            pcb.kstatus = ks;
            pcb.support = support;
            pcb.native = Some(handle);
        }
        let n = &mut self.nucleus;
        n.pcbs.insert_proc_q(&mut n.ready, p);
        if let Some(cur) = n.current {
            n.pcbs.insert_child(cur, p);
        }
        n.proc_cnt += 1;
        Some(p)
    }

    /// Terminate `root` and its entire subtree, wherever each victim sits.
    /// A victim blocked on an ordinary semaphore gives its capacity back; a
    /// victim blocked on a device or pseudo-clock semaphore does not (the
    /// interrupt will still V it) but leaves the soft-block count.
    pub(crate) fn terminate_subtree(&mut self, root: PcbRef) {
        let n = &mut self.nucleus;
        n.pcbs.out_child(root);

        let mut stack = vec![root];
        let mut victims = Vec::new();
        while let Some(p) = stack.pop() {
            victims.push(p);
            let mut c = n.pcbs.first_child(p);
            while let Some(child) = c {
                stack.push(child);
                c = n.pcbs.next_sibling(child);
            }
        }

        for p in victims {
            if n.current == Some(p) {
                n.current = None;
            } else if n.pcbs.out_proc_q(&mut n.ready, p).is_some() {
                // Was waiting for the processor; nothing else to undo.
            } else if n.asl.out_blocked(&mut n.pcbs, p).is_some() {
                let key = n
                    .pcbs
                    .get(p)
                    .sem_key
                    .expect("a blocked victim carries its key");
                if n.sems.is_device_key(key) {
                    n.soft_block_cnt -= 1;
                } else {
                    n.sems.increment(key);
                }
            }
            n.pcbs.free(p);
            n.proc_cnt -= 1;
        }
    }
}
