//! Round-robin dispatch with a 5 ms quantum.

use crate::QUANTUM;
use crate::initial::System;
use crate::pcb::PcbRef;

/// What the scheduler decided.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Schedule {
    /// Run this process.
    Dispatch(PcbRef),
    /// No process will ever run again; shut down.
    Halt,
    /// Nothing runnable now, but an interrupt will change that: idle.
    Wait,
    /// Live processes exist and no interrupt can wake any of them.
    Deadlock,
}

/// Pick the next process, or classify the empty ready queue: no live
/// processes is an orderly halt, soft-blocked processes mean an interrupt is
/// coming and the processor may idle, anything else is deadlock.
pub(crate) fn schedule(sys: &mut System) -> Schedule {
    let n = &mut sys.nucleus;
    match n.pcbs.remove_proc_q(&mut n.ready) {
        None => {
            if n.proc_cnt == 0 {
                Schedule::Halt
            } else if n.soft_block_cnt > 0 {
                Schedule::Wait
            } else {
                Schedule::Deadlock
            }
        }
        Some(p) => {
            n.current = Some(p);
            n.quantum_start = sys.machine.now();
            sys.machine.set_plt(QUANTUM);
            Schedule::Dispatch(p)
        }
    }
}
