//! Nucleus initialization and the machine loop.
//!
//! Booting wires the interval timer, builds the data-structure layer, and
//! readies a single kernel-mode process — the entry the caller hands in,
//! normally the instantiator ([`crate::support::init::instantiator`]) — then
//! enters the loop that a real machine keeps in hardware: dispatch the
//! current process, catch the next [`Event`], hand it to the exception
//! dispatcher, repeat. The loop ends when the scheduler reports an orderly
//! halt or a panic condition.

use std::sync::mpsc::{Receiver, Sender, channel};

use crate::asl::{Asl, SemTable};
use crate::exceptions::{self, Control};
use crate::kcontext::{self, Activation, Body, EntryKind, Yield, YieldKind};
use crate::pcb::{PcbPool, PcbRef};
use crate::scheduler::{self, Schedule};
use crate::support::SupportGlobals;
use crate::{PSEUDO_CLOCK_PERIOD, interrupts};
use umach::cpu::{ProcessorState, Status, reg};
use umach::{Machine, info, warning};

/// How a run ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// All processes terminated; orderly shutdown.
    Halt,
    /// The kernel hit an unrecoverable condition.
    Panic(&'static str),
}

/// Nucleus-wide state: the pools, the ready queue, the counters.
pub struct Nucleus {
    /// The PCB arena.
    pub pcbs: PcbPool,
    /// The Active Semaphore List.
    pub asl: Asl,
    /// The kernel semaphore table.
    pub sems: SemTable,
    /// Tail of the ready queue.
    pub ready: Option<PcbRef>,
    /// The running process.
    pub current: Option<PcbRef>,
    /// Started but not yet terminated processes.
    pub proc_cnt: usize,
    /// Processes blocked on a device or pseudo-clock semaphore.
    pub soft_block_cnt: usize,
    /// When the running process was dispatched.
    pub quantum_start: u64,
}

/// The whole system: machine, nucleus, and support-level globals. Exactly one
/// logical context owns it at any instant.
pub struct System {
    /// The machine being driven.
    pub machine: Machine,
    /// Nucleus state.
    pub nucleus: Nucleus,
    /// Support-level globals.
    pub support: SupportGlobals,
    pub(crate) yield_tx: Sender<Yield>,
}

/// Boot the nucleus on a machine with `entry` as the first process.
fn boot(machine: Machine, entry: Body) -> (Box<System>, Receiver<Yield>) {
    let (yield_tx, yield_rx) = channel();
    let mut sems = SemTable::new();
    let support = SupportGlobals::new(&mut sems);
    let mut sys = Box::new(System {
        machine,
        nucleus: Nucleus {
            pcbs: PcbPool::new(),
            asl: Asl::new(),
            sems,
            ready: None,
            current: None,
            proc_cnt: 0,
            soft_block_cnt: 0,
            quantum_start: 0,
        },
        support,
        yield_tx,
    });

    sys.machine.load_interval(PSEUDO_CLOCK_PERIOD);

    // The first process: kernel mode, interrupts and the local timer enabled
    // once dispatched, stack at the top of RAM.
    let mut state = ProcessorState::new();
    state.status = Status::IEP | Status::IM_ALL | Status::TE;
    state.gpr[reg::SP] = sys.machine.ram.top().into_u32();

    let handle = kcontext::spawn(Some(entry), sys.yield_tx.clone());
    let p = sys.nucleus.pcbs.alloc().expect("fresh pool has room");
    {
        let pcb = sys.nucleus.pcbs.get_mut(p);
        pcb.state = state;
        let mut ks = pcb.state.status;
        ks.pop();
        pcb.kstatus = ks;
        pcb.native = Some(handle);
    }
    let n = &mut sys.nucleus;
    n.pcbs.insert_proc_q(&mut n.ready, p);
    n.proc_cnt = 1;

    info!("nucleus: boot complete, first process ready");
    (sys, yield_rx)
}

/// Run a booted system to completion; returns the outcome and the final
/// system for inspection.
pub fn boot_and_run(machine: Machine, entry: Body) -> (Outcome, Box<System>) {
    let (sys, yield_rx) = boot(machine, entry);
    run(sys, yield_rx)
}

fn run(mut sys: Box<System>, yield_rx: Receiver<Yield>) -> (Outcome, Box<System>) {
    'schedule: loop {
        let p = loop {
            match scheduler::schedule(&mut sys) {
                Schedule::Dispatch(p) => break p,
                Schedule::Halt => {
                    info!("nucleus: all processes terminated, halting");
                    return (Outcome::Halt, sys);
                }
                Schedule::Deadlock => {
                    warning!("nucleus: live processes but nothing can ever run");
                    return (Outcome::Panic("deadlock"), sys);
                }
                Schedule::Wait => {
                    sys.machine.wait_for_interrupt();
                    let _ = interrupts::handle(&mut sys);
                }
            }
        };

        // Kernel-mode bodies and parked contexts run on their context; a
        // U-proc's saved state is interpreted directly.
        let mut activation = {
            let pcb = sys.nucleus.pcbs.get(p);
            match &pcb.native {
                Some(n) if n.parked => Some(EntryKind::Resume),
                Some(n) if n.kernel && !n.started => Some(EntryKind::Body),
                _ => None,
            }
        };

        loop {
            if let Some(kind) = activation.take() {
                if matches!(kind, EntryKind::Body) {
                    if let Some(n) = sys.nucleus.pcbs.get_mut(p).native.as_mut() {
                        n.started = true;
                    }
                }
                let tx = sys
                    .nucleus
                    .pcbs
                    .get(p)
                    .native
                    .as_ref()
                    .expect("every process carries a context")
                    .tx
                    .clone();
                match tx.send(Activation { sys, me: p, kind }) {
                    Ok(()) => {}
                    Err(lost) => {
                        // The context thread is gone; nothing sane remains.
                        let sys = lost.0.sys;
                        return (Outcome::Panic("kernel context lost"), sys);
                    }
                }
                let y = yield_rx.recv().expect("an active context yields");
                sys = y.sys;
                match y.kind {
                    YieldKind::Schedule => continue 'schedule,
                    YieldKind::ResumeUser => {}
                }
            } else {
                let state = sys.nucleus.pcbs.get(p).state.clone();
                sys.machine.load_state(&state);
            }

            // Interpret the loaded user state until the next kernel entry.
            loop {
                let ev = sys.machine.run_user();
                match exceptions::handle_event(&mut sys, ev) {
                    Control::Resume => sys.machine.cpu.status.pop(),
                    Control::Schedule => continue 'schedule,
                    Control::PassUp(slot) => {
                        activation = Some(EntryKind::PassUp(slot));
                        break;
                    }
                }
            }
        }
    }
}
