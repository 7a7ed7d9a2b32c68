//! Kernel execution contexts.
//!
//! Every process owns one kernel execution context: a host thread standing in
//! for the per-process kernel stacks a real machine would give it. The
//! machine loop and the contexts exchange ownership of the whole [`System`]
//! over channels, so exactly one logical context runs at any instant and
//! there is no shared-memory concurrency anywhere in the kernel.
//!
//! A context is activated in one of three ways: to run the process body (a
//! kernel-mode process such as the instantiator or the delay daemon), to run
//! a passed-up exception handler on behalf of a U-proc, or to resume after
//! blocking. When code running on a context calls a blocking nucleus service,
//! the service parks the context — hands the system back and waits — until
//! the scheduler dispatches the owning process again. A page fault taken
//! inside a handler nests the pager as an ordinary call on the same context,
//! which is exactly the second exception stack of the support structure.
//!
//! Teardown is implicit: freeing a PCB drops the activation channel, and a
//! context parked on it unwinds quietly the next time it would run.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::asl::SemKey;
use crate::initial::System;
use crate::interrupts;
use crate::pcb::PcbRef;
use crate::support::{ExcSlot, SupRef};
use umach::cpu::{ProcessorState, Status};

/// Emulated cost of one nucleus service call from kernel-native code, in
/// microseconds.
pub(crate) const SERVICE_TICK: u64 = 10;

/// A kernel-mode process body.
pub type Body = Box<dyn FnOnce(&mut KernelCtx<'_>) + Send + 'static>;

/// What a context is being asked to do.
pub(crate) enum EntryKind {
    /// Run the process body (once).
    Body,
    /// Run the passed-up exception handler for the given slot.
    PassUp(ExcSlot),
    /// Resume a context parked inside a blocking service.
    Resume,
}

pub(crate) struct Activation {
    pub sys: Box<System>,
    pub me: PcbRef,
    pub kind: EntryKind,
}

/// How a context hands control back to the machine loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum YieldKind {
    /// The current process blocked or died; run the scheduler.
    Schedule,
    /// A saved state has been loaded; resume interpreting it.
    ResumeUser,
}

pub(crate) struct Yield {
    pub sys: Box<System>,
    pub kind: YieldKind,
}

/// The kernel-side handle of a context, stored in the owning PCB.
pub struct NativeHandle {
    pub(crate) tx: Sender<Activation>,
    /// Whether this context carries a process body (a kernel-mode process).
    pub(crate) kernel: bool,
    /// Whether the body has been started.
    pub(crate) started: bool,
    /// Whether the context is parked inside a blocking service.
    pub(crate) parked: bool,
}

/// Quiet-unwind payload for a context whose process was torn down while the
/// context was parked.
struct TornDown;

/// Spawn the context thread for a new process.
pub(crate) fn spawn(body: Option<Body>, yield_tx: Sender<Yield>) -> NativeHandle {
    let kernel = body.is_some();
    let (tx, rx) = channel();
    std::thread::spawn(move || {
        // A torn-down context unwinds with `TornDown`; swallow it here so the
        // thread just ends.
        let _ = catch_unwind(AssertUnwindSafe(move || worker(body, rx, yield_tx)));
    });
    NativeHandle { tx, kernel, started: false, parked: false }
}

fn worker(mut body: Option<Body>, rx: Receiver<Activation>, yield_tx: Sender<Yield>) {
    while let Ok(act) = rx.recv() {
        let mut ctx = KernelCtx {
            sys: Some(act.sys),
            me: act.me,
            rx: &rx,
            yield_tx: &yield_tx,
            outcome: YieldKind::Schedule,
        };
        match act.kind {
            EntryKind::Body => {
                let body = body.take().expect("a process body runs once");
                body(&mut ctx);
            }
            EntryKind::PassUp(slot) => crate::support::handle_passup(&mut ctx, slot),
            EntryKind::Resume => unreachable!("resume delivered to an unparked context"),
        }
        let kind = ctx.outcome;
        let Some(sys) = ctx.sys.take() else { return };
        if yield_tx.send(Yield { sys, kind }).is_err() {
            return;
        }
    }
}

/// The interface kernel-native code sees: direct access to the system it
/// currently owns, plus the nucleus services, which may park the context.
pub struct KernelCtx<'a> {
    sys: Option<Box<System>>,
    me: PcbRef,
    rx: &'a Receiver<Activation>,
    yield_tx: &'a Sender<Yield>,
    outcome: YieldKind,
}

impl KernelCtx<'_> {
    /// The PCB of the process this context belongs to.
    pub fn me(&self) -> PcbRef {
        self.me
    }

    /// The system, mutably. The context owns it whenever its code runs.
    pub fn sys_mut(&mut self) -> &mut System {
        self.sys.as_mut().expect("running context owns the system")
    }

    /// The system, shared.
    pub fn sys_ref(&self) -> &System {
        self.sys.as_ref().expect("running context owns the system")
    }

    /// The support structure of this process, if it has one.
    pub fn current_support(&self) -> Option<SupRef> {
        self.sys_ref().nucleus.pcbs.get(self.me).support
    }

    /// Current time of day in microseconds.
    pub fn now(&self) -> u64 {
        self.sys_ref().machine.now()
    }

    /// Account the emulated cost of a service call and deliver any interrupt
    /// that became pending, unless this process runs with interrupts masked.
    fn tick(&mut self) {
        let me = self.me;
        let sys = self.sys_mut();
        sys.machine.clock.advance(SERVICE_TICK);
        sys.machine.pump_io();
        let ks = sys.nucleus.pcbs.get(me).kstatus;
        if ks.interrupts_on() {
            interrupts::service_pending(sys, ks);
        }
    }

    /// Hand the system back to the machine loop and wait until the scheduler
    /// dispatches this process again.
    fn park(&mut self) {
        {
            let me = self.me;
            let sys = self.sys_mut();
            if let Some(n) = sys.nucleus.pcbs.get_mut(me).native.as_mut() {
                n.parked = true;
            }
        }
        let sys = self.sys.take().expect("running context owns the system");
        if self
            .yield_tx
            .send(Yield { sys, kind: YieldKind::Schedule })
            .is_err()
        {
            resume_unwind(Box::new(TornDown));
        }
        match self.rx.recv() {
            Ok(act) => {
                debug_assert!(matches!(act.kind, EntryKind::Resume));
                self.sys = Some(act.sys);
                let me = self.me;
                let sys = self.sys_mut();
                if let Some(n) = sys.nucleus.pcbs.get_mut(me).native.as_mut() {
                    n.parked = false;
                }
            }
            // The process was terminated while blocked.
            Err(_) => resume_unwind(Box::new(TornDown)),
        }
    }

    /// P a kernel semaphore, blocking when no capacity is free.
    pub fn passeren(&mut self, key: SemKey) {
        self.tick();
        if self.sys_mut().do_passeren(key) {
            self.park();
        }
    }

    /// V a kernel semaphore, readying its longest waiter if any.
    pub fn verhogen(&mut self, key: SemKey) {
        self.tick();
        self.sys_mut().do_verhogen(key);
    }

    /// Block until the named (sub-)device completes; returns its status.
    pub fn wait_io(&mut self, line: u32, dev: usize, recv: bool) -> u32 {
        self.tick();
        self.sys_mut().do_wait_io(line, dev, recv);
        self.park();
        let me = self.me;
        self.sys_ref().nucleus.pcbs.get(me).state.v0()
    }

    /// Block until the next pseudo-clock tick.
    pub fn wait_clock(&mut self) {
        self.tick();
        self.sys_mut().do_wait_clock();
        self.park();
    }

    /// Create a child of this process. `body` makes it a kernel-mode process;
    /// without one it is dispatched by interpreting its saved state.
    pub fn create_process(
        &mut self,
        state: ProcessorState,
        support: Option<SupRef>,
        body: Option<Body>,
    ) -> Option<PcbRef> {
        self.tick();
        self.sys_mut().do_create_process(state, support, body)
    }

    /// Terminate this process and its entire subtree. The caller must return
    /// promptly; nothing else may run on this context afterwards.
    pub fn terminate_self(&mut self) {
        self.tick();
        let me = self.me;
        let sys = self.sys_mut();
        debug_assert_eq!(sys.nucleus.current, Some(me), "only the running process terminates itself");
        sys.terminate_subtree(me);
    }

    /// Accumulated CPU time of this process, including the running slice.
    pub fn cpu_time(&mut self) -> u64 {
        self.tick();
        self.sys_ref().cpu_time()
    }

    /// Run `f` with interrupt delivery to this process disabled, restoring
    /// the previous state afterwards.
    pub fn masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let me = self.me;
        let was_on = {
            let pcb = self.sys_mut().nucleus.pcbs.get_mut(me);
            let on = pcb.kstatus.interrupts_on();
            pcb.kstatus.remove(Status::IEC);
            on
        };
        let r = f(self);
        self.sys_mut()
            .nucleus
            .pcbs
            .get_mut(me)
            .kstatus
            .set(Status::IEC, was_on);
        r
    }

    /// Load a saved exception state of this process's support structure and
    /// arrange for the machine loop to resume interpreting it.
    pub fn resume_from(&mut self, sup: SupRef, slot: ExcSlot) {
        let state = self.sys_ref().support.pool.get(sup).except_state[slot as usize].clone();
        self.sys_mut().machine.load_state(&state);
        self.outcome = YieldKind::ResumeUser;
    }
}
