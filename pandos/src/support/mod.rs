//! The support layer: per-U-proc records and the passed-up exception
//! services.
//!
//! Each U-proc owns a support structure drawn from a stack-based free pool at
//! instantiation: its ASID, two saved exception states with a handler
//! context for each (one for page faults, one for everything else), a
//! 32-entry private page table, and a private semaphore the delay facility
//! and the shared-region semaphores block it on. The record's lifetime is the
//! U-proc's.
//!
//! The general slot funnels every non-TLB exception of a U-proc into
//! [`handle_passup`]: system calls 9..=20 are serviced here, everything else
//! is a program trap. Traps — and every failed validation inside a service,
//! expressed as a [`Trap`] — end in [`terminate`], which releases the
//! U-proc's frames, signals the master semaphore, returns the record, and
//! kills the process subtree.

pub mod alsl;
pub mod chario;
pub mod delay;
pub mod dma;
pub mod init;
pub mod vm;

use crate::asl::{SemKey, SemTable};
use crate::kcontext::KernelCtx;
use crate::{KUSEGSHARE_PAGES, MAX_UPROCS, MAXPAGES, NUM_DEVICES, sysno};
use umach::cpu::{ExceptionCode, ProcessorState, Status};
use umach::debug;

use self::vm::Pte;

/// The two exception slots of a support structure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExcSlot {
    /// TLB invalid / modified exceptions.
    PageFault = 0,
    /// Everything else: syscalls and program traps.
    General = 1,
}

/// The context a passed-up exception runs in: the handler is implied by the
/// slot; the status and reserved stack ride along.
#[derive(Clone, Copy, Debug, Default)]
pub struct HandlerContext {
    /// Status word the handler starts from.
    pub status: Status,
    /// Reserved kernel stack for the handler.
    pub stack_ptr: u32,
}

/// Index of a support structure in the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SupRef(usize);

#[cfg(test)]
impl SupRef {
    pub(crate) fn test(i: usize) -> Self {
        Self(i)
    }
}

/// One per-U-proc support structure.
pub struct SupportRec {
    /// Address space identifier, 1..=8.
    pub asid: u8,
    /// Saved exception state per slot.
    pub except_state: [ProcessorState; 2],
    /// Handler context per slot.
    pub contexts: [HandlerContext; 2],
    /// The private page table.
    pub page_table: [Pte; MAXPAGES],
    /// The private semaphore, initialized to zero.
    pub priv_sem: SemKey,
}

/// The support-structure free pool: a fixed arena with a stack of free
/// indices.
pub struct SupportPool {
    records: Vec<SupportRec>,
    free: Vec<SupRef>,
}

impl SupportPool {
    fn new(sems: &mut SemTable) -> Self {
        let records = (0..MAX_UPROCS)
            .map(|_| SupportRec {
                asid: 0,
                except_state: Default::default(),
                contexts: Default::default(),
                page_table: [Pte::default(); MAXPAGES],
                priv_sem: sems.alloc(0),
            })
            .collect();
        Self {
            records,
            free: (0..MAX_UPROCS).map(SupRef).collect(),
        }
    }

    /// Take a record off the free stack.
    pub fn alloc(&mut self) -> Option<SupRef> {
        self.free.pop()
    }

    /// Push a record back.
    pub fn dealloc(&mut self, sup: SupRef) {
        self.free.push(sup);
    }

    /// Borrow a record.
    #[inline]
    pub fn get(&self, sup: SupRef) -> &SupportRec {
        &self.records[sup.0]
    }

    /// Borrow a record mutably.
    #[inline]
    pub fn get_mut(&mut self, sup: SupRef) -> &mut SupportRec {
        &mut self.records[sup.0]
    }
}

/// Support-level globals, initialized by the instantiator.
pub struct SupportGlobals {
    /// The support-structure pool.
    pub pool: SupportPool,
    /// The swap pool.
    pub swap: vm::SwapPool,
    /// Mutual exclusion over the swap pool.
    pub swap_mutex: SemKey,
    /// One mutual-exclusion semaphore per peripheral (sub-)device.
    pub dev_mutex: [SemKey; NUM_DEVICES],
    /// Counts U-proc terminations for the instantiator.
    pub master_sem: SemKey,
    /// The page table of the shared region, common to every address space.
    pub global_pt: [Pte; KUSEGSHARE_PAGES],
    /// The delay facility.
    pub adl: delay::Adl,
    /// The shared-region semaphore list.
    pub alsl: alsl::Alsl,
}

impl SupportGlobals {
    /// Build the structures and register their semaphores; the instantiator
    /// sets the working values before launching U-procs.
    pub fn new(sems: &mut SemTable) -> Self {
        Self {
            pool: SupportPool::new(sems),
            swap: vm::SwapPool::new(),
            swap_mutex: sems.alloc(1),
            dev_mutex: std::array::from_fn(|_| sems.alloc(1)),
            master_sem: sems.alloc(0),
            global_pt: [Pte::default(); KUSEGSHARE_PAGES],
            adl: delay::Adl::new(sems),
            alsl: alsl::Alsl::new(sems),
        }
    }
}

/// Why a support-level service gave up on the calling U-proc. Every variant
/// is handled the same way — the U-proc is terminated — but the taxonomy
/// keeps validation sites honest.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trap {
    /// An address (or address range) outside the caller's logical space.
    BadAddress,
    /// A device number outside the class, uninstalled, or reserved.
    BadDevice,
    /// A flash block inside the backing-store region or past the device.
    BadBlock,
    /// A disk sector past the device capacity.
    BadSector,
    /// A fixed descriptor pool ran dry.
    PoolExhausted,
    /// A negative delay request.
    NegativeDelay,
    /// A shared-semaphore address outside the shared region.
    OutsideSharedRegion,
    /// A system call number nobody services.
    UnknownSyscall,
    /// A backing-store or DMA transfer failed.
    IoError,
}

/// Entry point of a passed-up exception on the owning process's context.
pub(crate) fn handle_passup(ctx: &mut KernelCtx<'_>, slot: ExcSlot) {
    match slot {
        ExcSlot::PageFault => vm::pager(ctx),
        ExcSlot::General => general_handler(ctx),
    }
}

/// The support-level general exception handler: route syscalls, terminate on
/// everything else.
fn general_handler(ctx: &mut KernelCtx<'_>) {
    let sup = ctx
        .current_support()
        .expect("pass-up reaches only supported processes");
    let code = ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize]
        .cause
        .exc_code();
    if code == ExceptionCode::Syscall as u32 {
        syscall_handler(ctx, sup);
    } else {
        terminate(ctx, sup);
    }
}

/// Dispatch system calls 9..=20. Each case stands alone; a service that
/// fails its validation reports a [`Trap`] and the U-proc dies.
fn syscall_handler(ctx: &mut KernelCtx<'_>, sup: SupRef) {
    let num = {
        let state = &mut ctx.sys_mut().support.pool.get_mut(sup).except_state[ExcSlot::General as usize];
        // Resume past the trap instruction, not back into it.
        let next = state.pc.wrapping_add(4);
        state.set_pc(next);
        state.a0()
    };

    let outcome = match num {
        sysno::TERMINATE => {
            terminate(ctx, sup);
            return;
        }
        sysno::GETTOD => sys_get_tod(ctx, sup),
        sysno::WRITEPRINTER => chario::sys_write_printer(ctx, sup),
        sysno::WRITETERMINAL => chario::sys_write_terminal(ctx, sup),
        sysno::READTERMINAL => chario::sys_read_terminal(ctx, sup),
        sysno::DISKWRITE => dma::sys_disk_write(ctx, sup),
        sysno::DISKREAD => dma::sys_disk_read(ctx, sup),
        sysno::FLASHWRITE => dma::sys_flash_write(ctx, sup),
        sysno::FLASHREAD => dma::sys_flash_read(ctx, sup),
        sysno::DELAY => delay::sys_delay(ctx, sup),
        sysno::PSEMLOGICAL => alsl::sys_p_logical(ctx, sup),
        sysno::VSEMLOGICAL => alsl::sys_v_logical(ctx, sup),
        _ => Err(Trap::UnknownSyscall),
    };

    if let Err(trap) = outcome {
        debug!("support: syscall {num} trapped: {trap:?}");
        terminate(ctx, sup);
    }
}

/// SYS10: the time of day in microseconds.
fn sys_get_tod(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let now = ctx.now();
    ctx.sys_mut().support.pool.get_mut(sup).except_state[ExcSlot::General as usize]
        .set_v0(now as u32);
    ctx.resume_from(sup, ExcSlot::General);
    Ok(())
}

/// Terminate the calling U-proc: free its swap frames under the pool mutex,
/// signal the master semaphore, return the support structure, and kill the
/// process subtree.
pub(crate) fn terminate(ctx: &mut KernelCtx<'_>, sup: SupRef) {
    let swap_mutex = ctx.sys_ref().support.swap_mutex;
    ctx.passeren(swap_mutex);
    let asid = ctx.sys_ref().support.pool.get(sup).asid;
    ctx.sys_mut().support.swap.release_asid(asid);
    ctx.verhogen(swap_mutex);

    let master = ctx.sys_ref().support.master_sem;
    ctx.verhogen(master);

    ctx.sys_mut().support.pool.dealloc(sup);
    ctx.terminate_self();
}
