//! The instantiator: the first process.
//!
//! Runs in kernel mode and stands the support level up: the swap pool and its
//! mutex, one mutual-exclusion semaphore per device, the support-structure
//! pool, the backing store (each U-proc's boot image copied from its flash
//! device to disk 0), the global page table of the shared region, the
//! shared-semaphore list, and the delay facility with its daemon. It then
//! launches the U-procs and waits on the master semaphore for each of them to
//! terminate before terminating itself — which, the daemon dying with it,
//! drops the process count to zero and halts the system.

use crate::kcontext::KernelCtx;
use crate::support::{ExcSlot, HandlerContext, SupRef, Trap, delay, dma, vm};
use crate::{KUSEGSHARE_PAGES, MAX_UPROCS, MAXPAGES, STACK_PAGE, UPROC_SP, VPN_STACK, VPN_TEXT_BASE, VPN_KUSEGSHARE_BASE};
use umach::addressing::PAGE_SIZE;
use umach::cpu::{ProcessorState, Status, reg};
use umach::dev::STATUS_READY;
use umach::tlb::{EntryHi, EntryLo, EntryLoFlags};
use umach::{aout, info};

/// The standard workload: every U-proc.
pub fn instantiator(ctx: &mut KernelCtx<'_>) {
    instantiate(ctx, MAX_UPROCS as u8);
}

/// Stand the support level up and run U-procs 1..=`nprocs`.
pub fn instantiate(ctx: &mut KernelCtx<'_>, nprocs: u8) {
    debug_assert!(nprocs as usize <= MAX_UPROCS);

    // Swap pool mutex and per-device mutexes carry one unit of capacity.
    {
        let sys = ctx.sys_mut();
        let swap_mutex = sys.support.swap_mutex;
        sys.nucleus.sems.set(swap_mutex, 1);
        for i in 0..sys.support.dev_mutex.len() {
            let key = sys.support.dev_mutex[i];
            sys.nucleus.sems.set(key, 1);
        }
    }

    if populate_backing_store(ctx, nprocs).is_err() {
        return ctx.terminate_self();
    }

    init_global_page_table(ctx.sys_mut());

    {
        let sys = ctx.sys_mut();
        let alsl_mutex = sys.support.alsl.mutex;
        sys.nucleus.sems.set(alsl_mutex, 1);
        let adl_mutex = sys.support.adl.mutex;
        sys.nucleus.sems.set(adl_mutex, 1);
        let master = sys.support.master_sem;
        sys.nucleus.sems.set(master, 0);
    }

    if !delay::start_daemon(ctx) {
        return ctx.terminate_self();
    }

    info!("instantiator: launching {nprocs} U-procs");
    for asid in 1..=nprocs {
        let Some(sup) = ctx.sys_mut().support.pool.alloc() else {
            return ctx.terminate_self();
        };
        init_support_structure(ctx, sup, asid);
        let state = uproc_state(asid);
        if ctx.create_process(state, Some(sup), None).is_none() {
            return ctx.terminate_self();
        }
    }

    // Wait for every U-proc to come back through the master semaphore.
    let master = ctx.sys_ref().support.master_sem;
    for _ in 0..nprocs {
        ctx.passeren(master);
    }
    info!("instantiator: all U-procs done");
    ctx.terminate_self();
}

/// Copy each U-proc's boot image from its flash device to the backing store:
/// the header names the initialized text and data sizes, and only those
/// pages travel.
fn populate_backing_store(ctx: &mut KernelCtx<'_>, nprocs: u8) -> Result<(), Trap> {
    for flashno in 0..nprocs as usize {
        let buffer = dma::flash_dma_buffer(flashno);
        if dma::flash_operation(ctx, flashno, 0, buffer, false) != STATUS_READY {
            return Err(Trap::IoError);
        }

        let (text, data) = {
            let ram = &ctx.sys_ref().machine.ram;
            let text = ram
                .read_word(buffer + aout::TEXT_SIZE_OFFSET as u32)
                .ok_or(Trap::IoError)?;
            let data = ram
                .read_word(buffer + aout::DATA_SIZE_OFFSET as u32)
                .ok_or(Trap::IoError)?;
            (text, data)
        };
        let pages = (text + data) / PAGE_SIZE;

        for block in 0..pages {
            if dma::flash_operation(ctx, flashno, block, buffer, false) != STATUS_READY {
                return Err(Trap::IoError);
            }
            let sector = flashno as u32 * MAXPAGES as u32 + block;
            if dma::disk_operation(ctx, crate::BACKING_DISK, sector, buffer, true)
                != STATUS_READY
            {
                return Err(Trap::IoError);
            }
        }
    }
    Ok(())
}

/// The shared region's page table: ASID 0, global, writable, nothing
/// resident yet.
fn init_global_page_table(sys: &mut crate::initial::System) {
    for i in 0..KUSEGSHARE_PAGES {
        sys.support.global_pt[i] = vm::Pte {
            hi: EntryHi::new(VPN_KUSEGSHARE_BASE + i as u32, 0),
            lo: EntryLo::flags_only(EntryLoFlags::DIRTY | EntryLoFlags::GLOBAL),
        };
    }
}

/// Fill in a freshly allocated support structure: ASID, exception contexts
/// on their reserved stacks, and the private page table (31 text/data pages
/// plus the stack page, all writable, none resident).
fn init_support_structure(ctx: &mut KernelCtx<'_>, sup: SupRef, asid: u8) {
    let ram_top = ctx.sys_ref().machine.ram.top();
    let sys = ctx.sys_mut();
    let rec = sys.support.pool.get_mut(sup);
    rec.asid = asid;

    // Two stacks per U-proc below RAMTOP; the frame directly under RAMTOP
    // stays with the instantiator.
    let stack_base = ram_top - asid as u32 * 2 * PAGE_SIZE;
    let handler_status = Status::IEP | Status::IM_ALL | Status::TE;
    rec.contexts[ExcSlot::PageFault as usize] = HandlerContext {
        status: handler_status,
        stack_ptr: stack_base.into_u32(),
    };
    rec.contexts[ExcSlot::General as usize] = HandlerContext {
        status: handler_status,
        stack_ptr: (stack_base - PAGE_SIZE).into_u32(),
    };

    for i in 0..STACK_PAGE {
        rec.page_table[i] = vm::Pte {
            hi: EntryHi::new(VPN_TEXT_BASE + i as u32, asid),
            lo: EntryLo::flags_only(EntryLoFlags::DIRTY),
        };
    }
    rec.page_table[STACK_PAGE] = vm::Pte {
        hi: EntryHi::new(VPN_STACK, asid),
        lo: EntryLo::flags_only(EntryLoFlags::DIRTY),
    };
}

/// The initial processor state of a U-proc: user mode, interrupts and local
/// timer on, entry point and stack top of the standard layout.
fn uproc_state(asid: u8) -> ProcessorState {
    let mut state = ProcessorState::new();
    state.set_pc(aout::ENTRY_VA);
    state.gpr[reg::SP] = UPROC_SP;
    state.status = Status::KUP | Status::IEP | Status::IM_ALL | Status::TE;
    state.entry_hi = EntryHi::new(0, asid);
    state
}
