//! The pager and the swap pool.
//!
//! Sixteen RAM frames back every virtual page of every U-proc plus the
//! shared region. A page fault picks a frame — the first unoccupied one,
//! else round-robin — evicts the previous tenant to the backing disk, reads
//! the faulted page in, and republishes page-table entry and TLB slot
//! together. The two mutation windows run with interrupt delivery off: the
//! victim's entry must be invalid everywhere *before* its frame is reused,
//! and the new entry must appear *after* the frame holds real bytes, or some
//! other observer maps garbage.
//!
//! The whole affair is serialized by the swap-pool mutex, held across at
//! most two backing-store transfers. A transfer failure releases the mutex
//! first and then takes the faulting U-proc down — a wedged swap pool would
//! take everyone else with it.

use crate::kcontext::KernelCtx;
use crate::support::{ExcSlot, SupRef, Trap, dma, terminate};
use crate::{
    BACKING_DISK, KUSEG_BASE_SECTOR, KUSEGSHARE_PAGES, MAXPAGES, STACK_PAGE, SWAP_POOL_FRAME,
    SWAP_POOL_SIZE, VPN_KUSEGSHARE_BASE, VPN_STACK, VPN_TEXT_BASE,
};
use umach::addressing::{PAGE_SIZE, Pa, RAM_BASE, Va};
use umach::cpu::ExceptionCode;
use umach::tlb::{EntryHi, EntryLo, EntryLoFlags, TlbEntry};

/// One page-table entry: the hardware pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Pte {
    /// Page and address space.
    pub hi: EntryHi,
    /// Frame and flags.
    pub lo: EntryLo,
}

/// Which page table a page belongs to, and where.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageIx {
    /// Slot in the owner's private page table.
    Private(usize),
    /// Slot in the global shared page table.
    Shared(usize),
}

/// Classify a VPN into its page-table slot.
pub fn page_index(vpn: u32) -> Option<PageIx> {
    if vpn == VPN_STACK {
        Some(PageIx::Private(STACK_PAGE))
    } else if (VPN_TEXT_BASE..VPN_TEXT_BASE + (MAXPAGES as u32 - 1)).contains(&vpn) {
        Some(PageIx::Private((vpn - VPN_TEXT_BASE) as usize))
    } else if (VPN_KUSEGSHARE_BASE..VPN_KUSEGSHARE_BASE + KUSEGSHARE_PAGES as u32).contains(&vpn)
    {
        Some(PageIx::Shared((vpn - VPN_KUSEGSHARE_BASE) as usize))
    } else {
        None
    }
}

/// A page-table slot, addressable from the swap pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PteOwner {
    /// In a U-proc's private table.
    Private {
        /// The owning support structure.
        sup: SupRef,
        /// Slot index.
        index: usize,
    },
    /// In the global shared table.
    Shared {
        /// Slot index.
        index: usize,
    },
}

/// One swap-pool frame's bookkeeping.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwapEntry {
    /// Owning ASID; `None` when unoccupied. The shared region owns frames as
    /// ASID 0.
    pub asid: Option<u8>,
    /// Owning virtual page number.
    pub vpn: u32,
    /// The page-table slot mapping this frame.
    pub pte: Option<PteOwner>,
}

/// The swap pool: frame bookkeeping plus the FIFO replacement wheel.
pub struct SwapPool {
    entries: [SwapEntry; SWAP_POOL_SIZE],
    wheel: usize,
}

impl Default for SwapPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            entries: [SwapEntry::default(); SWAP_POOL_SIZE],
            wheel: 0,
        }
    }

    /// The bookkeeping of frame `i`.
    pub fn entry(&self, i: usize) -> &SwapEntry {
        &self.entries[i]
    }

    /// Record a tenancy.
    pub fn occupy(&mut self, i: usize, asid: u8, vpn: u32, pte: PteOwner) {
        self.entries[i] = SwapEntry { asid: Some(asid), vpn, pte: Some(pte) };
    }

    /// Victim selection: the first unoccupied frame, else the next slot on
    /// the round-robin wheel.
    pub fn pick_frame(&mut self) -> usize {
        if let Some(i) = self.entries.iter().position(|e| e.asid.is_none()) {
            return i;
        }
        let i = self.wheel;
        self.wheel = (self.wheel + 1) % SWAP_POOL_SIZE;
        i
    }

    /// Physical address of swap frame `i`.
    pub fn frame_pa(i: usize) -> Pa {
        Pa::new(RAM_BASE + (SWAP_POOL_FRAME + i as u32) * PAGE_SIZE)
    }

    /// Drop every frame owned by `asid` (on U-proc termination).
    pub fn release_asid(&mut self, asid: u8) {
        for e in self.entries.iter_mut() {
            if e.asid == Some(asid) {
                *e = SwapEntry::default();
            }
        }
    }
}

fn owner_for(sup: SupRef, ix: PageIx) -> PteOwner {
    match ix {
        PageIx::Private(index) => PteOwner::Private { sup, index },
        PageIx::Shared(index) => PteOwner::Shared { index },
    }
}

fn pte_get(sys: &crate::initial::System, owner: PteOwner) -> Pte {
    match owner {
        PteOwner::Private { sup, index } => sys.support.pool.get(sup).page_table[index],
        PteOwner::Shared { index } => sys.support.global_pt[index],
    }
}

fn pte_set(sys: &mut crate::initial::System, owner: PteOwner, pte: Pte) {
    match owner {
        PteOwner::Private { sup, index } => {
            sys.support.pool.get_mut(sup).page_table[index] = pte
        }
        PteOwner::Shared { index } => sys.support.global_pt[index] = pte,
    }
}

/// Backing-store sector of the page mapped by `owner`.
fn sector_for(sys: &crate::initial::System, owner: PteOwner) -> u32 {
    match owner {
        PteOwner::Private { sup, index } => {
            let asid = sys.support.pool.get(sup).asid as u32;
            (asid - 1) * MAXPAGES as u32 + index as u32
        }
        PteOwner::Shared { index } => KUSEG_BASE_SECTOR + index as u32,
    }
}

/// The page-table entry the TLB-refill handler wants for `vpn`, valid or
/// not.
pub(crate) fn lookup_pte(
    sys: &crate::initial::System,
    sup: SupRef,
    vpn: u32,
) -> Option<Pte> {
    Some(match page_index(vpn)? {
        PageIx::Private(i) => sys.support.pool.get(sup).page_table[i],
        PageIx::Shared(i) => sys.support.global_pt[i],
    })
}

/// The passed-up page-fault handler.
pub(crate) fn pager(ctx: &mut KernelCtx<'_>) {
    let sup = ctx
        .current_support()
        .expect("pass-up reaches only supported processes");
    let (code, hi) = {
        let state = &ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::PageFault as usize];
        (state.cause.exc_code(), state.entry_hi)
    };
    // A write through a clean entry never happens here — every page is
    // mapped dirty — so a modification exception is a program trap.
    if code == ExceptionCode::TlbMod as u32 {
        return terminate(ctx, sup);
    }
    match pager_core(ctx, sup, hi.vpn()) {
        Ok(()) => ctx.resume_from(sup, ExcSlot::PageFault),
        Err(_) => terminate(ctx, sup),
    }
}

/// Bring the page at `vpn` in for the U-proc behind `sup`. On success the
/// page-table entry is valid and the TLB agrees.
pub(crate) fn pager_core(ctx: &mut KernelCtx<'_>, sup: SupRef, vpn: u32) -> Result<(), Trap> {
    let swap_mutex = ctx.sys_ref().support.swap_mutex;
    ctx.passeren(swap_mutex);

    let Some(ix) = page_index(vpn) else {
        ctx.verhogen(swap_mutex);
        return Err(Trap::BadAddress);
    };
    let owner = owner_for(sup, ix);
    let shared = matches!(ix, PageIx::Shared(_));

    // A shared page may have been brought in by another U-proc while this
    // one waited for the mutex.
    if shared && pte_get(ctx.sys_ref(), owner).lo.valid() {
        ctx.verhogen(swap_mutex);
        return Ok(());
    }

    let frame = ctx.sys_mut().support.swap.pick_frame();
    let frame_pa = SwapPool::frame_pa(frame);

    // Evict the previous tenant: kill its mapping everywhere, then save its
    // bytes.
    let victim = *ctx.sys_ref().support.swap.entry(frame);
    if let Some(victim_owner) = victim.pte {
        ctx.masked(|ctx| {
            let sys = ctx.sys_mut();
            let mut pte = pte_get(sys, victim_owner);
            pte.lo.invalidate();
            pte_set(sys, victim_owner, pte);
            if let Some(slot) = sys.machine.tlb.probe(pte.hi) {
                sys.machine.tlb.write_index(slot, TlbEntry { hi: pte.hi, lo: pte.lo });
            }
        });
        let sector = sector_for(ctx.sys_ref(), victim_owner);
        let status = dma::disk_operation(ctx, BACKING_DISK, sector, frame_pa, true);
        if status != umach::dev::STATUS_READY {
            ctx.verhogen(swap_mutex);
            return Err(Trap::IoError);
        }
    }

    // Read the faulted page into the frame.
    let sector = sector_for(ctx.sys_ref(), owner);
    let status = dma::disk_operation(ctx, BACKING_DISK, sector, frame_pa, false);
    if status != umach::dev::STATUS_READY {
        ctx.verhogen(swap_mutex);
        return Err(Trap::IoError);
    }

    // Record the tenancy, then publish entry and TLB slot as one step.
    let asid = if shared { 0 } else { ctx.sys_ref().support.pool.get(sup).asid };
    ctx.sys_mut().support.swap.occupy(frame, asid, vpn, owner);
    ctx.masked(|ctx| {
        let sys = ctx.sys_mut();
        let mut pte = pte_get(sys, owner);
        let mut flags = EntryLoFlags::DIRTY | EntryLoFlags::VALID;
        if shared {
            flags |= EntryLoFlags::GLOBAL;
        }
        pte.lo.map(frame_pa.pfn(), flags);
        pte_set(sys, owner, pte);
        let entry = TlbEntry { hi: pte.hi, lo: pte.lo };
        match sys.machine.tlb.probe(pte.hi) {
            Some(slot) => sys.machine.tlb.write_index(slot, entry),
            None => {
                sys.machine.tlb.write_random(entry);
            }
        }
    });

    ctx.verhogen(swap_mutex);
    Ok(())
}

/// Translate a user virtual address for a kernel-side access, faulting the
/// page in if needed. The returned frame stays meaningful only until the
/// next blocking service.
pub(crate) fn ensure_resident(
    ctx: &mut KernelCtx<'_>,
    va: Va,
    _store: bool,
) -> Result<Pa, Trap> {
    if !va.in_kuseg() {
        return Err(Trap::BadAddress);
    }
    let sup = ctx.current_support().ok_or(Trap::BadAddress)?;
    let vpn = va.vpn();
    let ix = page_index(vpn).ok_or(Trap::BadAddress)?;
    let owner = owner_for(sup, ix);
    if !pte_get(ctx.sys_ref(), owner).lo.valid() {
        pager_core(ctx, sup, vpn)?;
    }
    let pte = pte_get(ctx.sys_ref(), owner);
    Ok(Pa::from_pfn(pte.lo.pfn()) + va.offset())
}

/// Read one byte of user memory.
pub(crate) fn read_user_byte(ctx: &mut KernelCtx<'_>, va: Va) -> Result<u8, Trap> {
    let pa = ensure_resident(ctx, va, false)?;
    ctx.sys_ref().machine.ram.read_byte(pa).ok_or(Trap::BadAddress)
}

/// Write one byte of user memory.
pub(crate) fn write_user_byte(ctx: &mut KernelCtx<'_>, va: Va, value: u8) -> Result<(), Trap> {
    let pa = ensure_resident(ctx, va, true)?;
    ctx.sys_mut().machine.ram.write_byte(pa, value).ok_or(Trap::BadAddress)
}

/// Add `delta` to the aligned word of user memory at `va` and return the new
/// value. The page is pinned once; nothing can run between the load and the
/// store, so concurrent adjustments of the same cell serialize cleanly.
pub(crate) fn rmw_user_word(ctx: &mut KernelCtx<'_>, va: Va, delta: i32) -> Result<i32, Trap> {
    if !va.aligned() {
        return Err(Trap::BadAddress);
    }
    let pa = ensure_resident(ctx, va, true)?;
    let sys = ctx.sys_mut();
    let value = sys.machine.ram.read_word(pa).ok_or(Trap::BadAddress)? as i32 + delta;
    sys.machine
        .ram
        .write_word(pa, value as u32)
        .ok_or(Trap::BadAddress)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_classification() {
        assert_eq!(page_index(VPN_TEXT_BASE), Some(PageIx::Private(0)));
        assert_eq!(page_index(VPN_TEXT_BASE + 30), Some(PageIx::Private(30)));
        assert_eq!(page_index(VPN_TEXT_BASE + 31), None, "page 31 is the stack VPN only");
        assert_eq!(page_index(VPN_STACK), Some(PageIx::Private(STACK_PAGE)));
        assert_eq!(page_index(VPN_KUSEGSHARE_BASE), Some(PageIx::Shared(0)));
        assert_eq!(
            page_index(VPN_KUSEGSHARE_BASE + 31),
            Some(PageIx::Shared(31))
        );
        assert_eq!(page_index(VPN_KUSEGSHARE_BASE + 32), None);
        assert_eq!(page_index(0x7FFFF), None);
    }

    #[test]
    fn victim_selection_prefers_free_frames_then_wheels() {
        let mut pool = SwapPool::new();
        assert_eq!(pool.pick_frame(), 0);
        pool.occupy(0, 1, VPN_TEXT_BASE, PteOwner::Shared { index: 0 });
        assert_eq!(pool.pick_frame(), 1, "first unoccupied wins");

        for i in 1..SWAP_POOL_SIZE {
            pool.occupy(i, 1, VPN_TEXT_BASE + i as u32, PteOwner::Shared { index: i });
        }
        // Full: FIFO wheel from the start.
        assert_eq!(pool.pick_frame(), 0);
        assert_eq!(pool.pick_frame(), 1);
    }

    #[test]
    fn release_asid_only_touches_its_frames() {
        let mut pool = SwapPool::new();
        pool.occupy(0, 1, VPN_TEXT_BASE, PteOwner::Shared { index: 0 });
        pool.occupy(1, 2, VPN_TEXT_BASE, PteOwner::Shared { index: 1 });
        pool.occupy(2, 0, VPN_KUSEGSHARE_BASE, PteOwner::Shared { index: 2 });
        pool.release_asid(1);
        assert!(pool.entry(0).asid.is_none());
        assert_eq!(pool.entry(1).asid, Some(2));
        assert_eq!(pool.entry(2).asid, Some(0), "shared frames outlive U-procs");
    }
}
