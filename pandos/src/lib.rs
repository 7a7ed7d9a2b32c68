//! # Pandos: a small multiprogramming kernel
//!
//! A kernel for the emulated MIPS-class machine provided by [`umach`]. It
//! schedules up to eight user processes sharing a fixed address-space layout,
//! demand-pages their 32-page address spaces from a backing-store disk,
//! brokers synchronous I/O to character and block devices, and offers a
//! semaphore-based concurrency primitive to both the nucleus and the support
//! layer.
//!
//! The crate is layered leaves-first:
//!
//! 1. **Data structures** — a fixed pool of process control blocks with
//!    circular tail-pointed queues and a process tree ([`pcb`]), and the
//!    sorted Active Semaphore List over the kernel semaphore table ([`asl`]).
//! 2. **Nucleus** — round-robin scheduling with a 5 ms quantum
//!    ([`scheduler`]), the unified exception dispatcher and system calls 1–8
//!    ([`exceptions`]), and the interrupt handler ([`interrupts`]), all glued
//!    together by the boot path and machine loop in [`initial`].
//! 3. **Support layer** — per-U-proc support records and the support-level
//!    syscall dispatcher ([`support`]), the pager and swap pool
//!    ([`support::vm`]), DMA and character device services
//!    ([`support::dma`], [`support::chario`]), the delay facility
//!    ([`support::delay`]), shared-region semaphores ([`support::alsl`]),
//!    and the instantiator ([`support::init`]).
//!
//! Kernel-native process bodies (the instantiator, the delay daemon, the
//! support handlers) run on per-process kernel execution contexts
//! ([`kcontext`]): host threads that exchange ownership of the whole system
//! with the machine loop, so a support routine can block halfway through a
//! function exactly the way the design demands.
//!
//! Start a system with [`initial::boot_and_run`].

pub mod asl;
pub mod exceptions;
pub mod initial;
pub mod interrupts;
pub mod kcontext;
pub mod pcb;
pub mod scheduler;
pub mod support;

/// Maximum number of concurrent processes.
pub const MAXPROC: usize = 20;

/// Time slice of a dispatched process, in microseconds.
pub const QUANTUM: u64 = 5_000;

/// Period of the system-wide interval timer (the pseudo-clock tick), in
/// microseconds.
pub const PSEUDO_CLOCK_PERIOD: u64 = 100_000;

/// Peripheral (sub-)devices with a nucleus semaphore: four classes of eight,
/// plus eight terminal devices counted twice (transmitter and receiver).
pub const NUM_DEVICES: usize = 48;

/// Maximum number of concurrent user processes.
pub const MAX_UPROCS: usize = 8;

/// Pages in a U-proc's private address space.
pub const MAXPAGES: usize = 32;

/// Private page-table slot of the stack page.
pub const STACK_PAGE: usize = MAXPAGES - 1;

/// Pages in the shared logical address region.
pub const KUSEGSHARE_PAGES: usize = 32;

/// Base VPN of a U-proc's text and data pages.
pub const VPN_TEXT_BASE: u32 = 0x80000;

/// VPN of the stack page.
pub const VPN_STACK: u32 = 0xBFFFF;

/// Base VPN of the shared region.
pub const VPN_KUSEGSHARE_BASE: u32 = 0xC0000;

/// Initial stack pointer of every U-proc.
pub const UPROC_SP: u32 = 0xC000_0000;

/// The backing-store disk.
pub const BACKING_DISK: usize = 0;

/// First backing-store sector of the shared pages.
pub const KUSEG_BASE_SECTOR: u32 = (MAX_UPROCS * MAXPAGES) as u32;

/// Frames in the swap pool.
pub const SWAP_POOL_SIZE: usize = 2 * MAX_UPROCS;

/// RAM frame index of the first disk DMA buffer.
pub const DISK_DMA_FRAME: u32 = 32;

/// RAM frame index of the first flash DMA buffer.
pub const FLASH_DMA_FRAME: u32 = DISK_DMA_FRAME + 8;

/// RAM frame index of the first swap-pool frame.
pub const SWAP_POOL_FRAME: u32 = FLASH_DMA_FRAME + 8;

/// Longest string SYS11 accepts.
pub const PRINTER_MAXLEN: u32 = 128;

/// Longest string SYS12 accepts.
pub const TERMINAL_MAXLEN: u32 = 128;

/// Microseconds per second.
pub const SECOND: u64 = 1_000_000;

/// System call numbers.
pub mod sysno {
    /// Create a process (nucleus).
    pub const CREATEPROCESS: u32 = 1;
    /// Terminate the calling process and its subtree (nucleus).
    pub const TERMINATEPROCESS: u32 = 2;
    /// P a kernel semaphore (nucleus).
    pub const PASSEREN: u32 = 3;
    /// V a kernel semaphore (nucleus).
    pub const VERHOGEN: u32 = 4;
    /// Block until a device completes (nucleus).
    pub const WAITIO: u32 = 5;
    /// Accumulated CPU time (nucleus).
    pub const GETCPUTIME: u32 = 6;
    /// Block until the next pseudo-clock tick (nucleus).
    pub const WAITCLOCK: u32 = 7;
    /// The caller's support structure (nucleus).
    pub const GETSUPPORTPTR: u32 = 8;
    /// Terminate the calling U-proc.
    pub const TERMINATE: u32 = 9;
    /// Time of day.
    pub const GETTOD: u32 = 10;
    /// Write a string to the caller's printer.
    pub const WRITEPRINTER: u32 = 11;
    /// Write a string to the caller's terminal.
    pub const WRITETERMINAL: u32 = 12;
    /// Read a line from the caller's terminal.
    pub const READTERMINAL: u32 = 13;
    /// Write one page to a disk sector.
    pub const DISKWRITE: u32 = 14;
    /// Read one page from a disk sector.
    pub const DISKREAD: u32 = 15;
    /// Write one page to a flash block.
    pub const FLASHWRITE: u32 = 16;
    /// Read one page from a flash block.
    pub const FLASHREAD: u32 = 17;
    /// Sleep for a number of seconds.
    pub const DELAY: u32 = 18;
    /// P a semaphore in the shared region.
    pub const PSEMLOGICAL: u32 = 19;
    /// V a semaphore in the shared region.
    pub const VSEMLOGICAL: u32 = 20;
}
