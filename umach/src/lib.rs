//! An emulated single-CPU MIPS-class machine.
//!
//! The machine a kernel wants to be taught on: a software-managed TLB, flat
//! RAM in frames, a time-of-day clock, a processor-local timer, a system-wide
//! interval timer, and five classes of peripheral devices (disk, flash,
//! network, printer, terminal) driven through STATUS/COMMAND/DATA register
//! protocols that complete asynchronously and interrupt until acknowledged.
//!
//! User-mode programs are real code: a minimal instruction set
//! ([`isa`]) fetched, loaded and stored through the TLB out of paged memory,
//! so address translation, refills and page faults behave like the hardware
//! they model. Kernel code is not interpreted; the kernel sits above this
//! crate, receives typed [`machine::Event`]s, and owns all policy.
//!
//! Everything is deterministic. The TOD clock advances one microsecond per
//! interpreted instruction and jumps across idle time on WAIT; device
//! latencies are fixed; the TLB replacement wheel is a wheel, not a die.
//! Identical configurations replay identical runs, which is what makes an
//! operating system testable as an ordinary Rust crate.

pub mod addressing;
pub mod aout;
pub mod clock;
pub mod cpu;
pub mod dev;
pub mod isa;
pub mod kprint;
pub mod mem;
pub mod tlb;

mod machine;

pub use machine::{Event, Machine, MachineBuilder};
