//! Processor state: the status word, the cause register, and the register
//! file a process carries across exceptions.
//!
//! The status word keeps a three-deep stack of (interrupt-enable, kernel/user)
//! pairs. Taking an exception pushes the stack with the *current* pair cleared
//! — the handler starts in kernel mode with interrupts masked — and loading a
//! saved state pops it. A state built for a first dispatch therefore sets the
//! *previous* bits for the mode it wants, never the current ones.

use crate::tlb::EntryHi;

bitflags::bitflags! {
    /// The processor status word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Status: u32 {
        /// Current global interrupt enable.
        const IEC = 1 << 0;
        /// Current kernel/user mode (0 = kernel, 1 = user).
        const KUC = 1 << 1;
        /// Previous interrupt enable.
        const IEP = 1 << 2;
        /// Previous kernel/user mode.
        const KUP = 1 << 3;
        /// Old interrupt enable.
        const IEO = 1 << 4;
        /// Old kernel/user mode.
        const KUO = 1 << 5;
        /// Per-line interrupt mask, lines 0 through 7.
        const IM_ALL = 0xFF00;
        /// Processor local timer enable.
        const TE = 1 << 27;
    }
}

impl Status {
    /// The interrupt-mask bit for a single interrupt line.
    #[inline]
    pub fn im(line: u32) -> Status {
        Status::from_bits_retain(1 << (8 + line))
    }

    /// Whether interrupts are currently accepted.
    #[inline]
    pub fn interrupts_on(self) -> bool {
        self.contains(Status::IEC)
    }

    /// Whether the processor currently runs in user mode.
    #[inline]
    pub fn user_mode(self) -> bool {
        self.contains(Status::KUC)
    }

    /// Push the KU/IE stack on exception entry: old ← previous, previous ←
    /// current, current ← (kernel, masked).
    pub fn push(&mut self) {
        let mut next = *self;
        next.set(Status::IEO, self.contains(Status::IEP));
        next.set(Status::KUO, self.contains(Status::KUP));
        next.set(Status::IEP, self.contains(Status::IEC));
        next.set(Status::KUP, self.contains(Status::KUC));
        next.remove(Status::IEC | Status::KUC);
        *self = next;
    }

    /// Pop the KU/IE stack when a saved state is loaded: current ← previous,
    /// previous ← old.
    pub fn pop(&mut self) {
        let mut next = *self;
        next.set(Status::IEC, self.contains(Status::IEP));
        next.set(Status::KUC, self.contains(Status::KUP));
        next.set(Status::IEP, self.contains(Status::IEO));
        next.set(Status::KUP, self.contains(Status::KUO));
        *self = next;
    }
}

/// Exception codes reported in the cause register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ExceptionCode {
    /// Device or timer interrupt.
    Interrupt = 0,
    /// Write to a TLB entry with the dirty bit off.
    TlbMod = 1,
    /// TLB invalid on a load or fetch.
    TlbLoadInvalid = 2,
    /// TLB invalid on a store.
    TlbStoreInvalid = 3,
    /// Address error on a load or fetch.
    AddressLoad = 4,
    /// Address error on a store.
    AddressStore = 5,
    /// Bus error on a fetch.
    BusFetch = 6,
    /// Bus error on a load or store.
    BusData = 7,
    /// SYSCALL instruction.
    Syscall = 8,
    /// Breakpoint.
    Breakpoint = 9,
    /// Reserved instruction.
    ReservedInstruction = 10,
    /// Coprocessor unusable.
    CoprocessorUnusable = 11,
    /// Arithmetic overflow.
    Overflow = 12,
}

impl ExceptionCode {
    /// Decode an exception code field; codes above 12 do not exist on this
    /// machine.
    pub fn from_bits(bits: u32) -> Option<Self> {
        use ExceptionCode::*;
        Some(match bits {
            0 => Interrupt,
            1 => TlbMod,
            2 => TlbLoadInvalid,
            3 => TlbStoreInvalid,
            4 => AddressLoad,
            5 => AddressStore,
            6 => BusFetch,
            7 => BusData,
            8 => Syscall,
            9 => Breakpoint,
            10 => ReservedInstruction,
            11 => CoprocessorUnusable,
            12 => Overflow,
            _ => return None,
        })
    }
}

/// The cause register: an exception code in bits 2..=6 and the pending
/// interrupt bitmap in bits 8..=15.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Cause(u32);

impl Cause {
    const EXC_SHIFT: u32 = 2;
    const EXC_MASK: u32 = 0x7C;
    const IP_MASK: u32 = 0xFF00;

    /// Extract the exception code field.
    #[inline]
    pub fn exc_code(self) -> u32 {
        (self.0 & Self::EXC_MASK) >> Self::EXC_SHIFT
    }

    /// Overwrite the exception code field, leaving the rest untouched.
    #[inline]
    pub fn set_exc_code(&mut self, code: ExceptionCode) {
        self.0 = (self.0 & !Self::EXC_MASK) | ((code as u32) << Self::EXC_SHIFT);
    }

    /// The pending-interrupt bits, one per line, already shifted into their
    /// architectural position (bits 8..=15).
    #[inline]
    pub fn ip(self) -> u32 {
        self.0 & Self::IP_MASK
    }

    /// Record the pending-interrupt lines (a bitmap with bit `n` = line `n`).
    #[inline]
    pub fn set_ip(&mut self, lines: u32) {
        self.0 = (self.0 & !Self::IP_MASK) | ((lines << 8) & Self::IP_MASK);
    }

    /// Raw register value.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Register-file indices of the registers the kernel cares about by name.
pub mod reg {
    /// The hardwired zero register.
    pub const ZERO: usize = 0;
    /// Result register.
    pub const V0: usize = 2;
    /// First argument register (syscall number).
    pub const A0: usize = 4;
    /// Second argument register.
    pub const A1: usize = 5;
    /// Third argument register.
    pub const A2: usize = 6;
    /// Fourth argument register.
    pub const A3: usize = 7;
    /// Jump base register, kept equal to the PC on every PC assignment.
    pub const T9: usize = 25;
    /// Stack pointer.
    pub const SP: usize = 29;
    /// Return address.
    pub const RA: usize = 31;
}

/// A complete saved processor state: what the hardware deposits on an
/// exception and what a dispatch loads back.
#[derive(Clone, Debug, Default)]
pub struct ProcessorState {
    /// Current VPN/ASID pair.
    pub entry_hi: EntryHi,
    /// Cause of the last exception.
    pub cause: Cause,
    /// Status word.
    pub status: Status,
    /// Program counter.
    pub pc: u32,
    /// General registers; index 0 is hardwired to zero.
    pub gpr: [u32; 32],
}

impl ProcessorState {
    /// A zeroed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a general register.
    #[inline]
    pub fn reg(&self, r: usize) -> u32 {
        if r == 0 { 0 } else { self.gpr[r] }
    }

    /// Write a general register; writes to register 0 are discarded.
    #[inline]
    pub fn set_reg(&mut self, r: usize, v: u32) {
        if r != 0 {
            self.gpr[r] = v;
        }
    }

    /// Assign the program counter (and t9 alongside, as the ABI requires).
    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
        self.gpr[reg::T9] = pc;
    }

    /// Syscall number / first argument.
    #[inline]
    pub fn a0(&self) -> u32 {
        self.gpr[reg::A0]
    }
    /// Second argument.
    #[inline]
    pub fn a1(&self) -> u32 {
        self.gpr[reg::A1]
    }
    /// Third argument.
    #[inline]
    pub fn a2(&self) -> u32 {
        self.gpr[reg::A2]
    }
    /// Fourth argument.
    #[inline]
    pub fn a3(&self) -> u32 {
        self.gpr[reg::A3]
    }
    /// Result register.
    #[inline]
    pub fn v0(&self) -> u32 {
        self.gpr[reg::V0]
    }
    /// Store a syscall result.
    #[inline]
    pub fn set_v0(&mut self, v: u32) {
        self.gpr[reg::V0] = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_stack_push_pop() {
        let mut st = Status::IEP | Status::KUP | Status::TE;
        st.push();
        assert!(!st.interrupts_on());
        assert!(!st.user_mode());
        assert!(st.contains(Status::IEO) && st.contains(Status::KUO));
        st.pop();
        assert!(st.interrupts_on());
        assert!(st.user_mode());
    }

    #[test]
    fn pop_activates_previous_bits() {
        // A freshly built dispatch state: previous bits select user mode with
        // interrupts on; the load pops them into the current position.
        let mut st = Status::IEP | Status::KUP | Status::IM_ALL | Status::TE;
        st.pop();
        assert!(st.interrupts_on());
        assert!(st.user_mode());
        assert!(st.contains(Status::TE));
    }

    #[test]
    fn cause_fields() {
        let mut c = Cause::default();
        c.set_exc_code(ExceptionCode::Syscall);
        c.set_ip(0b10);
        assert_eq!(c.exc_code(), 8);
        assert_eq!(c.ip(), 0x200);
        c.set_exc_code(ExceptionCode::ReservedInstruction);
        assert_eq!(c.exc_code(), 10);
        assert_eq!(c.ip(), 0x200);
    }

    #[test]
    fn register_zero_is_hardwired() {
        let mut s = ProcessorState::new();
        s.set_reg(0, 7);
        assert_eq!(s.reg(0), 0);
        s.set_reg(reg::V0, 7);
        assert_eq!(s.v0(), 7);
    }
}
