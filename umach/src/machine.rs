//! The machine: one CPU, RAM, TLB, clocks and the device bus.
//!
//! The kernel drives the machine through two entry points. [`Machine::run_user`]
//! interprets the loaded processor state instruction by instruction until
//! something needs the kernel — a deliverable interrupt, a TLB refill, or an
//! exception — and returns a typed [`Event`] with the saved state left in
//! [`Machine::cpu`] exactly as exception hardware would deposit it (cause
//! filled in, KU/IE stack pushed, PC at the faulting instruction).
//! [`Machine::wait_for_interrupt`] is WAIT: it advances time to the next
//! thing that can happen.
//!
//! Every fetch, load and store of interpreted code translates through the
//! TLB; there is no escape hatch, which is the point.

use crate::addressing::{Pa, Va};
use crate::clock::{Clock, LocalTimer};
use crate::cpu::{ExceptionCode, ProcessorState, Status};
use crate::dev::Devices;
use crate::isa::Inst;
use crate::mem::Ram;
use crate::tlb::{EntryHi, Tlb};

/// Why control came back to the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// A deliverable interrupt is pending; the lines are in the saved cause.
    Interrupt,
    /// The TLB has no entry for the access; EntryHi names the page.
    Refill {
        /// Page and address space of the access.
        hi: EntryHi,
        /// Whether the access was a store.
        store: bool,
    },
    /// Any other exception, syscalls included.
    Exception(ExceptionCode),
}

enum Fault {
    Refill { hi: EntryHi, store: bool },
    Invalid { hi: EntryHi, store: bool },
    Mod { hi: EntryHi },
    Address { store: bool },
    Bus { store: bool },
}

/// The whole machine.
pub struct Machine {
    /// Live processor state (the saved exception state after an [`Event`]).
    pub cpu: ProcessorState,
    /// The software-managed TLB.
    pub tlb: Tlb,
    /// Installed RAM.
    pub ram: Ram,
    /// The device bus.
    pub devices: Devices,
    /// TOD and interval timer.
    pub clock: Clock,
    /// Processor-local timer.
    pub plt: LocalTimer,
}

impl Machine {
    /// Current time of day in microseconds.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Load the system-wide interval timer.
    pub fn load_interval(&mut self, period: u64) {
        self.clock.load_interval(period);
    }

    /// Load the processor-local timer.
    pub fn set_plt(&mut self, us: u64) {
        self.plt.set(us);
    }

    /// Load a saved processor state for dispatch, popping the KU/IE stack.
    pub fn load_state(&mut self, state: &ProcessorState) {
        self.cpu = state.clone();
        self.cpu.status.pop();
    }

    /// Complete every device command whose latency has elapsed.
    pub fn pump_io(&mut self) {
        self.devices.pump(self.clock.now(), &mut self.ram);
    }

    /// Bitmap of interrupt lines currently requesting service.
    pub fn pending_lines(&self) -> u32 {
        let mut lines = self.devices.pending_lines();
        if self.clock.interval_pending() {
            lines |= 1 << 2;
        }
        if self.cpu.status.contains(Status::TE) && self.plt.expired() {
            lines |= 1 << 1;
        }
        lines
    }

    fn deliverable(&self) -> bool {
        self.cpu.status.interrupts_on()
            && (self.pending_lines() << 8) & self.cpu.status.bits() & Status::IM_ALL.bits() != 0
    }

    /// Translate a virtual address through the TLB.
    fn translate(&self, va: Va, store: bool) -> Result<Pa, Fault> {
        if !va.in_kuseg() {
            return Err(Fault::Address { store });
        }
        if !va.aligned() {
            return Err(Fault::Address { store });
        }
        let asid = self.cpu.entry_hi.asid();
        let hi = EntryHi::for_access(va, asid);
        match self.tlb.lookup(va.vpn(), asid) {
            None => Err(Fault::Refill { hi, store }),
            Some(e) if !e.lo.valid() => Err(Fault::Invalid { hi, store }),
            Some(e) if store && !e.lo.dirty() => Err(Fault::Mod { hi }),
            Some(e) => Ok(Pa::from_pfn(e.lo.pfn()) + va.offset()),
        }
    }

    fn load_word(&self, va: Va) -> Result<u32, Fault> {
        let pa = self.translate(va, false)?;
        self.ram.read_word(pa).ok_or(Fault::Bus { store: false })
    }

    fn store_word(&mut self, va: Va, value: u32) -> Result<(), Fault> {
        let pa = self.translate(va, true)?;
        self.ram.write_word(pa, value).ok_or(Fault::Bus { store: true })
    }

    fn raise(&mut self, fault: Fault) -> Event {
        let (code, event) = match fault {
            Fault::Refill { hi, store } => {
                self.cpu.entry_hi = hi;
                // Refills bypass the cause register; the kernel resolves them
                // from EntryHi alone.
                self.cpu.status.push();
                return Event::Refill { hi, store };
            }
            Fault::Invalid { hi, store } => {
                self.cpu.entry_hi = hi;
                let code = if store {
                    ExceptionCode::TlbStoreInvalid
                } else {
                    ExceptionCode::TlbLoadInvalid
                };
                (code, Event::Exception(code))
            }
            Fault::Mod { hi } => {
                self.cpu.entry_hi = hi;
                (ExceptionCode::TlbMod, Event::Exception(ExceptionCode::TlbMod))
            }
            Fault::Address { store } => {
                let code = if store {
                    ExceptionCode::AddressStore
                } else {
                    ExceptionCode::AddressLoad
                };
                (code, Event::Exception(code))
            }
            Fault::Bus { store } => {
                let code = if store {
                    ExceptionCode::BusData
                } else {
                    ExceptionCode::BusFetch
                };
                (code, Event::Exception(code))
            }
        };
        self.cpu.cause.set_exc_code(code);
        self.cpu.status.push();
        event
    }

    fn raise_code(&mut self, code: ExceptionCode) -> Event {
        self.cpu.cause.set_exc_code(code);
        self.cpu.status.push();
        Event::Exception(code)
    }

    /// Interpret the loaded state until an [`Event`] hands control back.
    pub fn run_user(&mut self) -> Event {
        debug_assert!(
            self.cpu.status.user_mode(),
            "only user-mode code is interpreted"
        );
        loop {
            self.pump_io();
            if self.deliverable() {
                self.cpu.cause.set_exc_code(ExceptionCode::Interrupt);
                self.cpu.cause.set_ip(self.pending_lines());
                self.cpu.status.push();
                return Event::Interrupt;
            }

            let pc = Va::new(self.cpu.pc);
            let word = match self.load_word(pc) {
                Ok(w) => w,
                Err(f) => return self.raise(f),
            };
            let Some(inst) = Inst::decode(word) else {
                return self.raise_code(ExceptionCode::ReservedInstruction);
            };

            let mut next_pc = self.cpu.pc.wrapping_add(inst.len());
            match inst {
                Inst::Nop => {}
                Inst::Li { rd, imm } => self.cpu.set_reg(rd, imm as u32),
                Inst::Liw { rd } => {
                    let imm = match self.load_word(pc + 4) {
                        Ok(w) => w,
                        Err(f) => return self.raise(f),
                    };
                    self.cpu.set_reg(rd, imm);
                }
                Inst::Lw { rd, rs, off } => {
                    let addr = Va::new(self.cpu.reg(rs).wrapping_add(off as i32 as u32));
                    match self.load_word(addr) {
                        Ok(w) => self.cpu.set_reg(rd, w),
                        Err(f) => return self.raise(f),
                    }
                }
                Inst::Sw { rd, rs, off } => {
                    let addr = Va::new(self.cpu.reg(rs).wrapping_add(off as i32 as u32));
                    if let Err(f) = self.store_word(addr, self.cpu.reg(rd)) {
                        return self.raise(f);
                    }
                }
                Inst::Add { rd, rs, rt } => {
                    self.cpu.set_reg(rd, self.cpu.reg(rs).wrapping_add(self.cpu.reg(rt)))
                }
                Inst::Addi { rd, rs, imm } => self
                    .cpu
                    .set_reg(rd, self.cpu.reg(rs).wrapping_add(imm as i32 as u32)),
                Inst::Sub { rd, rs, rt } => {
                    self.cpu.set_reg(rd, self.cpu.reg(rs).wrapping_sub(self.cpu.reg(rt)))
                }
                Inst::Beq { rd, rs, off } => {
                    if self.cpu.reg(rd) == self.cpu.reg(rs) {
                        next_pc = branch_target(self.cpu.pc, off);
                    }
                }
                Inst::Bne { rd, rs, off } => {
                    if self.cpu.reg(rd) != self.cpu.reg(rs) {
                        next_pc = branch_target(self.cpu.pc, off);
                    }
                }
                Inst::Blt { rd, rs, off } => {
                    if (self.cpu.reg(rd) as i32) < self.cpu.reg(rs) as i32 {
                        next_pc = branch_target(self.cpu.pc, off);
                    }
                }
                Inst::J { off } => next_pc = branch_target(self.cpu.pc, off),
                Inst::Syscall => {
                    // The saved PC stays at the SYSCALL instruction; the
                    // kernel advances it past the trap before dispatch.
                    return self.raise_code(ExceptionCode::Syscall);
                }
            }
            self.cpu.set_pc(next_pc);

            self.clock.advance(1);
            if self.cpu.status.contains(Status::TE) {
                self.plt.tick();
            }
        }
    }

    /// WAIT: advance time to the next interrupt source and complete it.
    pub fn wait_for_interrupt(&mut self) {
        self.pump_io();
        loop {
            if self.devices.pending_lines() != 0 || self.clock.interval_pending() {
                return;
            }
            let next_dev = self.devices.next_completion();
            let next_interval = self.clock.interval_deadline();
            let target = match (next_dev, next_interval) {
                (Some(a), Some(b)) => a.min(b),
                (a, b) => match a.or(b) {
                    Some(t) => t,
                    // Nothing can ever happen; the kernel only waits when an
                    // interrupt is guaranteed, so this is unreachable in a
                    // configured system.
                    None => return,
                },
            };
            self.clock.jump_to(target);
            self.pump_io();
        }
    }
}

#[inline]
fn branch_target(pc: u32, off: i16) -> u32 {
    pc.wrapping_add(4).wrapping_add((off as i32 as u32).wrapping_mul(4))
}

/// Configures and builds a [`Machine`].
pub struct MachineBuilder {
    ram_frames: usize,
    devices: Devices,
    terminal_scripts: Vec<(usize, Vec<u8>)>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBuilder {
    /// Start from an empty bus and the default RAM size.
    pub fn new() -> Self {
        Self {
            ram_frames: 128,
            devices: Devices::new(),
            terminal_scripts: Vec::new(),
        }
    }

    /// Install `frames` frames of RAM.
    pub fn ram_frames(mut self, frames: usize) -> Self {
        self.ram_frames = frames;
        self
    }

    /// Install a disk with the given geometry.
    pub fn disk(mut self, devno: usize, cylinders: u32, heads: u32, sectors: u32) -> Self {
        self.devices.disks[devno] = Some(crate::dev::Disk::new(cylinders, heads, sectors));
        self
    }

    /// Install a flash device, optionally preloaded with a boot image.
    pub fn flash(mut self, devno: usize, blocks: u32, image: Option<&[u8]>) -> Self {
        self.devices.flashes[devno] = Some(match image {
            Some(image) => crate::dev::Flash::with_image(blocks, image),
            None => crate::dev::Flash::new(blocks),
        });
        self
    }

    /// Install a printer.
    pub fn printer(mut self, devno: usize) -> Self {
        self.devices.printers[devno] = Some(crate::dev::Printer::new());
        self
    }

    /// Install a terminal.
    pub fn terminal(mut self, devno: usize) -> Self {
        self.devices.terminals[devno] = Some(crate::dev::Terminal::new());
        self
    }

    /// Queue input on a terminal's receiver before boot.
    pub fn terminal_input(mut self, devno: usize, bytes: &[u8]) -> Self {
        self.terminal_scripts.push((devno, bytes.to_vec()));
        self
    }

    /// Feed terminal `tx`'s transmitter into terminal `rx`'s receiver.
    pub fn wire_terminals(mut self, tx: usize, rx: usize) -> Self {
        self.devices.term_loopback[tx] = Some(rx);
        self
    }

    /// Build the machine.
    pub fn build(self) -> Machine {
        let mut devices = self.devices;
        for (devno, bytes) in self.terminal_scripts {
            if let Some(t) = devices.terminals.get_mut(devno).and_then(Option::as_mut) {
                t.push_input(&bytes, 0);
            }
        }
        Machine {
            cpu: ProcessorState::new(),
            tlb: Tlb::new(),
            ram: Ram::new(self.ram_frames),
            devices,
            clock: Clock::default(),
            plt: LocalTimer::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{PAGE_SIZE, RAM_BASE};
    use crate::isa::{Asm, reg};
    use crate::tlb::{EntryLo, EntryLoFlags, TlbEntry};

    fn user_machine_with_program(words: &[u32]) -> Machine {
        let mut m = MachineBuilder::new().ram_frames(8).build();
        // Map one code page and one data page straight into the first frames.
        let code_pa = Pa::new(RAM_BASE);
        for (i, w) in words.iter().enumerate() {
            m.ram.write_word(code_pa + (i as u32 * 4), *w).unwrap();
        }
        m.tlb.write_random(TlbEntry {
            hi: EntryHi::new(0x80000, 1),
            lo: EntryLo::new(code_pa.pfn(), EntryLoFlags::VALID | EntryLoFlags::DIRTY),
        });
        m.tlb.write_random(TlbEntry {
            hi: EntryHi::new(0x80001, 1),
            lo: EntryLo::new(code_pa.pfn() + 1, EntryLoFlags::VALID | EntryLoFlags::DIRTY),
        });
        let mut state = ProcessorState::new();
        state.set_pc(0x8000_0000);
        state.entry_hi = EntryHi::new(0, 1);
        state.status = Status::KUP | Status::IEP | Status::IM_ALL | Status::TE;
        m.set_plt(5000);
        m.load_state(&state);
        m
    }

    #[test]
    fn executes_straight_line_code_until_syscall() {
        let mut asm = Asm::new();
        asm.li(reg::T0, 40);
        asm.addi(reg::T0, reg::T0, 2);
        asm.li(reg::A0, 9);
        asm.syscall();
        let mut m = user_machine_with_program(&asm.assemble());

        assert_eq!(m.run_user(), Event::Exception(ExceptionCode::Syscall));
        assert_eq!(m.cpu.reg(reg::T0), 42);
        assert_eq!(m.cpu.a0(), 9);
        // Saved PC still points at the SYSCALL word.
        assert_eq!(m.cpu.pc, 0x8000_000C);
        assert!(!m.cpu.status.user_mode(), "exception entry is kernel mode");
    }

    #[test]
    fn loop_counts_and_store_hits_memory() {
        let mut asm = Asm::new();
        asm.li(reg::T0, 0);
        asm.li(reg::T1, 10);
        asm.label("loop");
        asm.addi(reg::T0, reg::T0, 1);
        asm.blt(reg::T0, reg::T1, "loop");
        asm.li(reg::T2, 0x8000_1000);
        asm.sw(reg::T0, reg::T2, 0);
        asm.syscall();
        let mut m = user_machine_with_program(&asm.assemble());

        assert_eq!(m.run_user(), Event::Exception(ExceptionCode::Syscall));
        assert_eq!(m.ram.read_word(Pa::new(RAM_BASE + PAGE_SIZE)), Some(10));
    }

    #[test]
    fn unmapped_page_raises_refill() {
        let mut asm = Asm::new();
        asm.li(reg::T2, 0x8000_5000);
        asm.lw(reg::T0, reg::T2, 0);
        let mut m = user_machine_with_program(&asm.assemble());

        let ev = m.run_user();
        assert_eq!(
            ev,
            Event::Refill { hi: EntryHi::new(0x80005, 1), store: false }
        );
        assert_eq!(m.cpu.entry_hi, EntryHi::new(0x80005, 1));
    }

    #[test]
    fn kuseg_fence_raises_address_error() {
        let mut asm = Asm::new();
        asm.li(reg::T2, 0x1000);
        asm.sw(reg::T0, reg::T2, 0);
        let mut m = user_machine_with_program(&asm.assemble());

        assert_eq!(
            m.run_user(),
            Event::Exception(ExceptionCode::AddressStore)
        );
    }

    #[test]
    fn plt_expiry_interrupts_a_spinning_process() {
        let mut asm = Asm::new();
        asm.label("spin");
        asm.jmp("spin");
        let mut m = user_machine_with_program(&asm.assemble());
        m.set_plt(100);

        assert_eq!(m.run_user(), Event::Interrupt);
        assert_eq!(m.cpu.cause.ip() & (1 << 9), 1 << 9, "line 1 pending");
        assert!(m.now() >= 100);
    }
}
