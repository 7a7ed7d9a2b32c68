//! The user-mode instruction set and its assembler.
//!
//! User processes are real programs fetched out of paged memory, so every
//! fetch, load and store goes through the TLB and can fault. The set is the
//! minimum a test workload needs: immediates (with a two-word wide form for
//! full 32-bit constants), word load/store, add/sub, compare-and-branch, a
//! relative jump, and SYSCALL. Anything else a program wants it asks the
//! kernel for.
//!
//! Encoding: opcode in bits 31..=26, then three 5-bit register fields
//! (`rd`, `rs`, `rt`) and a 16-bit immediate in the low half. Branch
//! displacements are signed word counts relative to the following
//! instruction. `LIW` takes its 32-bit immediate from the next word.

/// Register names for assembly programs. Indices follow the kernel ABI
/// ([`crate::cpu::reg`]); the extra temporaries are free for program use.
pub mod reg {
    pub use crate::cpu::reg::*;

    /// Temporaries.
    pub const T0: usize = 8;
    pub const T1: usize = 9;
    pub const T2: usize = 10;
    pub const T3: usize = 11;
    /// Saved registers.
    pub const S0: usize = 16;
    pub const S1: usize = 17;
    pub const S2: usize = 18;
}

/// A decoded instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Inst {
    /// Do nothing.
    Nop,
    /// `rd ← imm` (zero-extended).
    Li { rd: usize, imm: u16 },
    /// `rd ← next word`; the instruction is two words long.
    Liw { rd: usize },
    /// `rd ← mem[rs + off]`.
    Lw { rd: usize, rs: usize, off: i16 },
    /// `mem[rs + off] ← rd`.
    Sw { rd: usize, rs: usize, off: i16 },
    /// `rd ← rs + rt`.
    Add { rd: usize, rs: usize, rt: usize },
    /// `rd ← rs + imm` (sign-extended).
    Addi { rd: usize, rs: usize, imm: i16 },
    /// `rd ← rs - rt`.
    Sub { rd: usize, rs: usize, rt: usize },
    /// Branch if `rd == rs`.
    Beq { rd: usize, rs: usize, off: i16 },
    /// Branch if `rd != rs`.
    Bne { rd: usize, rs: usize, off: i16 },
    /// Branch if `rd < rs` (signed).
    Blt { rd: usize, rs: usize, off: i16 },
    /// Unconditional relative jump.
    J { off: i16 },
    /// Trap into the kernel.
    Syscall,
}

const OP_NOP: u32 = 0;
const OP_LI: u32 = 1;
const OP_LIW: u32 = 2;
const OP_LW: u32 = 3;
const OP_SW: u32 = 4;
const OP_ADD: u32 = 5;
const OP_ADDI: u32 = 6;
const OP_SUB: u32 = 7;
const OP_BEQ: u32 = 8;
const OP_BNE: u32 = 9;
const OP_BLT: u32 = 10;
const OP_J: u32 = 11;
const OP_SYSCALL: u32 = 12;

#[inline]
const fn pack(op: u32, rd: usize, rs: usize, rt: usize, imm: u16) -> u32 {
    (op << 26)
        | ((rd as u32 & 0x1F) << 21)
        | ((rs as u32 & 0x1F) << 16)
        | ((rt as u32 & 0x1F) << 11)
        | imm as u32
}

impl Inst {
    /// Encode into an instruction word (the wide immediate of `LIW` travels
    /// separately).
    pub fn encode(self) -> u32 {
        match self {
            Inst::Nop => pack(OP_NOP, 0, 0, 0, 0),
            Inst::Li { rd, imm } => pack(OP_LI, rd, 0, 0, imm),
            Inst::Liw { rd } => pack(OP_LIW, rd, 0, 0, 0),
            Inst::Lw { rd, rs, off } => pack(OP_LW, rd, rs, 0, off as u16),
            Inst::Sw { rd, rs, off } => pack(OP_SW, rd, rs, 0, off as u16),
            Inst::Add { rd, rs, rt } => pack(OP_ADD, rd, rs, rt, 0),
            Inst::Addi { rd, rs, imm } => pack(OP_ADDI, rd, rs, 0, imm as u16),
            Inst::Sub { rd, rs, rt } => pack(OP_SUB, rd, rs, rt, 0),
            Inst::Beq { rd, rs, off } => pack(OP_BEQ, rd, rs, 0, off as u16),
            Inst::Bne { rd, rs, off } => pack(OP_BNE, rd, rs, 0, off as u16),
            Inst::Blt { rd, rs, off } => pack(OP_BLT, rd, rs, 0, off as u16),
            Inst::J { off } => pack(OP_J, 0, 0, 0, off as u16),
            Inst::Syscall => pack(OP_SYSCALL, 0, 0, 0, 0),
        }
    }

    /// Decode an instruction word. Returns `None` for a reserved opcode.
    pub fn decode(word: u32) -> Option<Self> {
        let op = word >> 26;
        let rd = ((word >> 21) & 0x1F) as usize;
        let rs = ((word >> 16) & 0x1F) as usize;
        let rt = ((word >> 11) & 0x1F) as usize;
        let imm = (word & 0xFFFF) as u16;
        Some(match op {
            OP_NOP => Inst::Nop,
            OP_LI => Inst::Li { rd, imm },
            OP_LIW => Inst::Liw { rd },
            OP_LW => Inst::Lw { rd, rs, off: imm as i16 },
            OP_SW => Inst::Sw { rd, rs, off: imm as i16 },
            OP_ADD => Inst::Add { rd, rs, rt },
            OP_ADDI => Inst::Addi { rd, rs, imm: imm as i16 },
            OP_SUB => Inst::Sub { rd, rs, rt },
            OP_BEQ => Inst::Beq { rd, rs, off: imm as i16 },
            OP_BNE => Inst::Bne { rd, rs, off: imm as i16 },
            OP_BLT => Inst::Blt { rd, rs, off: imm as i16 },
            OP_J => Inst::J { off: imm as i16 },
            OP_SYSCALL => Inst::Syscall,
            _ => return None,
        })
    }

    /// Length of the instruction in bytes.
    pub fn len(self) -> u32 {
        match self {
            Inst::Liw { .. } => 8,
            _ => 4,
        }
    }
}

enum AsmWord {
    Fixed(u32),
    Branch { op: u32, rd: usize, rs: usize, target: &'static str },
}

/// A small two-pass assembler with label resolution.
///
/// ```
/// use umach::isa::{Asm, reg};
///
/// let mut asm = Asm::new();
/// asm.li(reg::T0, 0);
/// asm.label("loop");
/// asm.addi(reg::T0, reg::T0, 1);
/// asm.li(reg::T1, 10);
/// asm.blt(reg::T0, reg::T1, "loop");
/// asm.li(reg::A0, 9);
/// asm.syscall();
/// let words = asm.assemble();
/// assert_eq!(words.len(), 6);
/// ```
#[derive(Default)]
pub struct Asm {
    words: Vec<AsmWord>,
    labels: std::collections::HashMap<&'static str, usize>,
}

impl Asm {
    /// An empty program.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, inst: Inst) {
        self.words.push(AsmWord::Fixed(inst.encode()));
    }

    /// Bind a label to the next emitted word.
    pub fn label(&mut self, name: &'static str) {
        let here = self.words.len();
        assert!(
            self.labels.insert(name, here).is_none(),
            "label {name:?} bound twice"
        );
    }

    pub fn nop(&mut self) {
        self.push(Inst::Nop);
    }

    /// Load a constant, choosing the narrow or wide form by value.
    pub fn li(&mut self, rd: usize, imm: u32) {
        if imm <= u16::MAX as u32 {
            self.push(Inst::Li { rd, imm: imm as u16 });
        } else {
            self.push(Inst::Liw { rd });
            self.words.push(AsmWord::Fixed(imm));
        }
    }

    pub fn lw(&mut self, rd: usize, rs: usize, off: i16) {
        self.push(Inst::Lw { rd, rs, off });
    }

    pub fn sw(&mut self, rd: usize, rs: usize, off: i16) {
        self.push(Inst::Sw { rd, rs, off });
    }

    pub fn add(&mut self, rd: usize, rs: usize, rt: usize) {
        self.push(Inst::Add { rd, rs, rt });
    }

    pub fn addi(&mut self, rd: usize, rs: usize, imm: i16) {
        self.push(Inst::Addi { rd, rs, imm });
    }

    pub fn sub(&mut self, rd: usize, rs: usize, rt: usize) {
        self.push(Inst::Sub { rd, rs, rt });
    }

    pub fn beq(&mut self, rd: usize, rs: usize, target: &'static str) {
        self.words.push(AsmWord::Branch { op: OP_BEQ, rd, rs, target });
    }

    pub fn bne(&mut self, rd: usize, rs: usize, target: &'static str) {
        self.words.push(AsmWord::Branch { op: OP_BNE, rd, rs, target });
    }

    pub fn blt(&mut self, rd: usize, rs: usize, target: &'static str) {
        self.words.push(AsmWord::Branch { op: OP_BLT, rd, rs, target });
    }

    pub fn jmp(&mut self, target: &'static str) {
        self.words.push(AsmWord::Branch { op: OP_J, rd: 0, rs: 0, target });
    }

    pub fn syscall(&mut self) {
        self.push(Inst::Syscall);
    }

    /// Resolve labels and emit the instruction words.
    ///
    /// Panics on an unbound label or an out-of-range displacement; both are
    /// programming errors in the test workload, not runtime conditions.
    pub fn assemble(self) -> Vec<u32> {
        let labels = self.labels;
        self.words
            .iter()
            .enumerate()
            .map(|(idx, w)| match w {
                AsmWord::Fixed(w) => *w,
                AsmWord::Branch { op, rd, rs, target } => {
                    let dest = *labels
                        .get(target)
                        .unwrap_or_else(|| panic!("unbound label {target:?}"));
                    let off = dest as i64 - (idx as i64 + 1);
                    let off = i16::try_from(off).expect("branch displacement out of range");
                    pack(*op, *rd, *rs, 0, off as u16)
                }
            })
            .collect()
    }
}
