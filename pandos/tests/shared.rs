//! Shared-region semaphores: two U-procs hammer one counter under a shared
//! binary semaphore; with the lock honored, no increment is lost.

mod common;

use common::machine_for_uprocs;
use pandos::initial::{Outcome, boot_and_run};
use pandos::kcontext::KernelCtx;
use pandos::support::init::instantiate;
use umach::addressing::Pa;
use umach::aout;
use umach::isa::{Asm, reg};

const SEM: u32 = 0xC000_0000;
const COUNTER: u32 = 0xC000_0004;
const ROUNDS: u32 = 1000;

/// Increment the shared counter `ROUNDS` times under the shared semaphore.
/// The first U-proc opens the gate with one V: the cell starts at zero, so
/// whoever Ps first simply waits for it.
fn incrementer(unlocks: bool) -> Vec<u8> {
    let mut asm = Asm::new();
    if unlocks {
        asm.li(reg::A0, 20);
        asm.li(reg::A1, SEM);
        asm.syscall();
    }

    asm.li(reg::S0, 0);
    asm.li(reg::S1, ROUNDS);
    asm.label("loop");
    asm.beq(reg::S0, reg::S1, "done");

    asm.li(reg::A0, 19);
    asm.li(reg::A1, SEM);
    asm.syscall();

    asm.li(reg::T0, COUNTER);
    asm.lw(reg::T1, reg::T0, 0);
    asm.addi(reg::T1, reg::T1, 1);
    asm.sw(reg::T1, reg::T0, 0);

    asm.li(reg::A0, 20);
    asm.li(reg::A1, SEM);
    asm.syscall();

    asm.addi(reg::S0, reg::S0, 1);
    asm.jmp("loop");

    asm.label("done");
    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

/// The final value of a shared cell: still in its swap frame if the page is
/// resident, otherwise on the backing store.
fn read_shared_word(sys: &pandos::initial::System, addr: u32) -> u32 {
    let page = ((addr >> 12) - 0xC0000) as usize;
    let offset = addr & 0xFFF;
    let pte = sys.support.global_pt[page];
    if pte.lo.valid() {
        sys.machine
            .ram
            .read_word(Pa::from_pfn(pte.lo.pfn()) + offset)
            .expect("resident shared page")
    } else {
        let sector = sys.machine.devices.disks[0]
            .as_ref()
            .unwrap()
            .sector(256 + page as u32)
            .expect("backing store sector");
        let at = offset as usize;
        u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]])
    }
}

#[test]
fn shared_semaphore_serializes_the_counter() {
    let machine = machine_for_uprocs(&[incrementer(true), incrementer(false)]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 2)),
    );

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(read_shared_word(&sys, COUNTER), 2 * ROUNDS);
    // A binary semaphore through matched P/V pairs ends where it started
    // plus the opening V.
    assert_eq!(read_shared_word(&sys, SEM), 1);
    assert!(sys.support.alsl.is_empty(), "nobody left blocked");
}

#[test]
fn shared_semaphore_address_outside_the_region_is_a_trap() {
    let mut asm = Asm::new();
    asm.li(reg::A0, 19);
    asm.li(reg::A1, 0x8000_1000); // private space, not KUSEGSHARE
    asm.syscall();
    // Unreachable if the trap fires.
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 1);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();

    let machine = machine_for_uprocs(&[aout::build_image(&asm.assemble(), 0)]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 1)),
    );

    assert_eq!(outcome, Outcome::Halt);
    assert!(sys.machine.devices.terminals[0].as_ref().unwrap().output.is_empty());
}
