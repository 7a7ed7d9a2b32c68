//! The delay facility: three sleepers with out-of-order delays must wake in
//! wake-time order, and nobody wakes early.

mod common;

use common::machine_for_uprocs;
use pandos::initial::{Outcome, boot_and_run};
use pandos::kcontext::KernelCtx;
use pandos::support::init::instantiate;
use umach::aout;
use umach::isa::{Asm, reg};

/// Sleep `seconds`, then take a ticket from the shared counter at the bottom
/// of the shared region and print its digit. Ticket order is wake order:
/// the wake-ups are seconds apart, so the unlocked read-modify-write is
/// safely serialized by time.
fn sleeper(seconds: u32) -> Vec<u8> {
    let mut asm = Asm::new();
    asm.li(reg::A0, 18);
    asm.li(reg::A1, seconds);
    asm.syscall();

    asm.li(reg::T0, 0xC000_0000);
    asm.lw(reg::T1, reg::T0, 0);
    asm.addi(reg::T2, reg::T1, 1);
    asm.sw(reg::T2, reg::T0, 0);

    // "<digit>\n" from the ticket.
    asm.addi(reg::T3, reg::T1, 0x30);
    asm.addi(reg::T3, reg::T3, 0x0A00);
    asm.li(reg::T0, 0x8000_1000);
    asm.sw(reg::T3, reg::T0, 0);
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 2);
    asm.syscall();

    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

#[test]
fn sleepers_wake_in_wake_time_order() {
    // U-proc 1 sleeps 3 s, U-proc 2 sleeps 1 s, U-proc 3 sleeps 2 s.
    let machine =
        machine_for_uprocs(&[sleeper(3), sleeper(1), sleeper(2)]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 3)),
    );

    assert_eq!(outcome, Outcome::Halt);
    let term = |i: usize| sys.machine.devices.terminals[i].as_ref().unwrap().output.clone();
    assert_eq!(term(1), b"0\n", "the 1 s sleeper wakes first");
    assert_eq!(term(2), b"1\n", "the 2 s sleeper wakes second");
    assert_eq!(term(0), b"2\n", "the 3 s sleeper wakes last");
    // Nobody woke before its deadline.
    assert!(sys.machine.now() >= 3_000_000);
}

#[test]
fn negative_delay_is_a_program_trap() {
    let mut asm = Asm::new();
    asm.li(reg::A0, 18);
    asm.li(reg::A1, (-5i32) as u32);
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
    assert!(sys.machine.now() < 1_000_000, "the sleeper died, not slept");
}
