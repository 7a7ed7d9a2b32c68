//! Character I/O end to end: printer output, and a terminal round trip
//! between two U-procs over null-modem wiring.

mod common;

use common::machine_for_uprocs;
use pandos::initial::{Outcome, boot_and_run};
use pandos::kcontext::KernelCtx;
use pandos::support::init::instantiate;
use umach::aout;
use umach::isa::{Asm, reg};

/// Print `text` (stored into page 1 first) on the caller's printer, then
/// terminate.
fn printer_program(text: &[u8]) -> Vec<u8> {
    let mut asm = Asm::new();
    asm.li(reg::T0, 0x8000_1000);
    for (i, chunk) in text.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        asm.li(reg::T1, u32::from_le_bytes(word));
        asm.sw(reg::T1, reg::T0, (i * 4) as i16);
    }
    asm.li(reg::A0, 11);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, text.len() as u32);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

/// Write "ping\n" to the caller's terminal, then terminate.
fn ping_writer() -> Vec<u8> {
    let mut asm = Asm::new();
    asm.li(reg::T0, 0x8000_1000);
    asm.li(reg::T1, u32::from_le_bytes(*b"ping"));
    asm.sw(reg::T1, reg::T0, 0);
    asm.li(reg::T1, b'\n' as u32);
    asm.sw(reg::T1, reg::T0, 4);
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 5);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

/// Read one line from the caller's terminal, then echo exactly the bytes
/// read back out through the transmitter.
fn line_echoer() -> Vec<u8> {
    let mut asm = Asm::new();
    asm.li(reg::A0, 13);
    asm.li(reg::A1, 0x8000_1000);
    asm.syscall();
    // v0 holds the length read; echo that many bytes.
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.addi(reg::A2, reg::V0, 0);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

#[test]
fn printer_receives_the_whole_string() {
    let machine = machine_for_uprocs(&[printer_program(b"hello printer")]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 1)),
    );

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(
        sys.machine.devices.printers[0].as_ref().unwrap().output,
        b"hello printer"
    );
}

#[test]
fn terminal_round_trip_between_two_uprocs() {
    // U-proc 1's transmitter feeds U-proc 2's receiver.
    let machine = machine_for_uprocs(&[ping_writer(), line_echoer()])
        .wire_terminals(0, 1)
        .build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 2)),
    );

    assert_eq!(outcome, Outcome::Halt);
    let terminals = &sys.machine.devices.terminals;
    assert_eq!(terminals[0].as_ref().unwrap().output, b"ping\n");
    // The echoer read the full line (length 5) and wrote it back verbatim.
    assert_eq!(terminals[1].as_ref().unwrap().output, b"ping\n");
}

#[test]
fn oversized_write_is_a_program_trap() {
    // Length 200 exceeds the 128-byte cap: the U-proc dies without output.
    let mut asm = Asm::new();
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 200);
    asm.syscall();
    // Unreachable if the trap fires.
    asm.li(reg::A0, 9);
    asm.syscall();
    let machine = machine_for_uprocs(&[aout::build_image(&asm.assemble(), 0)]).build();

    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 1)),
    );

    assert_eq!(outcome, Outcome::Halt);
    assert!(sys.machine.devices.terminals[0].as_ref().unwrap().output.is_empty());
    assert_eq!(sys.nucleus.proc_cnt, 0);
}
