//! Whole-workload runs: the full eight-U-proc instantiation, time-slicing of
//! CPU-bound processes, and program-trap terminations.

mod common;

use common::machine_for_uprocs;
use pandos::initial::{Outcome, boot_and_run};
use pandos::kcontext::KernelCtx;
use pandos::support::init::{instantiate, instantiator};
use umach::aout;
use umach::isa::{Asm, reg};

/// Print `text` on the caller's printer, then terminate.
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

/// Burn 40 ms of CPU in a tight loop, then report whether wall-clock time
/// ran well past it (the sign of sharing the processor).
fn time_slice_probe() -> Vec<u8> {
    let mut asm = Asm::new();
    asm.li(reg::A0, 10);
    asm.syscall();
    asm.addi(reg::S0, reg::V0, 0);

    asm.li(reg::T1, 20_000);
    asm.label("spin");
    asm.addi(reg::T1, reg::T1, -1);
    asm.bne(reg::T1, reg::ZERO, "spin");

    asm.li(reg::A0, 10);
    asm.syscall();
    asm.sub(reg::S1, reg::V0, reg::S0);

    asm.li(reg::T2, 60_000);
    asm.blt(reg::S1, reg::T2, "alone");
    asm.li(reg::S2, 0x0A59); // "Y\n": shared the CPU
    asm.jmp("report");
    asm.label("alone");
    asm.li(reg::S2, 0x0A4E); // "N\n"
    asm.label("report");
    asm.li(reg::T0, 0x8000_1000);
    asm.sw(reg::S2, reg::T0, 0);
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 2);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();
    aout::build_image(&asm.assemble(), 0)
}

#[test]
fn all_eight_uprocs_run_to_completion() {
    let images: Vec<Vec<u8>> = (0..8)
        .map(|i| printer_program(&[b'0' + i as u8, b'\n']))
        .collect();
    let machine = machine_for_uprocs(&images).build();
    let (outcome, sys) = boot_and_run(machine, Box::new(instantiator));

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(sys.nucleus.proc_cnt, 0);
    for i in 0..8usize {
        assert_eq!(
            sys.machine.devices.printers[i].as_ref().unwrap().output,
            vec![b'0' + i as u8, b'\n'],
            "U-proc {} never printed",
            i + 1
        );
    }
}

#[test]
fn cpu_bound_uprocs_share_the_processor() {
    let machine =
        machine_for_uprocs(&[time_slice_probe(), time_slice_probe()]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 2)),
    );

    assert_eq!(outcome, Outcome::Halt);
    for i in 0..2usize {
        assert_eq!(
            sys.machine.devices.terminals[i].as_ref().unwrap().output,
            b"Y\n",
            "U-proc {} ran unsliced",
            i + 1
        );
    }
}

#[test]
fn store_outside_kuseg_kills_the_uproc() {
    let mut asm = Asm::new();
    asm.li(reg::T0, 0x1000);
    asm.sw(reg::T1, reg::T0, 0);
    // Unreachable: the store is an address error.
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
    assert_eq!(sys.nucleus.proc_cnt, 0);
    assert!(sys.machine.devices.terminals[0].as_ref().unwrap().output.is_empty());
}

#[test]
fn unknown_syscall_number_kills_the_uproc() {
    let mut asm = Asm::new();
    asm.li(reg::A0, 99);
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

#[test]
fn privileged_syscall_from_user_mode_kills_the_uproc() {
    // SYS2 straight from user mode: rewritten to a reserved-instruction trap.
    let mut asm = Asm::new();
    asm.li(reg::A0, 2);
    asm.syscall();
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
