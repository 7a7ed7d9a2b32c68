//! Demand paging end to end: a U-proc whose working set is twice the swap
//! pool writes a distinct marker into every page of its address space, then
//! reads everything back. Each page makes the full round trip — faulted in
//! from the backing store, dirtied, evicted with a write-back, and faulted in
//! again — and the values must survive.

mod common;

use common::machine_for_uprocs;
use pandos::initial::{Outcome, boot_and_run};
use pandos::kcontext::KernelCtx;
use pandos::support::init::instantiate;
use umach::aout;
use umach::isa::{Asm, reg};

/// Touch pages 1..=30 and the stack page with markers, verify both passes,
/// and report a single `Y` or `N` line on the terminal.
fn paging_workout() -> Vec<u8> {
    let mut asm = Asm::new();

    // Write pass over the 30 data pages.
    asm.li(reg::T0, 0x8000_1000);
    asm.li(reg::T1, 30);
    asm.li(reg::T2, 0xAB00_0000);
    asm.label("write");
    asm.sw(reg::T2, reg::T0, 0);
    asm.addi(reg::T2, reg::T2, 1);
    asm.addi(reg::T0, reg::T0, 4096);
    asm.addi(reg::T1, reg::T1, -1);
    asm.bne(reg::T1, reg::ZERO, "write");
    // And the stack page.
    asm.li(reg::T0, 0xBFFF_F000);
    asm.li(reg::T2, 0xDDCC_0001);
    asm.sw(reg::T2, reg::T0, 0);

    // Read pass: every marker must have survived eviction.
    asm.li(reg::T0, 0x8000_1000);
    asm.li(reg::T1, 30);
    asm.li(reg::T2, 0xAB00_0000);
    asm.label("check");
    asm.lw(reg::T3, reg::T0, 0);
    asm.bne(reg::T3, reg::T2, "bad");
    asm.addi(reg::T2, reg::T2, 1);
    asm.addi(reg::T0, reg::T0, 4096);
    asm.addi(reg::T1, reg::T1, -1);
    asm.bne(reg::T1, reg::ZERO, "check");
    asm.li(reg::T0, 0xBFFF_F000);
    asm.lw(reg::T3, reg::T0, 0);
    asm.li(reg::T2, 0xDDCC_0001);
    asm.bne(reg::T3, reg::T2, "bad");

    asm.li(reg::S0, 0x0A59); // "Y\n"
    asm.jmp("report");
    asm.label("bad");
    asm.li(reg::S0, 0x0A4E); // "N\n"
    asm.label("report");
    asm.li(reg::T0, 0x8000_1000);
    asm.sw(reg::S0, reg::T0, 0);
    asm.li(reg::A0, 12);
    asm.li(reg::A1, 0x8000_1000);
    asm.li(reg::A2, 2);
    asm.syscall();
    asm.li(reg::A0, 9);
    asm.syscall();

    aout::build_image(&asm.assemble(), 0)
}

#[test]
fn every_page_survives_the_swap_round_trip() {
    let machine = machine_for_uprocs(&[paging_workout()]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 1)),
    );

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(sys.nucleus.proc_cnt, 0);
    assert_eq!(
        sys.machine.devices.terminals[0].as_ref().unwrap().output,
        b"Y\n",
        "a marker was lost or corrupted across eviction"
    );
}

#[test]
fn backing_store_carries_the_boot_image() {
    let image = paging_workout();
    let machine = machine_for_uprocs(&[image.clone()]).build();
    let (outcome, sys) = boot_and_run(
        machine,
        Box::new(|ctx: &mut KernelCtx<'_>| instantiate(ctx, 1)),
    );

    assert_eq!(outcome, Outcome::Halt);
    // Sector 0 of the backing store is page 0 of U-proc 1's image.
    let sector = sys.machine.devices.disks[0]
        .as_ref()
        .unwrap()
        .sector(0)
        .unwrap();
    assert_eq!(&sector[..image.len().min(4096)], &image[..image.len().min(4096)]);
}
