//! Shared fixtures: machines sized for the standard layout and kernel-mode
//! process states for workload bodies.
#![allow(dead_code)]

use umach::MachineBuilder;
use umach::cpu::{ProcessorState, Status, reg};

/// Backing-store geometry: 64 cylinders x 2 heads x 4 sectors = 512 sectors,
/// comfortably past the 288 the layout needs.
pub fn base_machine() -> MachineBuilder {
    MachineBuilder::new().ram_frames(128).disk(0, 64, 2, 4)
}

/// A machine carrying one flash boot image, terminal and printer per U-proc.
pub fn machine_for_uprocs(images: &[Vec<u8>]) -> MachineBuilder {
    let mut b = base_machine();
    for (i, image) in images.iter().enumerate() {
        b = b.flash(i, 64, Some(image)).terminal(i).printer(i);
    }
    b
}

/// The processor state a kernel-mode child starts from.
pub fn kernel_state(stack_top: u32) -> ProcessorState {
    let mut state = ProcessorState::new();
    state.status = Status::IEP | Status::IM_ALL | Status::TE;
    state.gpr[reg::SP] = stack_top;
    state
}
