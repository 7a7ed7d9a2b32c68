//! The interrupt handler.
//!
//! Dispatch is by priority: the processor-local timer preempts the running
//! process; the interval timer bulk-wakes every pseudo-clock waiter; then
//! device lines 3..=7 in line order, devices in device-number order, with a
//! terminal's transmitter ahead of its receiver. One interrupt is serviced
//! per entry — anything still pending re-enters immediately.

use crate::asl::{PSEUDO_CLOCK, device_sem_key};
use crate::exceptions::Control;
use crate::initial::System;
use crate::{PSEUDO_CLOCK_PERIOD, QUANTUM};
use umach::cpu::Status;
use umach::dev::{self, STATUS_BUSY, STATUS_READY};

/// Service one pending interrupt from the machine loop. With no current
/// process (the WAIT case) the scheduler is re-entered afterwards.
pub(crate) fn handle(sys: &mut System) -> Control {
    let lines = sys.machine.pending_lines();

    if sys.nucleus.current.is_some() && lines & (1 << 1) != 0 {
        return quantum_expired(sys);
    }
    if lines & (1 << 2) != 0 {
        return interval_tick(sys);
    }
    if let Some((line, devno)) = first_interrupting_device(sys, lines) {
        return device_done(sys, line, devno);
    }

    if sys.nucleus.current.is_none() {
        Control::Schedule
    } else {
        Control::Resume
    }
}

/// Deliver interval-timer and device interrupts that became pending while
/// kernel-native code of the current process runs with interrupts enabled.
/// The local timer does not preempt kernel-native code.
pub(crate) fn service_pending(sys: &mut System, kstatus: Status) {
    loop {
        sys.machine.pump_io();
        let mut lines = sys.machine.devices.pending_lines();
        if sys.machine.clock.interval_pending() {
            lines |= 1 << 2;
        }
        let deliverable = lines & ((kstatus.bits() & Status::IM_ALL.bits()) >> 8);
        if deliverable == 0 {
            return;
        }
        if deliverable & (1 << 2) != 0 {
            interval_tick(sys);
            continue;
        }
        match first_interrupting_device(sys, deliverable) {
            Some((line, devno)) => {
                device_done(sys, line, devno);
            }
            None => return,
        }
    }
}

/// The running process exhausted its quantum: reload the timer, bank its CPU
/// time, and move it to the tail of the ready queue.
fn quantum_expired(sys: &mut System) -> Control {
    sys.machine.set_plt(QUANTUM);
    let cur = sys.nucleus.current.expect("preemption needs a running process");
    sys.nucleus.pcbs.get_mut(cur).state = sys.machine.cpu.clone();
    sys.charge_current();
    let n = &mut sys.nucleus;
    n.pcbs.insert_proc_q(&mut n.ready, cur);
    n.current = None;
    Control::Schedule
}

/// Pseudo-clock tick: reload the interval timer and wake every waiter; the
/// semaphore is reset to zero so ticks never accumulate.
fn interval_tick(sys: &mut System) -> Control {
    sys.machine.load_interval(PSEUDO_CLOCK_PERIOD);
    let n = &mut sys.nucleus;
    while let Some(p) = n.asl.remove_blocked(&mut n.pcbs, PSEUDO_CLOCK) {
        n.pcbs.insert_proc_q(&mut n.ready, p);
        n.soft_block_cnt -= 1;
    }
    n.sems.set(PSEUDO_CLOCK, 0);
    if sys.nucleus.current.is_none() {
        Control::Schedule
    } else {
        Control::Resume
    }
}

/// Highest-priority (line, device) pair with an unacknowledged completion.
fn first_interrupting_device(sys: &System, lines: u32) -> Option<(u32, usize)> {
    for line in dev::DISK_LINE..=dev::TERMINAL_LINE {
        if lines & (1 << line) == 0 {
            continue;
        }
        let map = sys.machine.devices.interrupting_devices(line);
        for devno in 0..dev::DEV_PER_LINE {
            if map & (1 << devno) != 0 {
                return Some((line, devno));
            }
        }
    }
    None
}

fn sub_device_completed(status: u32) -> bool {
    !matches!(status & 0xFF, STATUS_READY | STATUS_BUSY)
}

/// Read and acknowledge the completed (sub-)device, V its nucleus semaphore,
/// and hand the status to the woken waiter if there is one.
fn device_done(sys: &mut System, line: u32, devno: usize) -> Control {
    let now = sys.machine.now();
    let (status, key) = match line {
        dev::DISK_LINE => {
            let d = sys.machine.devices.disks[devno]
                .as_mut()
                .expect("interrupt from an installed device");
            let status = d.status();
            d.write_command(dev::CMD_ACK, now);
            (status, device_sem_key(line, devno, false))
        }
        dev::FLASH_LINE => {
            let d = sys.machine.devices.flashes[devno]
                .as_mut()
                .expect("interrupt from an installed device");
            let status = d.status();
            d.write_command(dev::CMD_ACK, now);
            (status, device_sem_key(line, devno, false))
        }
        dev::PRINTER_LINE => {
            let d = sys.machine.devices.printers[devno]
                .as_mut()
                .expect("interrupt from an installed device");
            let status = d.status();
            d.write_command(dev::CMD_ACK, now);
            (status, device_sem_key(line, devno, false))
        }
        dev::TERMINAL_LINE => {
            let t = sys.machine.devices.terminals[devno]
                .as_mut()
                .expect("interrupt from an installed device");
            // Transmitter completions outrank receiver completions.
            if t.transm_interrupting() && sub_device_completed(t.transm_status()) {
                let status = t.transm_status();
                t.write_transm_command(dev::CMD_ACK, now);
                (status, device_sem_key(line, devno, false))
            } else {
                let status = t.recv_status();
                debug_assert!(sub_device_completed(status));
                t.write_recv_command(dev::CMD_ACK, now);
                (status, device_sem_key(line, devno, true))
            }
        }
        _ => unreachable!("no devices on line {line}"),
    };

    sys.nucleus.sems.increment(key);
    let n = &mut sys.nucleus;
    if let Some(p) = n.asl.remove_blocked(&mut n.pcbs, key) {
        n.pcbs.get_mut(p).state.set_v0(status);
        n.soft_block_cnt -= 1;
        n.pcbs.insert_proc_q(&mut n.ready, p);
    }

    if sys.nucleus.current.is_none() {
        Control::Schedule
    } else {
        Control::Resume
    }
}
