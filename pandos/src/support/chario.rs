//! Character device services: system calls 11..=13.
//!
//! Printers and terminals move one byte per command, so each service loops
//! under the (sub-)device's support-level mutex, writing the command and
//! issuing the device wait inside one interrupts-off window per character.
//! A terminal (sub-)device reports success with the char-done code; Busy and
//! Ready are device states, never completions. Each U-proc talks to the
//! devices matching its ASID.

use crate::kcontext::KernelCtx;
use crate::support::{ExcSlot, SupRef, Trap, vm};
use crate::{PRINTER_MAXLEN, TERMINAL_MAXLEN};
use umach::addressing::Va;
use umach::dev::{self, STATUS_CHAR_DONE, STATUS_READY, printer, terminal};

fn char_args(ctx: &KernelCtx<'_>, sup: SupRef) -> (Va, u32, usize) {
    let state = &ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize];
    let devno = (ctx.sys_ref().support.pool.get(sup).asid - 1) as usize;
    (Va::new(state.a1()), state.a2(), devno)
}

fn set_result(ctx: &mut KernelCtx<'_>, sup: SupRef, v0: u32) {
    ctx.sys_mut().support.pool.get_mut(sup).except_state[ExcSlot::General as usize].set_v0(v0);
    ctx.resume_from(sup, ExcSlot::General);
}

/// The whole string must lie inside KUSEG and respect the length cap; a
/// wrapped end address would slip below KUSEG and is caught the same way.
fn validate_string(va: Va, len: u32, cap: u32) -> Result<(), Trap> {
    if len > cap || !va.in_kuseg() || (len > 0 && !(va + (len - 1)).in_kuseg()) {
        return Err(Trap::BadAddress);
    }
    Ok(())
}

/// SYS11: write a string to the caller's printer, one DATA0 byte per
/// command. Returns the count written, or the negated status on a device
/// error.
pub(crate) fn sys_write_printer(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, len, devno) = char_args(ctx, sup);
    validate_string(va, len, PRINTER_MAXLEN)?;
    if ctx.sys_ref().machine.devices.printers[devno].is_none() {
        return Err(Trap::BadDevice);
    }

    let mutex =
        ctx.sys_ref().support.dev_mutex[(dev::PRINTER_LINE as usize - 3) * 8 + devno];
    ctx.passeren(mutex);

    let mut status = STATUS_READY;
    let mut sent = 0;
    while sent < len && status == STATUS_READY {
        let ch = match vm::read_user_byte(ctx, va + sent) {
            Ok(ch) => ch,
            Err(trap) => {
                ctx.verhogen(mutex);
                return Err(trap);
            }
        };
        status = ctx.masked(|ctx| {
            let now = ctx.now();
            let p = ctx.sys_mut().machine.devices.printers[devno]
                .as_mut()
                .expect("checked above");
            p.set_data0(ch as u32);
            p.write_command(printer::CMD_PRINTCHR, now);
            ctx.wait_io(dev::PRINTER_LINE, devno, false)
        });
        sent += 1;
    }

    ctx.verhogen(mutex);
    let v0 = if status == STATUS_READY {
        len
    } else {
        (status as i32).wrapping_neg() as u32
    };
    set_result(ctx, sup, v0);
    Ok(())
}

/// SYS12: write a string to the caller's terminal transmitter.
pub(crate) fn sys_write_terminal(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, len, devno) = char_args(ctx, sup);
    validate_string(va, len, TERMINAL_MAXLEN)?;
    if ctx.sys_ref().machine.devices.terminals[devno].is_none() {
        return Err(Trap::BadDevice);
    }

    let mutex =
        ctx.sys_ref().support.dev_mutex[(dev::TERMINAL_LINE as usize - 3) * 8 + devno];
    ctx.passeren(mutex);

    let mut status = STATUS_CHAR_DONE;
    let mut sent = 0;
    while sent < len && status & terminal::STATUS_MASK == STATUS_CHAR_DONE {
        let ch = match vm::read_user_byte(ctx, va + sent) {
            Ok(ch) => ch,
            Err(trap) => {
                ctx.verhogen(mutex);
                return Err(trap);
            }
        };
        status = ctx.masked(|ctx| {
            let now = ctx.now();
            let t = ctx.sys_mut().machine.devices.terminals[devno]
                .as_mut()
                .expect("checked above");
            t.write_transm_command(
                terminal::CMD_TRANSMITCHAR | ((ch as u32) << terminal::CHAR_SHIFT),
                now,
            );
            ctx.wait_io(dev::TERMINAL_LINE, devno, false)
        });
        sent += 1;
    }

    ctx.verhogen(mutex);
    let v0 = if status & terminal::STATUS_MASK == STATUS_CHAR_DONE {
        len
    } else {
        (status as i32).wrapping_neg() as u32
    };
    set_result(ctx, sup, v0);
    Ok(())
}

/// SYS13: read from the caller's terminal receiver until a newline or a
/// device error. Returns the count read, or the negated status.
pub(crate) fn sys_read_terminal(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, _, devno) = char_args(ctx, sup);
    if !va.in_kuseg() {
        return Err(Trap::BadAddress);
    }
    if ctx.sys_ref().machine.devices.terminals[devno].is_none() {
        return Err(Trap::BadDevice);
    }

    // The receiver is its own sub-device with its own mutex.
    let mutex =
        ctx.sys_ref().support.dev_mutex[(dev::TERMINAL_LINE as usize - 3 + 1) * 8 + devno];
    ctx.passeren(mutex);

    let mut count: u32 = 0;
    let status = loop {
        let status = ctx.masked(|ctx| {
            let now = ctx.now();
            let t = ctx.sys_mut().machine.devices.terminals[devno]
                .as_mut()
                .expect("checked above");
            t.write_recv_command(terminal::CMD_RECEIVECHAR, now);
            ctx.wait_io(dev::TERMINAL_LINE, devno, true)
        });
        if status & terminal::STATUS_MASK != STATUS_CHAR_DONE {
            break status;
        }

        let ch = ((status >> terminal::CHAR_SHIFT) & 0xFF) as u8;
        let at = va + count;
        if !at.in_kuseg() {
            ctx.verhogen(mutex);
            return Err(Trap::BadAddress);
        }
        if let Err(trap) = vm::write_user_byte(ctx, at, ch) {
            ctx.verhogen(mutex);
            return Err(trap);
        }
        count += 1;
        if ch == b'\n' {
            break status;
        }
    };

    ctx.verhogen(mutex);
    let v0 = if status & terminal::STATUS_MASK == STATUS_CHAR_DONE {
        count
    } else {
        (status as i32).wrapping_neg() as u32
    };
    set_result(ctx, sup, v0);
    Ok(())
}
