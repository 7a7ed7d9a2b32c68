//! DMA device services: the disk and flash transfer helpers, and system
//! calls 14..=17.
//!
//! Both classes share one discipline: take the device's support-level mutex,
//! aim DATA0 at the transfer frame, then write the command word and issue the
//! device wait with interrupt delivery off — the window closes as the caller
//! blocks, so the completion interrupt can only be observed by the nucleus
//! after the waiter is queued. Disks additionally seek first, with the
//! cylinder/head/sector triple derived from the geometry word in DATA1.
//!
//! The user-facing calls move one page between the caller's address space
//! and a per-device kernel DMA buffer, after validating that the user range
//! lies entirely inside KUSEG, the device exists (disk 0 is reserved for the
//! backing store), and the sector or block is within bounds — flash blocks
//! below 32 hold boot images and are off limits.

use crate::kcontext::KernelCtx;
use crate::support::{ExcSlot, SupRef, Trap, vm};
use crate::{DISK_DMA_FRAME, FLASH_DMA_FRAME, MAXPAGES};
use umach::addressing::{PAGE_SIZE, Pa, RAM_BASE, Va};
use umach::dev::{self, STATUS_READY, disk, flash};

/// Run the disk protocol for one sector: seek, then transfer between the
/// sector and the frame at `pa`. Returns the final device status.
pub(crate) fn disk_operation(
    ctx: &mut KernelCtx<'_>,
    diskno: usize,
    sector: u32,
    pa: Pa,
    write: bool,
) -> u32 {
    let mutex = ctx.sys_ref().support.dev_mutex[(dev::DISK_LINE as usize - 3) * 8 + diskno];
    ctx.passeren(mutex);

    let Some((heads, sects)) = ctx
        .sys_ref()
        .machine
        .devices
        .disks[diskno]
        .as_ref()
        .map(|d| ((d.data1() >> 8) & 0xFF, d.data1() & 0xFF))
    else {
        ctx.verhogen(mutex);
        return dev::STATUS_UNINSTALLED;
    };

    let cyl = sector / (heads * sects);
    let rem = sector % (heads * sects);
    let head = rem / sects;
    let sect = rem % sects;

    let status = ctx.masked(|ctx| {
        let now = ctx.now();
        let d = ctx.sys_mut().machine.devices.disks[diskno]
            .as_mut()
            .expect("checked above");
        d.write_command((cyl << disk::CYL_SHIFT) | disk::CMD_SEEKCYL, now);
        ctx.wait_io(dev::DISK_LINE, diskno, false)
    });
    if status != STATUS_READY {
        ctx.verhogen(mutex);
        return status;
    }

    let status = ctx.masked(|ctx| {
        let now = ctx.now();
        let d = ctx.sys_mut().machine.devices.disks[diskno]
            .as_mut()
            .expect("checked above");
        d.set_data0(pa.into_u32());
        let cmd = if write { disk::CMD_WRITEBLK } else { disk::CMD_READBLK };
        d.write_command((head << disk::HEAD_SHIFT) | (sect << disk::SECT_SHIFT) | cmd, now);
        ctx.wait_io(dev::DISK_LINE, diskno, false)
    });

    ctx.verhogen(mutex);
    status
}

/// Run the flash protocol for one block: transfer between the block and the
/// frame at `pa`. Returns the final device status.
pub(crate) fn flash_operation(
    ctx: &mut KernelCtx<'_>,
    flashno: usize,
    block: u32,
    pa: Pa,
    write: bool,
) -> u32 {
    let mutex = ctx.sys_ref().support.dev_mutex[(dev::FLASH_LINE as usize - 3) * 8 + flashno];
    ctx.passeren(mutex);

    if ctx.sys_ref().machine.devices.flashes[flashno].is_none() {
        ctx.verhogen(mutex);
        return dev::STATUS_UNINSTALLED;
    }

    let status = ctx.masked(|ctx| {
        let now = ctx.now();
        let d = ctx.sys_mut().machine.devices.flashes[flashno]
            .as_mut()
            .expect("checked above");
        d.set_data0(pa.into_u32());
        let cmd = if write { flash::CMD_WRITEBLK } else { flash::CMD_READBLK };
        d.write_command((block << flash::BLOCK_SHIFT) | cmd, now);
        ctx.wait_io(dev::FLASH_LINE, flashno, false)
    });

    ctx.verhogen(mutex);
    status
}

/// The kernel DMA buffer frame of a disk device.
pub(crate) fn disk_dma_buffer(diskno: usize) -> Pa {
    Pa::new(RAM_BASE + (DISK_DMA_FRAME + diskno as u32) * PAGE_SIZE)
}

/// The kernel DMA buffer frame of a flash device.
pub(crate) fn flash_dma_buffer(flashno: usize) -> Pa {
    Pa::new(RAM_BASE + (FLASH_DMA_FRAME + flashno as u32) * PAGE_SIZE)
}

/// The whole page starting at `va` must lie inside KUSEG.
fn validate_user_page(va: Va) -> Result<(), Trap> {
    if va.in_kuseg() && (va + (PAGE_SIZE - 1)).in_kuseg() {
        Ok(())
    } else {
        Err(Trap::BadAddress)
    }
}

fn copy_user_to_buffer(ctx: &mut KernelCtx<'_>, va: Va, pa: Pa) -> Result<(), Trap> {
    for i in 0..PAGE_SIZE {
        let b = vm::read_user_byte(ctx, va + i)?;
        ctx.sys_mut()
            .machine
            .ram
            .write_byte(pa + i, b)
            .ok_or(Trap::BadAddress)?;
    }
    Ok(())
}

fn copy_buffer_to_user(ctx: &mut KernelCtx<'_>, pa: Pa, va: Va) -> Result<(), Trap> {
    for i in 0..PAGE_SIZE {
        let b = ctx
            .sys_ref()
            .machine
            .ram
            .read_byte(pa + i)
            .ok_or(Trap::BadAddress)?;
        vm::write_user_byte(ctx, va + i, b)?;
    }
    Ok(())
}

fn disk_args(ctx: &KernelCtx<'_>, sup: SupRef) -> (Va, usize, u32) {
    let state = &ctx.sys_ref().support.pool.get(sup).except_state[ExcSlot::General as usize];
    (Va::new(state.a1()), state.a2() as usize, state.a3())
}

/// Total sectors of a disk; rejects disk 0 (the backing store) and anything
/// uninstalled or out of family.
fn user_disk_capacity(ctx: &KernelCtx<'_>, diskno: usize) -> Result<u32, Trap> {
    if diskno == 0 || diskno >= dev::DEV_PER_LINE {
        return Err(Trap::BadDevice);
    }
    ctx.sys_ref().machine.devices.disks[diskno]
        .as_ref()
        .map(|d| d.capacity_sectors())
        .ok_or(Trap::BadDevice)
}

/// Block count of a flash device; blocks below 32 are the boot-image region
/// and stay out of reach.
fn user_flash_range(ctx: &KernelCtx<'_>, flashno: usize, block: u32) -> Result<(), Trap> {
    if flashno >= dev::DEV_PER_LINE {
        return Err(Trap::BadDevice);
    }
    let max = ctx.sys_ref().machine.devices.flashes[flashno]
        .as_ref()
        .map(|d| d.data1())
        .ok_or(Trap::BadDevice)?;
    if (MAXPAGES as u32..max).contains(&block) {
        Ok(())
    } else {
        Err(Trap::BadBlock)
    }
}

fn finish(ctx: &mut KernelCtx<'_>, sup: SupRef, status: u32) {
    let v0 = if status == STATUS_READY {
        1
    } else {
        (status as i32).wrapping_neg() as u32
    };
    ctx.sys_mut().support.pool.get_mut(sup).except_state[ExcSlot::General as usize].set_v0(v0);
    ctx.resume_from(sup, ExcSlot::General);
}

/// SYS14: write one page of the caller's space to a disk sector.
pub(crate) fn sys_disk_write(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, diskno, sector) = disk_args(ctx, sup);
    validate_user_page(va)?;
    let capacity = user_disk_capacity(ctx, diskno)?;
    if sector >= capacity {
        return Err(Trap::BadSector);
    }

    let buffer = disk_dma_buffer(diskno);
    copy_user_to_buffer(ctx, va, buffer)?;
    let status = disk_operation(ctx, diskno, sector, buffer, true);
    finish(ctx, sup, status);
    Ok(())
}

/// SYS15: read one disk sector into a page of the caller's space.
pub(crate) fn sys_disk_read(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, diskno, sector) = disk_args(ctx, sup);
    validate_user_page(va)?;
    let capacity = user_disk_capacity(ctx, diskno)?;
    if sector >= capacity {
        return Err(Trap::BadSector);
    }

    let buffer = disk_dma_buffer(diskno);
    let status = disk_operation(ctx, diskno, sector, buffer, false);
    if status == STATUS_READY {
        copy_buffer_to_user(ctx, buffer, va)?;
    }
    finish(ctx, sup, status);
    Ok(())
}

/// SYS16: write one page of the caller's space to a flash block.
pub(crate) fn sys_flash_write(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, flashno, block) = disk_args(ctx, sup);
    validate_user_page(va)?;
    user_flash_range(ctx, flashno, block)?;

    let buffer = flash_dma_buffer(flashno);
    copy_user_to_buffer(ctx, va, buffer)?;
    let status = flash_operation(ctx, flashno, block, buffer, true);
    finish(ctx, sup, status);
    Ok(())
}

/// SYS17: read one flash block into a page of the caller's space.
pub(crate) fn sys_flash_read(ctx: &mut KernelCtx<'_>, sup: SupRef) -> Result<(), Trap> {
    let (va, flashno, block) = disk_args(ctx, sup);
    validate_user_page(va)?;
    user_flash_range(ctx, flashno, block)?;

    let buffer = flash_dma_buffer(flashno);
    let status = flash_operation(ctx, flashno, block, buffer, false);
    if status == STATUS_READY {
        copy_buffer_to_user(ctx, buffer, va)?;
    }
    finish(ctx, sup, status);
    Ok(())
}
