//! Seekable block device.
//!
//! DATA1 reports the geometry as `(cylinders << 16) | (heads << 8) | sectors`.
//! A transfer is a SEEKCYL to position the arm followed by READBLK/WRITEBLK
//! naming the head and sector; DATA0 holds the DMA frame address. Sector
//! numbering is linear: `((cyl * heads) + head) * sectors + sector`.

use super::{CMD_ACK, CMD_RESET, Pending, STATUS_BUSY, STATUS_ERROR, STATUS_ILLEGAL, STATUS_READY};
use crate::addressing::PAGE_SIZE;
use crate::mem::Ram;

/// COMMAND: seek to the cylinder in bits 8 and up.
pub const CMD_SEEKCYL: u32 = 2;
/// COMMAND: read the block at (head, sector) into the DATA0 frame.
pub const CMD_READBLK: u32 = 3;
/// COMMAND: write the DATA0 frame to the block at (head, sector).
pub const CMD_WRITEBLK: u32 = 4;

/// Bit position of the cylinder in a seek command.
pub const CYL_SHIFT: u32 = 8;
/// Bit position of the head in a transfer command.
pub const HEAD_SHIFT: u32 = 16;
/// Bit position of the sector in a transfer command.
pub const SECT_SHIFT: u32 = 8;

const SEEK_US: u64 = 100;
const XFER_US: u64 = 400;

#[derive(Clone, Copy, Debug)]
enum Op {
    Seek { cyl: u32 },
    Read { head: u32, sect: u32 },
    Write { head: u32, sect: u32 },
}

/// One disk device.
pub struct Disk {
    cylinders: u32,
    heads: u32,
    sectors: u32,
    data: Vec<u8>,
    arm_cyl: u32,
    status: u32,
    data0: u32,
    pending: Option<Pending<Op>>,
    interrupting: bool,
}

impl Disk {
    /// A blank disk with the given geometry.
    pub fn new(cylinders: u32, heads: u32, sectors: u32) -> Self {
        let capacity = (cylinders * heads * sectors * PAGE_SIZE) as usize;
        Self {
            cylinders,
            heads,
            sectors,
            data: vec![0; capacity],
            arm_cyl: 0,
            status: STATUS_READY,
            data0: 0,
            pending: None,
            interrupting: false,
        }
    }

    /// Geometry word as reported in DATA1.
    pub fn data1(&self) -> u32 {
        (self.cylinders << 16) | (self.heads << 8) | self.sectors
    }

    /// Total sectors on the device.
    pub fn capacity_sectors(&self) -> u32 {
        self.cylinders * self.heads * self.sectors
    }

    /// The STATUS register.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Whether the device holds an unacknowledged completion.
    pub fn interrupting(&self) -> bool {
        self.interrupting
    }

    /// Set the DMA frame address.
    pub fn set_data0(&mut self, addr: u32) {
        self.data0 = addr;
    }

    /// Write the COMMAND register.
    pub fn write_command(&mut self, cmd: u32, now: u64) {
        match cmd & 0xFF {
            CMD_ACK => {
                self.interrupting = false;
                if self.pending.is_none() {
                    self.status = STATUS_READY;
                }
            }
            CMD_RESET => {
                self.pending = None;
                self.interrupting = false;
                self.status = STATUS_READY;
            }
            CMD_SEEKCYL => {
                self.begin(Op::Seek { cyl: cmd >> CYL_SHIFT }, now, SEEK_US);
            }
            CMD_READBLK => {
                self.begin(
                    Op::Read {
                        head: cmd >> HEAD_SHIFT,
                        sect: (cmd >> SECT_SHIFT) & 0xFF,
                    },
                    now,
                    XFER_US,
                );
            }
            CMD_WRITEBLK => {
                self.begin(
                    Op::Write {
                        head: cmd >> HEAD_SHIFT,
                        sect: (cmd >> SECT_SHIFT) & 0xFF,
                    },
                    now,
                    XFER_US,
                );
            }
            _ => {
                self.status = STATUS_ILLEGAL;
                self.interrupting = true;
            }
        }
    }

    fn begin(&mut self, op: Op, now: u64, latency: u64) {
        self.status = STATUS_BUSY;
        self.pending = Some(Pending { done_at: now + latency, op });
    }

    /// When the in-flight command completes, if any.
    pub fn due_at(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.done_at)
    }

    fn block_range(&self, head: u32, sect: u32) -> Option<usize> {
        if head >= self.heads || sect >= self.sectors || self.arm_cyl >= self.cylinders {
            return None;
        }
        let index = ((self.arm_cyl * self.heads) + head) * self.sectors + sect;
        Some((index * PAGE_SIZE) as usize)
    }

    /// Complete a due command: perform the transfer and raise the interrupt.
    pub fn pump(&mut self, now: u64, ram: &mut Ram) {
        let Some(p) = self.pending else { return };
        if now < p.done_at {
            return;
        }
        self.pending = None;
        self.status = match p.op {
            Op::Seek { cyl } => {
                if cyl < self.cylinders {
                    self.arm_cyl = cyl;
                    STATUS_READY
                } else {
                    STATUS_ERROR
                }
            }
            Op::Read { head, sect } => match self.block_range(head, sect) {
                Some(at) => {
                    let block: [u8; PAGE_SIZE as usize] =
                        self.data[at..at + PAGE_SIZE as usize].try_into().unwrap();
                    match super::dma_write_page(ram, self.data0, &block) {
                        Some(()) => STATUS_READY,
                        None => STATUS_ERROR,
                    }
                }
                None => STATUS_ERROR,
            },
            Op::Write { head, sect } => match self.block_range(head, sect) {
                Some(at) => match super::dma_read_page(ram, self.data0) {
                    Some(buf) => {
                        self.data[at..at + PAGE_SIZE as usize].copy_from_slice(&buf);
                        STATUS_READY
                    }
                    None => STATUS_ERROR,
                },
                None => STATUS_ERROR,
            },
        };
        self.interrupting = true;
    }

    /// Direct sector view, for test assertions.
    pub fn sector(&self, index: u32) -> Option<&[u8]> {
        let at = (index * PAGE_SIZE) as usize;
        self.data.get(at..at + PAGE_SIZE as usize)
    }
}
