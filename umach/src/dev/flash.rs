//! Flash block device.
//!
//! A flat run of blocks; DATA1 reports the block count. The COMMAND word
//! packs the block number above the command code, DATA0 holds the DMA frame
//! address.

use super::{CMD_ACK, CMD_RESET, Pending, STATUS_BUSY, STATUS_ERROR, STATUS_ILLEGAL, STATUS_READY};
use crate::addressing::PAGE_SIZE;
use crate::mem::Ram;

/// COMMAND: read the block in bits 8.. into the DATA0 frame.
pub const CMD_READBLK: u32 = 2;
/// COMMAND: write the DATA0 frame to the block in bits 8..
pub const CMD_WRITEBLK: u32 = 3;

/// Bit position of the block number in a command word.
pub const BLOCK_SHIFT: u32 = 8;

const XFER_US: u64 = 300;

#[derive(Clone, Copy, Debug)]
enum Op {
    Read { block: u32 },
    Write { block: u32 },
}

/// One flash device.
pub struct Flash {
    data: Vec<u8>,
    status: u32,
    data0: u32,
    pending: Option<Pending<Op>>,
    interrupting: bool,
}

impl Flash {
    /// A blank device with `blocks` erased blocks.
    pub fn new(blocks: u32) -> Self {
        Self {
            data: vec![0; (blocks * PAGE_SIZE) as usize],
            status: STATUS_READY,
            data0: 0,
            pending: None,
            interrupting: false,
        }
    }

    /// A device preloaded with an image in its first blocks.
    pub fn with_image(blocks: u32, image: &[u8]) -> Self {
        let mut flash = Self::new(blocks);
        assert!(
            image.len() <= flash.data.len(),
            "image does not fit on the flash device"
        );
        flash.data[..image.len()].copy_from_slice(image);
        flash
    }

    /// Block count as reported in DATA1.
    pub fn data1(&self) -> u32 {
        self.data.len() as u32 / PAGE_SIZE
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
            CMD_READBLK => self.begin(Op::Read { block: cmd >> BLOCK_SHIFT }, now),
            CMD_WRITEBLK => self.begin(Op::Write { block: cmd >> BLOCK_SHIFT }, now),
            _ => {
                self.status = STATUS_ILLEGAL;
                self.interrupting = true;
            }
        }
    }

    fn begin(&mut self, op: Op, now: u64) {
        self.status = STATUS_BUSY;
        self.pending = Some(Pending { done_at: now + XFER_US, op });
    }

    /// When the in-flight command completes, if any.
    pub fn due_at(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.done_at)
    }

    fn block_range(&self, block: u32) -> Option<usize> {
        (block < self.data1()).then(|| (block * PAGE_SIZE) as usize)
    }

    /// Complete a due command.
    pub fn pump(&mut self, now: u64, ram: &mut Ram) {
        let Some(p) = self.pending else { return };
        if now < p.done_at {
            return;
        }
        self.pending = None;
        self.status = match p.op {
            Op::Read { block } => match self.block_range(block) {
                Some(at) => {
                    let blk: [u8; PAGE_SIZE as usize] =
                        self.data[at..at + PAGE_SIZE as usize].try_into().unwrap();
                    match super::dma_write_page(ram, self.data0, &blk) {
                        Some(()) => STATUS_READY,
                        None => STATUS_ERROR,
                    }
                }
                None => STATUS_ERROR,
            },
            Op::Write { block } => match self.block_range(block) {
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

    /// Direct block view, for test assertions.
    pub fn block(&self, index: u32) -> Option<&[u8]> {
        let at = (index * PAGE_SIZE) as usize;
        self.data.get(at..at + PAGE_SIZE as usize)
    }
}
