//! The five peripheral device classes and their interrupt lines.
//!
//! Each device exposes the register protocol the kernel drives: a STATUS
//! field, a COMMAND field, and DATA0/DATA1 where the class uses them.
//! Commands take a fixed emulated latency; on completion the device parks its
//! completion status, raises its bit in the line's interrupting-device bitmap,
//! and holds both until the kernel writes ACK. Terminals are two independent
//! sub-devices (transmitter and receiver) sharing one device number.

use crate::addressing::Pa;
use crate::mem::Ram;

pub mod disk;
pub mod flash;
pub mod printer;
pub mod terminal;

pub use disk::Disk;
pub use flash::Flash;
pub use printer::Printer;
pub use terminal::Terminal;

/// Interrupt line of the disk class.
pub const DISK_LINE: u32 = 3;
/// Interrupt line of the flash class.
pub const FLASH_LINE: u32 = 4;
/// Interrupt line of the network class (no devices installed).
pub const NETWORK_LINE: u32 = 5;
/// Interrupt line of the printer class.
pub const PRINTER_LINE: u32 = 6;
/// Interrupt line of the terminal class.
pub const TERMINAL_LINE: u32 = 7;

/// Devices per interrupt line.
pub const DEV_PER_LINE: usize = 8;

/// STATUS: no device behind this register block.
pub const STATUS_UNINSTALLED: u32 = 0;
/// STATUS: idle and ready for a command.
pub const STATUS_READY: u32 = 1;
/// STATUS: the last command code was not recognized.
pub const STATUS_ILLEGAL: u32 = 2;
/// STATUS: command in flight.
pub const STATUS_BUSY: u32 = 3;
/// STATUS: the last command failed.
pub const STATUS_ERROR: u32 = 4;
/// Terminal sub-device STATUS: character transmitted / received.
pub const STATUS_CHAR_DONE: u32 = 5;

/// COMMAND: reset the device to ready.
pub const CMD_RESET: u32 = 0;
/// COMMAND: acknowledge an interrupt.
pub const CMD_ACK: u32 = 1;

/// Everything hanging off the bus.
pub struct Devices {
    /// Disk devices by device number; `None` is uninstalled.
    pub disks: Vec<Option<Disk>>,
    /// Flash devices by device number.
    pub flashes: Vec<Option<Flash>>,
    /// Printer devices by device number.
    pub printers: Vec<Option<Printer>>,
    /// Terminal devices by device number.
    pub terminals: Vec<Option<Terminal>>,
    /// Null-modem wiring: transmitter of terminal `i` feeds the receiver of
    /// `term_loopback[i]`.
    pub term_loopback: [Option<usize>; DEV_PER_LINE],
}

impl Default for Devices {
    fn default() -> Self {
        Self::new()
    }
}

impl Devices {
    /// A bus with nothing installed.
    pub fn new() -> Self {
        Self {
            disks: (0..DEV_PER_LINE).map(|_| None).collect(),
            flashes: (0..DEV_PER_LINE).map(|_| None).collect(),
            printers: (0..DEV_PER_LINE).map(|_| None).collect(),
            terminals: (0..DEV_PER_LINE).map(|_| None).collect(),
            term_loopback: [None; DEV_PER_LINE],
        }
    }

    /// The interrupting-device bitmap of a line: bit `n` set when device `n`
    /// has an unacknowledged completion.
    pub fn interrupting_devices(&self, line: u32) -> u8 {
        let mut map = 0u8;
        match line {
            DISK_LINE => {
                for (n, d) in self.disks.iter().enumerate() {
                    if matches!(d, Some(d) if d.interrupting()) {
                        map |= 1 << n;
                    }
                }
            }
            FLASH_LINE => {
                for (n, d) in self.flashes.iter().enumerate() {
                    if matches!(d, Some(d) if d.interrupting()) {
                        map |= 1 << n;
                    }
                }
            }
            PRINTER_LINE => {
                for (n, d) in self.printers.iter().enumerate() {
                    if matches!(d, Some(d) if d.interrupting()) {
                        map |= 1 << n;
                    }
                }
            }
            TERMINAL_LINE => {
                for (n, d) in self.terminals.iter().enumerate() {
                    if matches!(d, Some(d) if d.interrupting()) {
                        map |= 1 << n;
                    }
                }
            }
            _ => {}
        }
        map
    }

    /// Bitmap of device lines (3..=7) with at least one interrupting device.
    pub fn pending_lines(&self) -> u32 {
        let mut lines = 0;
        for line in DISK_LINE..=TERMINAL_LINE {
            if self.interrupting_devices(line) != 0 {
                lines |= 1 << line;
            }
        }
        lines
    }

    /// Complete every command whose latency has elapsed, moving DMA data and
    /// feeding loopback-wired terminals.
    pub fn pump(&mut self, now: u64, ram: &mut Ram) {
        for d in self.disks.iter_mut().flatten() {
            d.pump(now, ram);
        }
        for d in self.flashes.iter_mut().flatten() {
            d.pump(now, ram);
        }
        for d in self.printers.iter_mut().flatten() {
            d.pump(now);
        }
        for i in 0..self.terminals.len() {
            let sent = match &mut self.terminals[i] {
                Some(t) => t.pump(now),
                None => None,
            };
            if let (Some(ch), Some(dst)) = (sent, self.term_loopback[i]) {
                if let Some(peer) = self.terminals.get_mut(dst).and_then(Option::as_mut) {
                    peer.push_input(&[ch], now);
                }
            }
        }
    }

    /// The earliest instant any in-flight command completes.
    pub fn next_completion(&self) -> Option<u64> {
        let mut next: Option<u64> = None;
        let mut fold = |t: Option<u64>| {
            if let Some(t) = t {
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        };
        for d in self.disks.iter().flatten() {
            fold(d.due_at());
        }
        for d in self.flashes.iter().flatten() {
            fold(d.due_at());
        }
        for d in self.printers.iter().flatten() {
            fold(d.due_at());
        }
        for d in self.terminals.iter().flatten() {
            fold(d.due_at());
        }
        next
    }
}

/// Shared completion bookkeeping for the single-function device classes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pending<T> {
    pub done_at: u64,
    pub op: T,
}

pub(crate) fn dma_read_page(ram: &Ram, addr: u32) -> Option<[u8; 4096]> {
    let page = ram.page(Pa::new(addr))?;
    let mut buf = [0u8; 4096];
    buf.copy_from_slice(page);
    Some(buf)
}

pub(crate) fn dma_write_page(ram: &mut Ram, addr: u32, data: &[u8]) -> Option<()> {
    ram.page_mut(Pa::new(addr))?.copy_from_slice(data);
    Some(())
}
