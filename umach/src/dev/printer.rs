//! Printer device: one character per command, out of DATA0.

use super::{CMD_ACK, CMD_RESET, STATUS_BUSY, STATUS_ILLEGAL, STATUS_READY};

/// COMMAND: print the character in DATA0.
pub const CMD_PRINTCHR: u32 = 2;

const CHAR_US: u64 = 50;

/// One printer device.
pub struct Printer {
    status: u32,
    data0: u32,
    pending: Option<u64>,
    interrupting: bool,
    /// Everything printed so far.
    pub output: Vec<u8>,
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

impl Printer {
    /// A fresh printer.
    pub fn new() -> Self {
        Self {
            status: STATUS_READY,
            data0: 0,
            pending: None,
            interrupting: false,
            output: Vec::new(),
        }
    }

    /// The STATUS register.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Whether the device holds an unacknowledged completion.
    pub fn interrupting(&self) -> bool {
        self.interrupting
    }

    /// Stage the character to print.
    pub fn set_data0(&mut self, ch: u32) {
        self.data0 = ch;
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
            CMD_PRINTCHR => {
                self.status = STATUS_BUSY;
                self.pending = Some(now + CHAR_US);
            }
            _ => {
                self.status = STATUS_ILLEGAL;
                self.interrupting = true;
            }
        }
    }

    /// When the in-flight command completes, if any.
    pub fn due_at(&self) -> Option<u64> {
        self.pending
    }

    /// Complete a due command.
    pub fn pump(&mut self, now: u64) {
        if matches!(self.pending, Some(t) if now >= t) {
            self.pending = None;
            self.output.push(self.data0 as u8);
            self.status = STATUS_READY;
            self.interrupting = true;
        }
    }
}
