//! Terminal device: two independent sub-devices behind one device number.
//!
//! The transmitter takes `TRANSMITCHAR | (byte << 8)` and completes with
//! `CHAR_DONE | (byte << 8)`; the receiver takes `RECEIVECHAR` and completes
//! with `CHAR_DONE | (byte << 8)` once a byte is available on its input
//! queue. Each sub-device holds its completion status until acknowledged.
//! Idle is Ready, in-flight is Busy; only other codes are completions.

use super::{CMD_ACK, CMD_RESET, STATUS_BUSY, STATUS_CHAR_DONE, STATUS_ILLEGAL, STATUS_READY};
use std::collections::VecDeque;

/// COMMAND: transmit the character in bits 8..=15.
pub const CMD_TRANSMITCHAR: u32 = 2;
/// COMMAND: receive one character.
pub const CMD_RECEIVECHAR: u32 = 2;

/// Bit position of the character in command and status words.
pub const CHAR_SHIFT: u32 = 8;

/// Mask of the status code within a sub-device status word.
pub const STATUS_MASK: u32 = 0xFF;

const CHAR_US: u64 = 50;

#[derive(Clone, Copy, Debug)]
enum Recv {
    /// Command accepted, waiting for a byte to arrive.
    AwaitingInput,
    /// Byte in hand, completing at the given instant.
    Completing { done_at: u64, ch: u8 },
}

/// One terminal device.
pub struct Terminal {
    transm_status: u32,
    recv_status: u32,
    transm_pending: Option<(u64, u8)>,
    recv_pending: Option<Recv>,
    transm_interrupting: bool,
    recv_interrupting: bool,
    input: VecDeque<u8>,
    /// Everything transmitted so far.
    pub output: Vec<u8>,
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal {
    /// A fresh terminal with an empty input queue.
    pub fn new() -> Self {
        Self {
            transm_status: STATUS_READY,
            recv_status: STATUS_READY,
            transm_pending: None,
            recv_pending: None,
            transm_interrupting: false,
            recv_interrupting: false,
            input: VecDeque::new(),
            output: Vec::new(),
        }
    }

    /// The TRANSM_STATUS register.
    pub fn transm_status(&self) -> u32 {
        self.transm_status
    }

    /// The RECV_STATUS register.
    pub fn recv_status(&self) -> u32 {
        self.recv_status
    }

    /// Whether either sub-device holds an unacknowledged completion.
    pub fn interrupting(&self) -> bool {
        self.transm_interrupting || self.recv_interrupting
    }

    /// Whether the transmitter holds an unacknowledged completion.
    pub fn transm_interrupting(&self) -> bool {
        self.transm_interrupting
    }

    /// Whether the receiver holds an unacknowledged completion.
    pub fn recv_interrupting(&self) -> bool {
        self.recv_interrupting
    }

    /// Queue bytes on the receiver's input (a script, or loopback traffic).
    pub fn push_input(&mut self, bytes: &[u8], now: u64) {
        self.input.extend(bytes.iter().copied());
        if matches!(self.recv_pending, Some(Recv::AwaitingInput)) {
            if let Some(ch) = self.input.pop_front() {
                self.recv_pending = Some(Recv::Completing { done_at: now + CHAR_US, ch });
            }
        }
    }

    /// Write the TRANSM_COMMAND register.
    pub fn write_transm_command(&mut self, cmd: u32, now: u64) {
        match cmd & STATUS_MASK {
            CMD_ACK => {
                self.transm_interrupting = false;
                if self.transm_pending.is_none() {
                    self.transm_status = STATUS_READY;
                }
            }
            CMD_RESET => {
                self.transm_pending = None;
                self.transm_interrupting = false;
                self.transm_status = STATUS_READY;
            }
            CMD_TRANSMITCHAR => {
                self.transm_status = STATUS_BUSY;
                self.transm_pending = Some((now + CHAR_US, (cmd >> CHAR_SHIFT) as u8));
            }
            _ => {
                self.transm_status = STATUS_ILLEGAL;
                self.transm_interrupting = true;
            }
        }
    }

    /// Write the RECV_COMMAND register.
    pub fn write_recv_command(&mut self, cmd: u32, now: u64) {
        match cmd & STATUS_MASK {
            CMD_ACK => {
                self.recv_interrupting = false;
                if self.recv_pending.is_none() {
                    self.recv_status = STATUS_READY;
                }
            }
            CMD_RESET => {
                self.recv_pending = None;
                self.recv_interrupting = false;
                self.recv_status = STATUS_READY;
            }
            CMD_RECEIVECHAR => {
                self.recv_status = STATUS_BUSY;
                self.recv_pending = Some(match self.input.pop_front() {
                    Some(ch) => Recv::Completing { done_at: now + CHAR_US, ch },
                    None => Recv::AwaitingInput,
                });
            }
            _ => {
                self.recv_status = STATUS_ILLEGAL;
                self.recv_interrupting = true;
            }
        }
    }

    /// When either in-flight command completes, if known.
    pub fn due_at(&self) -> Option<u64> {
        let t = self.transm_pending.map(|(t, _)| t);
        let r = match self.recv_pending {
            Some(Recv::Completing { done_at, .. }) => Some(done_at),
            _ => None,
        };
        match (t, r) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Complete due commands; returns a transmitted byte for loopback wiring.
    pub fn pump(&mut self, now: u64) -> Option<u8> {
        let mut sent = None;
        if let Some((t, ch)) = self.transm_pending {
            if now >= t {
                self.transm_pending = None;
                self.output.push(ch);
                self.transm_status = STATUS_CHAR_DONE | ((ch as u32) << CHAR_SHIFT);
                self.transm_interrupting = true;
                sent = Some(ch);
            }
        }
        if let Some(Recv::Completing { done_at, ch }) = self.recv_pending {
            if now >= done_at {
                self.recv_pending = None;
                self.recv_status = STATUS_CHAR_DONE | ((ch as u32) << CHAR_SHIFT);
                self.recv_interrupting = true;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_completes_and_holds_until_ack() {
        let mut t = Terminal::new();
        t.write_transm_command(CMD_TRANSMITCHAR | (b'x' as u32) << CHAR_SHIFT, 0);
        assert_eq!(t.transm_status() & STATUS_MASK, STATUS_BUSY);
        t.pump(CHAR_US);
        assert_eq!(t.transm_status() & STATUS_MASK, STATUS_CHAR_DONE);
        assert_eq!((t.transm_status() >> CHAR_SHIFT) as u8, b'x');
        assert!(t.interrupting());
        t.write_transm_command(CMD_ACK, CHAR_US);
        assert_eq!(t.transm_status(), STATUS_READY);
        assert!(!t.interrupting());
        assert_eq!(t.output, b"x");
    }

    #[test]
    fn receive_waits_for_input() {
        let mut t = Terminal::new();
        t.write_recv_command(CMD_RECEIVECHAR, 0);
        assert_eq!(t.due_at(), None);
        assert_eq!(t.recv_status() & STATUS_MASK, STATUS_BUSY);
        t.push_input(b"hi", 10);
        let done = t.due_at().expect("completion scheduled");
        t.pump(done);
        assert_eq!(t.recv_status() & STATUS_MASK, STATUS_CHAR_DONE);
        assert_eq!((t.recv_status() >> CHAR_SHIFT) as u8, b'h');
    }
}
