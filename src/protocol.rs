// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Host/DSP message protocol.
//!
//! Messages are three 32-bit words. The command word carries the command in
//! its upper bits and, for per-port commands, the port id in its low byte.
//! Buffer transfers point the coprocessor at a [`CommRecord`] stored in
//! coprocessor-visible memory; the record layout is fixed and its byte order
//! is chosen per deployment with [`Endian`].

use std::fmt;

/// Start processing.
pub const CMD_PLAY: u32 = 0x0100;
/// Stop processing; acknowledged with the same command.
pub const CMD_STOP: u32 = 0x0200;
/// Algorithm control buffer; acknowledged with the same command.
pub const CMD_ALG_CTRL: u32 = 0x0400;
/// Flush a port; acknowledged with the same command.
pub const CMD_FLUSH: u32 = 0x0500;
/// Buffer ready (host to DSP) or buffer done (DSP to host).
pub const CMD_BUFFER: u32 = 0x0600;
/// Asynchronous event or error report.
pub const CMD_EVENT: u32 = 0x0e00;

/// First argument of a flush request: discard every queued buffer.
pub const FLUSH_ALL: u32 = 5;

/// Number of 32-bit words in a [`CommRecord`].
pub const RECORD_WORDS: usize = 17;
/// Size in bytes of an encoded [`CommRecord`].
pub const RECORD_SIZE: usize = RECORD_WORDS * 4;
/// Number of reserved words between `valid_length` and `back_reference`.
pub const RESERVED_WORDS: usize = 10;

/// Coprocessor-side address.
pub type DeviceAddr = u32;

/// Byte order of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    fn put(self, word: u32, out: &mut [u8]) {
        let bytes = match self {
            Endian::Little => word.to_le_bytes(),
            Endian::Big => word.to_be_bytes(),
        };
        out.copy_from_slice(&bytes);
    }

    fn get(self, bytes: &[u8]) -> u32 {
        let word = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Endian::Little => u32::from_le_bytes(word),
            Endian::Big => u32::from_be_bytes(word),
        }
    }
}

/// Decoded command class of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Stop,
    AlgCtrl,
    Flush,
    Buffer,
    Event,
    Unknown(u32),
}

impl From<u32> for Command {
    fn from(cmd: u32) -> Self {
        match cmd & 0xffff_ff00 {
            CMD_PLAY => Command::Play,
            CMD_STOP => Command::Stop,
            CMD_ALG_CTRL => Command::AlgCtrl,
            CMD_FLUSH => Command::Flush,
            CMD_BUFFER => Command::Buffer,
            CMD_EVENT => Command::Event,
            other => Command::Unknown(other),
        }
    }
}

/// A message exchanged with the coprocessor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub cmd: u32,
    pub arg_1: u32,
    pub arg_2: u32,
}

impl Message {
    pub const fn new(cmd: u32, arg_1: u32, arg_2: u32) -> Self {
        Self { cmd, arg_1, arg_2 }
    }

    pub const fn play() -> Self {
        Self::new(CMD_PLAY, 0, 0)
    }

    pub const fn stop() -> Self {
        Self::new(CMD_STOP, 0, 0)
    }

    pub const fn flush(port: u8) -> Self {
        Self::new(CMD_FLUSH | port as u32, FLUSH_ALL, 0)
    }

    /// Buffer ready for `port`, described by the comm record at `record`.
    pub const fn buffer(port: u8, record: DeviceAddr) -> Self {
        Self::new(CMD_BUFFER | port as u32, record, 0)
    }

    pub const fn alg_ctrl(control: DeviceAddr, size: u32) -> Self {
        Self::new(CMD_ALG_CTRL, control, size)
    }

    pub const fn event(arg_1: u32, arg_2: u32) -> Self {
        Self::new(CMD_EVENT, arg_1, arg_2)
    }

    pub fn command(&self) -> Command {
        Command::from(self.cmd)
    }

    /// Port id carried in the low byte of the command word.
    pub const fn port(&self) -> u8 {
        (self.cmd & 0xff) as u8
    }

    /// The coprocessor reports end of playback as an event, not an error.
    pub const fn is_playback_completed(&self) -> bool {
        self.cmd & 0xffff_ff00 == CMD_EVENT && self.arg_1 == 1 && self.arg_2 == CMD_FLUSH
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd={:#06x} arg1={:#x} arg2={:#x}",
            self.cmd, self.arg_1, self.arg_2
        )
    }
}

/// Transfer descriptor shared with the coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommRecord {
    pub buffer_address: DeviceAddr,
    pub buffer_size: u32,
    pub param_address: DeviceAddr,
    pub param_size: u32,
    pub valid_length: u32,
    pub reserved: [u32; RESERVED_WORDS],
    pub back_reference: u32,
    pub stream_id: u32,
}

impl CommRecord {
    fn words(&self) -> [u32; RECORD_WORDS] {
        let mut words = [0u32; RECORD_WORDS];
        words[0] = self.buffer_address;
        words[1] = self.buffer_size;
        words[2] = self.param_address;
        words[3] = self.param_size;
        words[4] = self.valid_length;
        words[5..5 + RESERVED_WORDS].copy_from_slice(&self.reserved);
        words[15] = self.back_reference;
        words[16] = self.stream_id;
        words
    }

    /// Writes the record into the first [`RECORD_SIZE`] bytes of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`RECORD_SIZE`].
    pub fn encode(&self, endian: Endian, out: &mut [u8]) {
        assert!(
            out.len() >= RECORD_SIZE,
            "comm slot of {} bytes cannot hold a record",
            out.len()
        );
        for (word, chunk) in self.words().iter().zip(out.chunks_exact_mut(4)) {
            endian.put(*word, chunk);
        }
    }

    /// Reads a record from the first [`RECORD_SIZE`] bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`RECORD_SIZE`].
    pub fn decode(endian: Endian, bytes: &[u8]) -> Self {
        assert!(
            bytes.len() >= RECORD_SIZE,
            "comm slot of {} bytes cannot hold a record",
            bytes.len()
        );
        let mut words = [0u32; RECORD_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = endian.get(chunk);
        }
        let mut reserved = [0u32; RESERVED_WORDS];
        reserved.copy_from_slice(&words[5..5 + RESERVED_WORDS]);
        Self {
            buffer_address: words[0],
            buffer_size: words[1],
            param_address: words[2],
            param_size: words[3],
            valid_length: words[4],
            reserved,
            back_reference: words[15],
            stream_id: words[16],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_splits_port() {
        let msg = Message::buffer(1, 0x2000_1000);
        assert_eq!(msg.command(), Command::Buffer);
        assert_eq!(msg.port(), 1);
        assert_eq!(msg.cmd, 0x0601);

        let msg = Message::flush(0);
        assert_eq!(msg.command(), Command::Flush);
        assert_eq!(msg.arg_1, FLUSH_ALL);

        assert_eq!(Message::new(0x0e00, 0, 0).command(), Command::Event);
        assert_eq!(Message::new(0x0900, 0, 0).command(), Command::Unknown(0x0900));
    }

    #[test]
    fn playback_completed_is_not_an_error() {
        assert!(Message::event(1, 0x0500).is_playback_completed());
        assert!(!Message::event(2, 0x0500).is_playback_completed());
        assert!(!Message::new(CMD_STOP, 1, 0x0500).is_playback_completed());
    }

    #[test]
    fn record_layout_is_fixed() {
        let record = CommRecord {
            buffer_address: 0x1122_3344,
            buffer_size: 4096,
            valid_length: 100,
            back_reference: 0x0001_0002,
            stream_id: 1,
            ..Default::default()
        };

        let mut le = [0u8; RECORD_SIZE];
        record.encode(Endian::Little, &mut le);
        assert_eq!(&le[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&le[64..68], &[1, 0, 0, 0]);

        let mut be = [0u8; RECORD_SIZE];
        record.encode(Endian::Big, &mut be);
        assert_eq!(&be[0..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&be[60..64], &[0, 1, 0, 2]);

        assert_eq!(CommRecord::decode(Endian::Big, &be), record);
        assert_ne!(CommRecord::decode(Endian::Little, &be), record);
    }

    #[test]
    #[should_panic(expected = "cannot hold a record")]
    fn short_slot_is_rejected() {
        let mut out = [0u8; RECORD_SIZE - 4];
        CommRecord::default().encode(Endian::Little, &mut out);
    }
}
