// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GM3 frame envelope.
//!
//! On the wire a frame is
//!
//! ```text
//! [0x68][LEN_LO][LEN_HI][DEST_LO][DEST_HI][SRC_LO][SRC_HI][CMD]
//! [payload ...][CRC_HI][CRC_LO][0x16]
//! ```
//!
//! `LEN` is little-endian and covers the payload plus two (hardware
//! captures pin this down; see the fixtures below), so a complete frame
//! occupies `LEN + 9` bytes. Addresses are 16-bit little-endian, the
//! source address included; early protocol notes wrongly split that
//! into one address byte plus a reserved byte. The CRC runs from
//! `LEN_LO` through the last payload byte and is stored big-endian.
//!
//! SERVICE frames carry CMD = 0x68, the same value as the begin marker,
//! so a scanner must never resynchronize on 0x68 alone; [`scan_prefix`]
//! only accepts a candidate once length, end marker, and CRC all check
//! out.

use crate::crc::crc16;

pub const FRAME_BEGIN: u8 = 0x68;
pub const FRAME_END: u8 = 0x16;

/// Envelope bytes around the payload: begin, LEN, DEST, SRC, CMD, CRC,
/// end.
pub const FRAME_OVERHEAD: usize = 11;

/// Smallest well-formed frame: empty payload.
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD;

/// Upper bound on payload size we are willing to buffer. The largest
/// legitimate frames are paged struct responses, well under 4 KiB.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// A parsed wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub dest: u16,
    pub src: u16,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    FrameTooShort,
    BadMarker,
    LengthMismatch,
    BadCrc,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::FrameTooShort => "frame too short",
            Self::BadMarker => "bad begin/end marker",
            Self::LengthMismatch => "declared length does not match",
            Self::BadCrc => "CRC mismatch",
        };
        f.write_str(msg)
    }
}

/// Result of examining the head of a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A valid frame occupies the first `usize` bytes of the buffer.
    Frame(Frame, usize),
    /// The buffer head cannot begin a frame; discard one byte and
    /// rescan.
    Garbage(FrameError),
    /// A frame may still be forming; read more bytes first.
    Incomplete,
}

impl Frame {
    pub fn new(dest: u16, src: u16, cmd: u8, payload: &[u8]) -> Self {
        Self {
            dest,
            src,
            cmd,
            payload: payload.to_vec(),
        }
    }

    /// Serializes the frame, computing LEN and CRC.
    pub fn encode(&self) -> Vec<u8> {
        let len = (self.payload.len() + 2) as u16;
        let mut out = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        out.push(FRAME_BEGIN);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.dest.to_le_bytes());
        out.extend_from_slice(&self.src.to_le_bytes());
        out.push(self.cmd);
        out.extend_from_slice(&self.payload);
        let crc = crc16(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out.push(FRAME_END);
        out
    }

    /// Parses `buf` as exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(FrameError::FrameTooShort);
        }
        if buf[0] != FRAME_BEGIN || buf[buf.len() - 1] != FRAME_END {
            return Err(FrameError::BadMarker);
        }
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        if len < 2 || len + 9 != buf.len() {
            return Err(FrameError::LengthMismatch);
        }
        let crc_at = buf.len() - 3;
        let expect = u16::from_be_bytes([buf[crc_at], buf[crc_at + 1]]);
        if crc16(&buf[1..crc_at]) != expect {
            return Err(FrameError::BadCrc);
        }
        Ok(Self {
            dest: u16::from_le_bytes([buf[3], buf[4]]),
            src: u16::from_le_bytes([buf[5], buf[6]]),
            cmd: buf[7],
            payload: buf[8..crc_at].to_vec(),
        })
    }
}

/// Examines the head of a rolling receive buffer for a frame.
///
/// A candidate is only accepted once the begin marker, a plausible
/// length, the end marker, and the CRC all validate; anything less and
/// the caller discards a single byte and rescans. Never consumes bytes
/// beyond a complete, valid frame, so a token grant sitting behind an
/// IDENTIFY in the same read chunk survives intact.
pub fn scan_prefix(buf: &[u8]) -> ScanOutcome {
    if buf.is_empty() {
        return ScanOutcome::Incomplete;
    }
    if buf[0] != FRAME_BEGIN {
        return ScanOutcome::Garbage(FrameError::BadMarker);
    }
    if buf.len() < 3 {
        return ScanOutcome::Incomplete;
    }
    let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if len < 2 || len - 2 > MAX_PAYLOAD_LEN {
        return ScanOutcome::Garbage(FrameError::LengthMismatch);
    }
    let total = len + 9;
    if buf.len() < total {
        return ScanOutcome::Incomplete;
    }
    match Frame::decode(&buf[..total]) {
        Ok(frame) => ScanOutcome::Frame(frame, total),
        Err(e) => ScanOutcome::Garbage(e),
    }
}
