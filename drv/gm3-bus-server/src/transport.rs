// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial transport: owns the wire, drains bytes into a rolling buffer,
//! extracts validated frames, and writes frames with the half-duplex
//! turnaround observed.
//!
//! Extraction is conservative: a frame candidate is consumed only once
//! its length, end marker, and CRC all validate, and never more than
//! one frame at a time; a token grant that shares an OS read chunk
//! with the preceding IDENTIFY stays buffered until asked for. The
//! buffer is never flushed.

use std::time::{Duration, Instant};

use drv_gm3_api::{HealthMonitor, LinkStats};
use drv_gm3_proto::frame::{scan_prefix, ScanOutcome};
use drv_gm3_proto::{Command, Frame, FrameError};

use crate::wire::Wire;

/// Bus turnaround: quiet time before every transmission.
pub const TURNAROUND: Duration = Duration::from_millis(20);

/// Upper bound on a single blocking read.
pub const READ_BURST: Duration = Duration::from_millis(200);

/// Read granularity while measuring bus idle.
pub const IDLE_PROBE: Duration = Duration::from_millis(500);

/// Send/await-reply attempts per request.
pub const REQUEST_ATTEMPTS: u32 = 5;

/// Delay between attempts when running without the token.
pub const TOKENLESS_RETRY_DELAY: Duration = Duration::from_millis(500);

// Consecutive empty reads that end a reply wait early: the controller
// answers promptly or not at all, so sustained silence means the
// request was lost.
const SILENT_BREAK_READS: u32 = 3;

#[derive(Debug)]
pub enum TransportError {
    /// The device could not be opened.
    PortUnavailable(String),
    /// A read failed; the adapter is gone until reopened.
    Disconnected(std::io::Error),
    /// A write failed mid-frame.
    WriteFailed(std::io::Error),
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PortUnavailable(e) => write!(f, "port unavailable: {e}"),
            Self::Disconnected(e) => write!(f, "port disconnected: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outcome of a request/reply exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Answer(Frame),
    /// 0x7F: the peer has nothing (ends discovery, skips a poll batch).
    NoData,
    /// 0x7E: the peer balked at the request size; abort the batch.
    DataSizeError,
    /// All attempts exhausted without a correlated reply.
    Timeout,
}

pub struct Transport<W> {
    wire: W,
    rx: Vec<u8>,
    stats: LinkStats,
    health: HealthMonitor,
}

impl<W: Wire> Transport<W> {
    pub fn new(wire: W, health: HealthMonitor) -> Self {
        Self {
            wire,
            rx: Vec::with_capacity(4096),
            stats: LinkStats::default(),
            health,
        }
    }

    /// Swaps in a freshly opened wire after a disconnect. Buffered
    /// bytes from the dead port are stale and dropped.
    pub fn replace_wire(&mut self, wire: W) {
        self.wire = wire;
        self.rx.clear();
        self.stats.reopens = self.stats.reopens.wrapping_add(1);
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Pops the next validated frame out of the rolling buffer, if one
    /// is complete. Garbage ahead of a frame is discarded one byte at a
    /// time; 0x68 alone never causes consumption.
    pub fn try_extract(&mut self) -> Option<Frame> {
        loop {
            match scan_prefix(&self.rx) {
                ScanOutcome::Frame(frame, used) => {
                    self.rx.drain(..used);
                    self.stats.frames_rx = self.stats.frames_rx.wrapping_add(1);
                    self.health.frame_seen();
                    return Some(frame);
                }
                ScanOutcome::Garbage(e) => {
                    if e == FrameError::BadCrc {
                        self.stats.bad_crc = self.stats.bad_crc.wrapping_add(1);
                    }
                    self.stats.resync_bytes =
                        self.stats.resync_bytes.wrapping_add(1);
                    self.rx.drain(..1);
                }
                ScanOutcome::Incomplete => return None,
            }
        }
    }

    /// Returns any complete frame observed within `timeout`.
    ///
    /// Time is accounted in requested read timeouts, so a scripted wire
    /// in tests runs at full speed; a wall-clock guard bounds the call
    /// when a trickle of non-frame bytes keeps reads busy.
    pub fn poll_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.try_extract() {
            return Ok(Some(frame));
        }

        let hard_deadline = Instant::now() + timeout + IDLE_PROBE;
        let mut waited = Duration::ZERO;
        while waited < timeout && Instant::now() < hard_deadline {
            let chunk = READ_BURST.min(timeout - waited);
            if self.fill(chunk)? == 0 {
                waited += chunk;
                continue;
            }
            if let Some(frame) = self.try_extract() {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// Returns once `silence` has elapsed with no bytes on the wire.
    /// Any traffic restarts the measurement; received bytes stay
    /// buffered for later extraction.
    pub fn drain_idle(
        &mut self,
        silence: Duration,
    ) -> Result<(), TransportError> {
        let mut quiet = Duration::ZERO;
        while quiet < silence {
            let chunk = IDLE_PROBE.min(silence - quiet);
            if self.fill(chunk)? == 0 {
                quiet += chunk;
            } else {
                quiet = Duration::ZERO;
            }
        }
        Ok(())
    }

    /// Transmits one frame, observing the 20 ms turnaround.
    pub fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        std::thread::sleep(TURNAROUND);
        let bytes = frame.encode();
        match self.wire.write_all(&bytes) {
            Ok(()) => {
                self.stats.frames_tx = self.stats.frames_tx.wrapping_add(1);
                Ok(())
            }
            Err(e) => {
                self.stats.write_failures =
                    self.stats.write_failures.wrapping_add(1);
                self.health.mark_disconnected();
                Err(TransportError::WriteFailed(e))
            }
        }
    }

    /// Sends `frame` and awaits a reply from `target` addressed to
    /// `me`, retrying up to [`REQUEST_ATTEMPTS`] times. Each attempt is
    /// bounded by `attempt_timeout` and broken early by sustained
    /// silence; tokenless operation adds the inter-attempt delay.
    /// Unrelated frames seen while waiting (our own echo included) go
    /// to `on_other`, which may hand back a frame to transmit in-line.
    pub fn request(
        &mut self,
        frame: &Frame,
        expect: Command,
        target: u16,
        me: u16,
        tokenless: bool,
        attempt_timeout: Duration,
        on_other: &mut dyn FnMut(&Frame) -> Option<Frame>,
    ) -> Result<Reply, TransportError> {
        // Old traffic still sitting in the buffer must not be mistaken
        // for our reply.
        while let Some(stale) = self.try_extract() {
            if let Some(answer) = on_other(&stale) {
                self.send(&answer)?;
            }
        }

        for attempt in 0..REQUEST_ATTEMPTS {
            if attempt > 0 && tokenless {
                std::thread::sleep(TOKENLESS_RETRY_DELAY);
            }
            self.send(frame)?;

            let hard_deadline = Instant::now() + attempt_timeout + IDLE_PROBE;
            let mut waited = Duration::ZERO;
            let mut empty_streak = 0;
            while waited < attempt_timeout
                && empty_streak < SILENT_BREAK_READS
                && Instant::now() < hard_deadline
            {
                let chunk = READ_BURST.min(attempt_timeout - waited);
                if self.fill(chunk)? == 0 {
                    waited += chunk;
                    empty_streak += 1;
                    continue;
                }
                empty_streak = 0;
                while let Some(got) = self.try_extract() {
                    if got.src == target && got.dest == me {
                        if got.cmd == expect as u8 {
                            return Ok(Reply::Answer(got));
                        }
                        if got.cmd == Command::NoData as u8 {
                            return Ok(Reply::NoData);
                        }
                        if got.cmd == Command::DataSizeError as u8 {
                            return Ok(Reply::DataSizeError);
                        }
                        log::debug!(
                            "unexpected command {:#04x} from {target} \
                             while awaiting {:#04x}",
                            got.cmd,
                            expect as u8
                        );
                    }
                    if let Some(answer) = on_other(&got) {
                        self.send(&answer)?;
                    }
                }
            }
            log::debug!(
                "no reply to {:#04x} from {target} (attempt {})",
                frame.cmd,
                attempt + 1
            );
        }
        Ok(Reply::Timeout)
    }

    fn fill(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let mut buf = [0u8; 512];
        match self.wire.read(&mut buf, timeout) {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.rx.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Err(e) => {
                self.health.mark_disconnected();
                Err(TransportError::Disconnected(e))
            }
        }
    }
}
