// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus arbitration state machine.
//!
//! The panel at address 100 owns the bus. It probes for devices with
//! IDENTIFY, and it hands out a token (SERVICE 0x0801) that licenses
//! the holder to transmit until the holder gives it back (SERVICE
//! 0x0800). This module is the single authority for that dance:
//!
//! ```text
//! UNREGISTERED -> CLAIMING -> IDLE <-> TOKEN_HELD -> RETURNING -> IDLE
//! ```
//!
//! All the observed edge cases live here on purpose: answering an
//! IDENTIFY probe in-line while the token is held, a token grant
//! arriving in the same read chunk as the probe that preceded it, and
//! the SERVICE/BEGIN opcode collision (handled below the frame
//! scanner). Scattering these across handlers is how they get lost.

use std::time::{Duration, Instant};

use drv_gm3_api::LinkStats;
use drv_gm3_proto::{
    is_reserved_addr, Command, Frame, ServiceFunction, BROADCAST_ADDR,
    IDENTIFY_ANS_PAYLOAD, TOKEN_RETURN_PAYLOAD,
};

use crate::addr_book::AddrBook;
use crate::transport::{Reply, Transport, TransportError, READ_BURST};
use crate::wire::Wire;

/// How long the panel takes to come back with a token grant after we
/// answer its probe: one scanning cycle.
pub const CLAIM_GRANT_WINDOW: Duration = Duration::from_secs(10);

/// Observed silence that licenses a transmission when no token
/// mechanism is available.
pub const BUS_IDLE_FALLBACK: Duration = Duration::from_millis(1500);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unregistered,
    Claiming,
    Idle,
    TokenHeld,
    Returning,
}

#[derive(Debug)]
pub enum ArbiterError {
    /// No token grant within the caller's budget.
    TokenTimeout,
    /// Auto-claim did not complete (no usable probe, no grant, or the
    /// address could not be persisted).
    ClaimFailed,
    Transport(TransportError),
}

impl From<TransportError> for ArbiterError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl core::fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TokenTimeout => f.write_str("token grant timed out"),
            Self::ClaimFailed => f.write_str("address claim failed"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for ArbiterError {}

pub struct Arbiter<W> {
    transport: Transport<W>,
    addr_book: AddrBook,
    token_required: bool,
    request_timeout: Duration,
    state: State,
}

/// Exclusive bus access inside `run_with_token`. Requests carry our
/// claimed source address, use the transport's attempt budget, and
/// answer IDENTIFY probes for us in-line so the panel never unlists us
/// mid-transaction.
pub struct BusHandle<'a, W> {
    transport: &'a mut Transport<W>,
    me: u16,
    tokenless: bool,
    request_timeout: Duration,
}

impl<W: Wire> BusHandle<'_, W> {
    pub fn me(&self) -> u16 {
        self.me
    }

    pub fn request(
        &mut self,
        dest: u16,
        cmd: Command,
        payload: &[u8],
    ) -> Result<Reply, TransportError> {
        let expect = cmd.reply().expect("opcode has no reply form");
        let frame = Frame::new(dest, self.me, cmd as u8, payload);
        let me = self.me;
        self.transport.request(
            &frame,
            expect,
            dest,
            me,
            self.tokenless,
            self.request_timeout,
            &mut |other| {
                if other.cmd == Command::Identify as u8 && other.dest == me {
                    Some(identify_ans(other.src, me))
                } else {
                    None
                }
            },
        )
    }
}

fn identify_ans(probe_src: u16, me: u16) -> Frame {
    Frame::new(
        probe_src,
        me,
        Command::IdentifyAns as u8,
        &IDENTIFY_ANS_PAYLOAD,
    )
}

impl<W: Wire> Arbiter<W> {
    pub fn new(
        transport: Transport<W>,
        addr_book: AddrBook,
        token_required: bool,
        request_timeout: Duration,
    ) -> Self {
        let state = if addr_book.claimed().is_some() {
            State::Idle
        } else {
            State::Unregistered
        };
        Self {
            transport,
            addr_book,
            token_required,
            request_timeout,
            state,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn our_address(&self) -> Option<u16> {
        self.addr_book.claimed()
    }

    pub fn stats(&self) -> LinkStats {
        self.transport.stats()
    }

    /// Installs a freshly reopened wire. Any token we held died with
    /// the old port.
    pub fn replace_wire(&mut self, wire: W) {
        self.transport.replace_wire(wire);
        if matches!(self.state, State::TokenHeld | State::Returning) {
            self.set_state(State::Idle);
        }
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            log::debug!("arbiter: {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    /// Runs auto-claim until an address is adopted or `window` expires.
    ///
    /// The panel walks its scanning band with IDENTIFY probes; the
    /// first probe to a claimable address becomes our tentative
    /// identity. We answer it and wait one scanning cycle for the
    /// panel to grant us a token; the grant is the panel accepting
    /// the registration, so it also leaves us TOKEN_HELD for any
    /// caller already waiting.
    pub fn ensure_registered(
        &mut self,
        window: Duration,
    ) -> Result<u16, ArbiterError> {
        if let Some(addr) = self.addr_book.claimed() {
            return Ok(addr);
        }
        self.set_state(State::Claiming);

        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let Some(frame) = self.transport.poll_frame(READ_BURST)? else {
                continue;
            };
            let Some(candidate) = claim_candidate(&frame) else {
                continue;
            };
            log::info!(
                "panel is probing address {candidate}; assuming identity"
            );
            self.transport.send(&identify_ans(frame.src, candidate))?;

            let cycle_end = Instant::now() + CLAIM_GRANT_WINDOW;
            while Instant::now() < cycle_end {
                let Some(f) = self.transport.poll_frame(READ_BURST)? else {
                    continue;
                };
                if is_token_grant(&f, candidate) {
                    if let Err(e) = self.addr_book.claim(candidate) {
                        log::error!("cannot persist address: {e}");
                        self.set_state(State::Unregistered);
                        return Err(ArbiterError::ClaimFailed);
                    }
                    self.set_state(State::TokenHeld);
                    return Ok(candidate);
                }
                if f.cmd == Command::Identify as u8 && f.dest == candidate {
                    // Re-probed before the grant; keep answering.
                    self.transport.send(&identify_ans(f.src, candidate))?;
                }
            }
            log::debug!(
                "no grant for {candidate} within a scanning cycle; \
                 abandoning the tentative identity"
            );
        }
        self.set_state(State::Unregistered);
        Err(ArbiterError::ClaimFailed)
    }

    /// Passive IDLE servicing for up to `budget`: answer IDENTIFY
    /// probes for our address, accept a token grant, and decode
    /// SERVICE diagnostics without acting on them. Returns early if a
    /// token lands on us.
    pub fn service_idle(
        &mut self,
        budget: Duration,
    ) -> Result<(), ArbiterError> {
        let deadline = Instant::now() + budget;
        while self.state != State::TokenHeld && Instant::now() < deadline {
            if let Some(frame) = self.transport.poll_frame(READ_BURST)? {
                self.handle_passive(&frame)?;
            }
        }
        Ok(())
    }

    /// Runs `work` with exclusive bus access.
    ///
    /// With a token mechanism, blocks until the panel's grant (or a
    /// grant already accepted while idling), runs `work`, and returns
    /// the token; a failed TOKEN_RETURN write is logged and the token
    /// is considered released locally. Without one, each transaction
    /// independently earns the right to transmit by observing
    /// [`BUS_IDLE_FALLBACK`] of silence, and no token state persists.
    pub fn run_with_token<T>(
        &mut self,
        timeout: Duration,
        work: impl FnOnce(&mut BusHandle<'_, W>) -> T,
    ) -> Result<T, ArbiterError> {
        let me = self.our_address().ok_or(ArbiterError::ClaimFailed)?;

        if !self.token_required {
            self.transport.drain_idle(BUS_IDLE_FALLBACK)?;
            let mut bus = BusHandle {
                transport: &mut self.transport,
                me,
                tokenless: true,
                request_timeout: self.request_timeout,
            };
            return Ok(work(&mut bus));
        }

        if self.state != State::TokenHeld {
            let deadline = Instant::now() + timeout;
            loop {
                if self.state == State::TokenHeld {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ArbiterError::TokenTimeout);
                }
                if let Some(frame) = self.transport.poll_frame(READ_BURST)? {
                    self.handle_passive(&frame)?;
                }
            }
        }

        let mut bus = BusHandle {
            transport: &mut self.transport,
            me,
            tokenless: false,
            request_timeout: self.request_timeout,
        };
        let out = work(&mut bus);
        self.return_token(me);
        Ok(out)
    }

    fn handle_passive(&mut self, frame: &Frame) -> Result<(), ArbiterError> {
        let me = self.our_address();
        if frame.cmd == Command::Identify as u8 && Some(frame.dest) == me {
            self.transport
                .send(&identify_ans(frame.src, frame.dest))?;
            return Ok(());
        }
        if frame.cmd == Command::Service as u8 {
            match ServiceFunction::from_payload(&frame.payload) {
                Some(ServiceFunction::TokenGrant)
                    if Some(frame.dest) == me =>
                {
                    log::debug!("token granted by {}", frame.src);
                    self.set_state(State::TokenHeld);
                }
                Some(ServiceFunction::TokenGrant) => {
                    log::trace!(
                        "token granted to {} (not us)",
                        frame.dest
                    );
                }
                Some(ServiceFunction::TokenReturn) => {
                    log::trace!("device {} returned the token", frame.src);
                }
                Some(ServiceFunction::ClockSync) => {
                    log::debug!("clock sync from {}", frame.src);
                }
                Some(ServiceFunction::DeviceTable) => {
                    log::debug!("device table broadcast from {}", frame.src);
                }
                Some(ServiceFunction::PairingBeacon) => {
                    log::debug!("pairing beacon from {}", frame.src);
                }
                Some(ServiceFunction::Other(func)) => {
                    log::trace!(
                        "SERVICE {func:#06x} from {} ignored",
                        frame.src
                    );
                }
                None => {
                    log::trace!("short SERVICE frame from {}", frame.src);
                }
            }
        }
        Ok(())
    }

    fn return_token(&mut self, me: u16) {
        self.set_state(State::Returning);
        let frame = Frame::new(
            drv_gm3_proto::PANEL_ADDR,
            me,
            Command::Service as u8,
            &TOKEN_RETURN_PAYLOAD,
        );
        if let Err(e) = self.transport.send(&frame) {
            // The token is considered released locally either way;
            // the panel will time us out.
            log::warn!("token return failed: {e}");
        }
        self.set_state(State::Idle);
    }
}

fn claim_candidate(frame: &Frame) -> Option<u16> {
    if frame.cmd != Command::Identify as u8 {
        return None;
    }
    if frame.dest == BROADCAST_ADDR || is_reserved_addr(frame.dest) {
        return None;
    }
    Some(frame.dest)
}

fn is_token_grant(frame: &Frame, me: u16) -> bool {
    frame.cmd == Command::Service as u8
        && frame.dest == me
        && ServiceFunction::from_payload(&frame.payload)
            == Some(ServiceFunction::TokenGrant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_wire::FakeWire;
    use drv_gm3_api::HealthMonitor;

    const IDENTIFY_TO_131: [u8; 11] = [
        0x68, 0x02, 0x00, 0x83, 0x00, 0x64, 0x00, 0x09, 0x7A, 0x63, 0x16,
    ];
    const GRANT_TO_131: [u8; 15] = [
        0x68, 0x06, 0x00, 0x83, 0x00, 0x64, 0x00, 0x68, 0x01, 0x08, 0x00,
        0x00, 0xD5, 0x3A, 0x16,
    ];
    const IDENTIFY_ANS_FROM_131: [u8; 27] = [
        0x68, 0x12, 0x00, 0x64, 0x00, 0x83, 0x00, 0x89, 0x50, 0x4C, 0x55,
        0x4D, 0x00, 0x45, 0x63, 0x6F, 0x4E, 0x45, 0x54, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xA2, 0xFC, 0x16,
    ];
    const TOKEN_RETURN_FROM_131: [u8; 15] = [
        0x68, 0x06, 0x00, 0x64, 0x00, 0x83, 0x00, 0x68, 0x00, 0x08, 0x00,
        0x00, 0x54, 0x15, 0x16,
    ];
    const IDENTIFY_TO_132: [u8; 11] = [
        0x68, 0x02, 0x00, 0x84, 0x00, 0x64, 0x00, 0x09, 0x1D, 0xB7, 0x16,
    ];
    const GRANT_TO_132: [u8; 15] = [
        0x68, 0x06, 0x00, 0x84, 0x00, 0x64, 0x00, 0x68, 0x01, 0x08, 0x00,
        0x00, 0x64, 0x91, 0x16,
    ];

    fn arbiter_at(
        wire: &FakeWire,
        dir: &tempfile::TempDir,
        addr: Option<u16>,
        token_required: bool,
    ) -> Arbiter<FakeWire> {
        let path = dir.path().join("paired_address");
        if let Some(addr) = addr {
            std::fs::write(&path, format!("{addr}\n")).unwrap();
        }
        Arbiter::new(
            Transport::new(wire.clone(), HealthMonitor::new()),
            AddrBook::load(path),
            token_required,
            Duration::from_millis(600),
        )
    }

    #[test]
    fn identify_probe_is_answered_in_idle() {
        let wire = FakeWire::new();
        wire.push_rx(&IDENTIFY_TO_131);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), true);

        arb.service_idle(Duration::from_millis(50)).unwrap();
        assert_eq!(wire.writes(), vec![IDENTIFY_ANS_FROM_131.to_vec()]);
        assert_eq!(arb.state(), State::Idle);
    }

    #[test]
    fn token_grant_unblocks_run_with_token() {
        let wire = FakeWire::new();
        wire.push_rx(&GRANT_TO_131);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), true);

        let out = arb
            .run_with_token(Duration::from_secs(1), |bus| {
                assert_eq!(bus.me(), 131);
                42
            })
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(arb.state(), State::Idle);
        assert_eq!(wire.writes(), vec![TOKEN_RETURN_FROM_131.to_vec()]);
    }

    #[test]
    fn grant_accepted_while_idling_is_kept_for_next_caller() {
        let wire = FakeWire::new();
        wire.push_rx(&GRANT_TO_131);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), true);

        arb.service_idle(Duration::from_millis(50)).unwrap();
        assert_eq!(arb.state(), State::TokenHeld);

        // No further grant needed; the held token is consumed.
        arb.run_with_token(Duration::ZERO, |_| ()).unwrap();
        assert_eq!(arb.state(), State::Idle);
    }

    #[test]
    fn identify_answered_while_waiting_for_token() {
        let wire = FakeWire::new();
        wire.push_rx(&IDENTIFY_TO_131);
        wire.push_rx(&GRANT_TO_131);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), true);

        arb.run_with_token(Duration::from_secs(1), |_| ()).unwrap();
        assert_eq!(
            wire.writes(),
            vec![
                IDENTIFY_ANS_FROM_131.to_vec(),
                TOKEN_RETURN_FROM_131.to_vec(),
            ]
        );
    }

    #[test]
    fn token_wait_times_out() {
        let wire = FakeWire::new();
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), true);

        let err = arb.run_with_token(Duration::ZERO, |_| ()).unwrap_err();
        assert!(matches!(err, ArbiterError::TokenTimeout));
        assert!(wire.writes().is_empty());
    }

    #[test]
    fn auto_claim_adopts_and_persists_probed_address() {
        let wire = FakeWire::new();
        wire.push_rx(&IDENTIFY_TO_132);
        // The grant follows our IDENTIFY_ANS.
        wire.reply_after_writes(1, &GRANT_TO_132);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, None, true);

        let addr = arb.ensure_registered(Duration::from_secs(5)).unwrap();
        assert_eq!(addr, 132);
        assert_eq!(arb.state(), State::TokenHeld);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("paired_address"))
                .unwrap(),
            "132\n"
        );

        // The IDENTIFY_ANS went out with the probed address as source.
        let ans = Frame::decode(&wire.writes()[0]).unwrap();
        assert_eq!(ans.cmd, Command::IdentifyAns as u8);
        assert_eq!(ans.src, 132);
        assert_eq!(ans.dest, 100);
        assert_eq!(ans.payload, IDENTIFY_ANS_PAYLOAD);
    }

    #[test]
    fn probes_to_reserved_addresses_are_never_claimed() {
        let wire = FakeWire::new();
        // Probes to reserved addresses (131 is in the reserved set),
        // then one to a claimable address.
        wire.push_rx(&IDENTIFY_TO_131);
        wire.push_rx(&IDENTIFY_TO_132);
        wire.reply_after_writes(1, &GRANT_TO_132);
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, None, true);

        let addr = arb.ensure_registered(Duration::from_secs(5)).unwrap();
        assert_eq!(addr, 132);
        // Exactly one IDENTIFY_ANS: nothing was emitted for 131.
        let writes = wire.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(Frame::decode(&writes[0]).unwrap().src, 132);
    }

    #[test]
    fn idle_fallback_earns_silence_before_transmitting() {
        let wire = FakeWire::new();
        let dir = tempfile::tempdir().unwrap();
        let mut arb = arbiter_at(&wire, &dir, Some(131), false);

        arb.run_with_token(Duration::from_secs(1), |_| ()).unwrap();
        // Three empty 500 ms probes accumulate the 1500 ms of silence.
        assert!(wire.reads_observed() >= 3);
        // Fallback neither consumes nor returns a token.
        assert!(wire.writes().is_empty());
        assert_eq!(arb.state(), State::Idle);
    }
}
