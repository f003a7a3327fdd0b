// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus task.
//!
//! One long-running loop owns the serial port, the arbiter, and all
//! catalog writes. Each pass services queued requests, runs whichever
//! deadline is due (discovery until it succeeds, then periodic polls,
//! plus the health check), and otherwise listens passively so IDENTIFY
//! probes are answered and token grants are noticed. Requests are FIFO;
//! reads never enter the queue; they are served from catalog
//! snapshots on the caller's thread.
//!
//! A transport failure anywhere drops into close-and-reopen with
//! capped exponential backoff. The catalog is preserved across
//! reconnects; only health flips while the port is down.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use drv_gm3_api::{
    CatalogWriter, Config, GatewayError, HealthMonitor, ParamSelector,
    Request, WriteOutcome,
};
use drv_gm3_proto::AddressSpace;

use crate::addr_book::AddrBook;
use crate::arbiter::{Arbiter, ArbiterError};
use crate::discovery;
use crate::poll;
use crate::timers::{Deadlines, TimerKind};
use crate::transport::{Transport, TransportError};
use crate::wire::Wire;
use crate::write;

/// Passive listening slice per loop pass; bounds request latency.
const IDLE_SLICE: Duration = Duration::from_millis(200);

/// How long a single registration pass listens for probes before the
/// loop gets control back.
const CLAIM_STEP: Duration = Duration::from_secs(2);

/// Token wait budget for bus work: generously more than one panel
/// scanning cycle.
const TOKEN_WAIT: Duration = Duration::from_secs(15);

const HEALTH_PERIOD: Duration = Duration::from_secs(5);
const DISCOVERY_RETRY: Duration = Duration::from_secs(30);
const TOKENLESS_DISCOVERY_RETRY: Duration = Duration::from_secs(1);

const REOPEN_BACKOFF_START: Duration = Duration::from_millis(250);
const REOPEN_BACKOFF_MAX: Duration = Duration::from_secs(5);

enum Step {
    Continue,
    Reconnect,
    Shutdown,
}

pub struct BusServer<W, F> {
    cfg: Config,
    arbiter: Arbiter<W>,
    reopen: F,
    catalog: CatalogWriter,
    health: HealthMonitor,
    requests: Receiver<Request>,
    timers: Deadlines,
    discovered: bool,
}

impl<W, F> BusServer<W, F>
where
    W: Wire,
    F: FnMut() -> Result<W, TransportError>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        wire: W,
        addr_book: AddrBook,
        catalog: CatalogWriter,
        health: HealthMonitor,
        requests: Receiver<Request>,
        reopen: F,
    ) -> Self {
        let transport = Transport::new(wire, health.clone());
        let arbiter = Arbiter::new(
            transport,
            addr_book,
            cfg.token_required,
            cfg.request_timeout,
        );
        let mut timers = Deadlines::new();
        timers.set_after(TimerKind::Health, HEALTH_PERIOD);
        timers.set_at(TimerKind::Discovery, Instant::now());
        Self {
            cfg,
            arbiter,
            reopen,
            catalog,
            health,
            requests,
            timers,
            discovered: false,
        }
    }

    pub fn run(mut self) {
        log::info!("bus task running");
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Shutdown => break,
                Step::Reconnect => {
                    if !self.reconnect() {
                        break;
                    }
                }
            }
        }
        log::info!("bus task stopped");
    }

    fn step(&mut self) -> Step {
        let now = Instant::now();
        if self.timers.fired(TimerKind::Health, now) {
            self.health.check_window(self.cfg.health_window);
            self.health.set_stats(self.arbiter.stats());
            self.timers.set_after(TimerKind::Health, HEALTH_PERIOD);
        }

        if let Some(step) = self.drain_requests() {
            return step;
        }

        if self.arbiter.our_address().is_none() {
            return match self.arbiter.ensure_registered(CLAIM_STEP) {
                Ok(addr) => {
                    self.health.set_claimed_address(addr);
                    Step::Continue
                }
                Err(ArbiterError::Transport(e)) => {
                    log::warn!("registration read failed: {e}");
                    Step::Reconnect
                }
                // Nothing claimable heard yet; keep listening.
                Err(_) => Step::Continue,
            };
        }

        if !self.discovered && self.timers.fired(TimerKind::Discovery, now) {
            return self.run_discovery();
        }

        if self.discovered && self.timers.fired(TimerKind::Poll, now) {
            return self.run_poll();
        }

        match self.arbiter.service_idle(IDLE_SLICE) {
            Ok(()) => Step::Continue,
            Err(ArbiterError::Transport(e)) => {
                log::warn!("idle servicing failed: {e}");
                Step::Reconnect
            }
            Err(_) => Step::Continue,
        }
    }

    fn drain_requests(&mut self) -> Option<Step> {
        loop {
            match self.requests.try_recv() {
                Ok(Request::Write {
                    selector,
                    value,
                    reply,
                }) => {
                    if let Some(step) =
                        self.handle_write(selector, &value, &reply)
                    {
                        return Some(step);
                    }
                }
                Ok(Request::Shutdown) => return Some(Step::Shutdown),
                Err(TryRecvError::Empty) => return None,
                // Every gateway handle is gone; nobody can talk to us.
                Err(TryRecvError::Disconnected) => {
                    return Some(Step::Shutdown)
                }
            }
        }
    }

    fn handle_write(
        &mut self,
        selector: ParamSelector,
        value: &serde_json::Value,
        reply: &crossbeam_channel::Sender<
            Result<WriteOutcome, GatewayError>,
        >,
    ) -> Option<Step> {
        if !self.discovered {
            let _ = reply.send(Err(GatewayError::BusUnavailable));
            return None;
        }
        let param = match write::resolve(&self.catalog, &selector) {
            Ok(param) => param,
            Err(e) => {
                let _ = reply.send(Err(e));
                return None;
            }
        };
        let coerced = match write::validate(&param, value) {
            Ok(v) => v,
            Err(e) => {
                let _ = reply.send(Err(e));
                return None;
            }
        };

        let catalog = &self.catalog;
        let controller = self.cfg.controller_addr;
        match self.arbiter.run_with_token(TOKEN_WAIT, |bus| {
            write::perform(bus, catalog, &param, coerced, controller)
        }) {
            Ok(outcome) => {
                if reply.send(outcome).is_err() {
                    // Requester gave up; the write happened and is not
                    // retried or rolled back.
                    log::debug!("write outcome discarded, requester gone");
                }
                None
            }
            Err(ArbiterError::Transport(e)) => {
                log::warn!("write failed in transport: {e}");
                let _ = reply.send(Err(GatewayError::BusUnavailable));
                Some(Step::Reconnect)
            }
            Err(e) => {
                log::warn!("write could not reach the bus: {e}");
                let _ = reply.send(Err(GatewayError::BusUnavailable));
                None
            }
        }
    }

    fn run_discovery(&mut self) -> Step {
        let catalog = &self.catalog;
        let controller = self.cfg.controller_addr;
        let page = self.cfg.params_per_request.min(255) as u8;

        let result = self.arbiter.run_with_token(TOKEN_WAIT, |bus| {
            let regulator = discovery::discover_space(
                bus,
                catalog,
                AddressSpace::Regulator,
                controller,
                page,
            )?;
            let panel = discovery::discover_space(
                bus,
                catalog,
                AddressSpace::Panel,
                controller,
                page,
            )?;
            Ok::<_, TransportError>((regulator, panel))
        });

        match result {
            Ok(Ok((regulator, panel))) => {
                if regulator + panel > 0 {
                    log::info!(
                        "catalog ready: {regulator} regulator + \
                         {panel} panel parameters"
                    );
                    self.discovered = true;
                    self.timers.set_at(TimerKind::Poll, Instant::now());
                } else {
                    log::warn!(
                        "discovery found no parameters; retrying in {}s",
                        DISCOVERY_RETRY.as_secs()
                    );
                    self.timers
                        .set_after(TimerKind::Discovery, DISCOVERY_RETRY);
                }
                Step::Continue
            }
            Ok(Err(e)) => {
                log::warn!("discovery transport failure: {e}");
                self.timers.set_after(TimerKind::Discovery, DISCOVERY_RETRY);
                Step::Reconnect
            }
            Err(ArbiterError::Transport(e)) => {
                log::warn!("discovery transport failure: {e}");
                self.timers.set_after(TimerKind::Discovery, DISCOVERY_RETRY);
                Step::Reconnect
            }
            Err(e) => {
                log::debug!("no bus access for discovery yet: {e}");
                self.timers.set_after(
                    TimerKind::Discovery,
                    TOKENLESS_DISCOVERY_RETRY,
                );
                Step::Continue
            }
        }
    }

    fn run_poll(&mut self) -> Step {
        let catalog = &self.catalog;
        let controller = self.cfg.controller_addr;
        let page = self.cfg.params_per_request;

        let result = self.arbiter.run_with_token(TOKEN_WAIT, |bus| {
            let regulator = poll::poll_space(
                bus,
                catalog,
                AddressSpace::Regulator,
                controller,
                page,
            )?;
            let panel = poll::poll_space(
                bus,
                catalog,
                AddressSpace::Panel,
                controller,
                page,
            )?;
            Ok::<_, TransportError>((regulator, panel))
        });

        self.timers.set_after(TimerKind::Poll, self.cfg.poll_interval);
        match result {
            Ok(Ok((regulator, panel))) => {
                self.health.poll_completed();
                log::debug!(
                    "poll round: {} values refreshed, {} batches dropped",
                    regulator.updated + panel.updated,
                    regulator.failed_batches + panel.failed_batches,
                );
                Step::Continue
            }
            Ok(Err(e)) | Err(ArbiterError::Transport(e)) => {
                log::warn!("poll transport failure: {e}");
                Step::Reconnect
            }
            Err(e) => {
                log::warn!("poll skipped: {e}");
                Step::Continue
            }
        }
    }

    /// Close-and-reopen with backoff. Pending writes fail fast while
    /// the port is down. Returns false if asked to shut down.
    fn reconnect(&mut self) -> bool {
        self.health.mark_disconnected();
        let mut backoff = REOPEN_BACKOFF_START;
        loop {
            loop {
                match self.requests.try_recv() {
                    Ok(Request::Write { reply, .. }) => {
                        let _ =
                            reply.send(Err(GatewayError::BusUnavailable));
                    }
                    Ok(Request::Shutdown) => return false,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return false,
                }
            }
            match (self.reopen)() {
                Ok(wire) => {
                    log::info!("serial port reopened");
                    self.arbiter.replace_wire(wire);
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "reopen failed ({e}); next attempt in {backoff:?}"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(REOPEN_BACKOFF_MAX);
                }
            }
        }
    }
}
