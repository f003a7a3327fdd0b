// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client surface of the GM3 gateway.
//!
//! The bus itself is serviced by a single task in `drv-gm3-bus-server`;
//! everything else in the process, the HTTP collaborator above all,
//! talks to it through the types here. Reads never touch the bus task:
//! they come from catalog snapshots. Writes are queued to the bus task
//! and answered on a per-request reply channel.

pub mod catalog;
pub mod config;

pub use catalog::{
    catalog, CatalogReader, CatalogSnapshot, CatalogWriter, Parameter,
    ParameterRecord,
};
pub use config::{Config, ConfigError};

use crossbeam_channel::{bounded, Sender};
use drv_gm3_proto::{AddressSpace, Value};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Errors surfaced to the HTTP collaborator, verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayError {
    /// No catalog entry matches the selector.
    ParameterNotFound,
    /// The parameter exists but the controller marks it read-only.
    NotWritable,
    /// The submitted value cannot be losslessly coerced to the
    /// parameter's wire type.
    BadValueType,
    /// The value lies outside the parameter's inclusive min/max.
    OutOfRange,
    /// The controller answered MODIFY_PARAM with a nonzero result code.
    WriteRejected(u8),
    /// No MODIFY_PARAM answer arrived within the attempt budget.
    WriteTimeout,
    /// The bus task is gone, the token never arrived, or the catalog
    /// has not been discovered yet.
    BusUnavailable,
}

impl GatewayError {
    /// HTTP status the collaborator should map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ParameterNotFound => 404,
            Self::NotWritable | Self::BadValueType | Self::OutOfRange => 400,
            Self::BusUnavailable => 503,
            Self::WriteRejected(_) | Self::WriteTimeout => 500,
        }
    }
}

impl core::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ParameterNotFound => f.write_str("parameter not found"),
            Self::NotWritable => f.write_str("parameter is not writable"),
            Self::BadValueType => {
                f.write_str("value does not match the parameter type")
            }
            Self::OutOfRange => {
                f.write_str("value is outside the allowed range")
            }
            Self::WriteRejected(code) => {
                write!(f, "controller rejected the write (code {code:#04x})")
            }
            Self::WriteTimeout => {
                f.write_str("controller did not acknowledge the write")
            }
            Self::BusUnavailable => f.write_str("bus unavailable"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Identifies a parameter for the write path. Names are not unique
/// across address spaces, so a name may need a space qualifier to
/// disambiguate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamSelector {
    Index(u32),
    Name {
        name: String,
        space: Option<AddressSpace>,
    },
}

impl ParamSelector {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self::Name {
            name: name.into(),
            space: None,
        }
    }
}

/// Successful write result, in the shape the HTTP surface serves.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub parameter: String,
    pub index: u32,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub timestamp: u64,
}

/// A request queued to the bus task.
pub enum Request {
    Write {
        selector: ParamSelector,
        value: serde_json::Value,
        reply: Sender<Result<WriteOutcome, GatewayError>>,
    },
    Shutdown,
}

/// Wrapping event counters maintained by the serial transport.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub frames_rx: u32,
    pub frames_tx: u32,
    pub bad_crc: u32,
    pub resync_bytes: u32,
    pub write_failures: u32,
    pub reopens: u32,
}

#[derive(Debug, Default)]
struct HealthInner {
    connected: bool,
    last_frame_at: Option<Instant>,
    last_poll_at: Option<u64>,
    claimed_address: Option<u16>,
    stats: LinkStats,
}

/// Shared connection-health state: the bus task records events, the
/// HTTP collaborator reads reports.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Mutex<HealthInner>>,
    started: Instant,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HealthInner::default())),
            started: Instant::now(),
        }
    }

    /// A frame was parsed off the wire; the controller is alive.
    pub fn frame_seen(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = true;
        inner.last_frame_at = Some(Instant::now());
    }

    /// The port is gone; reported until a frame is parsed again.
    pub fn mark_disconnected(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    /// Flips to disconnected if no frame arrived within `window`.
    pub fn check_window(&self, window: std::time::Duration) {
        let mut inner = self.inner.lock().unwrap();
        let stale = match inner.last_frame_at {
            Some(at) => at.elapsed() >= window,
            None => self.started.elapsed() >= window,
        };
        if stale && inner.connected {
            log::warn!(
                "no frame for {}s, reporting disconnected",
                window.as_secs()
            );
            inner.connected = false;
        }
    }

    pub fn poll_completed(&self) {
        self.inner.lock().unwrap().last_poll_at =
            Some(catalog::epoch_secs());
    }

    pub fn set_claimed_address(&self, addr: u16) {
        self.inner.lock().unwrap().claimed_address = Some(addr);
    }

    pub fn set_stats(&self, stats: LinkStats) {
        self.inner.lock().unwrap().stats = stats;
    }

    pub fn report(&self) -> Health {
        let inner = self.inner.lock().unwrap();
        Health {
            status: if inner.connected { "ok" } else { "degraded" },
            controller_connected: inner.connected,
            uptime: self.started.elapsed().as_secs(),
            last_poll_at: inner.last_poll_at,
            claimed_address: inner.claimed_address,
            stats: inner.stats,
        }
    }
}

/// `GET /health` body.
#[derive(Clone, Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub controller_connected: bool,
    pub uptime: u64,
    pub last_poll_at: Option<u64>,
    pub claimed_address: Option<u16>,
    pub stats: LinkStats,
}

/// Handle to the gateway, cheap to clone into HTTP handlers.
#[derive(Clone)]
pub struct Gateway {
    requests: Sender<Request>,
    catalog: CatalogReader,
    health: HealthMonitor,
}

impl Gateway {
    pub fn new(
        requests: Sender<Request>,
        catalog: CatalogReader,
        health: HealthMonitor,
    ) -> Self {
        Self {
            requests,
            catalog,
            health,
        }
    }

    /// Snapshot of every discovered parameter. Never blocks on the bus.
    pub fn read_all(&self) -> CatalogSnapshot {
        self.catalog.snapshot()
    }

    /// Queues a write to the bus task and waits for its outcome. The
    /// wait is bounded by the bus task's own budgets (token wait plus
    /// transmit attempts); a vanished bus task reports as unavailable.
    pub fn write(
        &self,
        selector: ParamSelector,
        value: serde_json::Value,
    ) -> Result<WriteOutcome, GatewayError> {
        let (reply, outcome) = bounded(1);
        self.requests
            .send(Request::Write {
                selector,
                value,
                reply,
            })
            .map_err(|_| GatewayError::BusUnavailable)?;
        outcome.recv().map_err(|_| GatewayError::BusUnavailable)?
    }

    pub fn health(&self) -> Health {
        self.health.report()
    }

    /// Asks the bus task to stop after its current transaction.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}
