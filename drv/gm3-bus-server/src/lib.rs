// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The GM3 bus task: serial transport, bus arbitration, catalog
//! discovery, polling, and writes, behind the queue-and-snapshot
//! surface of `drv-gm3-api`.
//!
//! [`spawn`] wires the whole pipeline to a real serial port and starts
//! the bus thread; everything below it is testable without hardware
//! through the [`wire::Wire`] seam.

pub mod addr_book;
pub mod arbiter;
pub mod discovery;
pub mod poll;
pub mod server;
pub mod timers;
pub mod transport;
pub mod wire;
pub mod write;

#[cfg(test)]
mod test_wire;

pub use server::BusServer;
pub use transport::{Reply, Transport, TransportError};
pub use wire::{SerialWire, Wire};

use drv_gm3_api::{Config, Gateway, HealthMonitor};

/// Opens the configured serial port and starts the bus task, returning
/// the gateway handle for the HTTP collaborator and the task's join
/// handle. Failure to open the port at startup is fatal to the caller;
/// later disconnects are handled inside the task with reopen backoff.
pub fn spawn(
    cfg: Config,
) -> Result<(Gateway, std::thread::JoinHandle<()>), TransportError> {
    let wire = SerialWire::open(&cfg.serial_port, cfg.serial_baud)?;

    let (catalog_writer, catalog_reader) = drv_gm3_api::catalog();
    let health = HealthMonitor::new();
    let (requests_tx, requests_rx) = crossbeam_channel::bounded(32);
    let gateway =
        Gateway::new(requests_tx, catalog_reader, health.clone());

    let addr_book = addr_book::AddrBook::load(cfg.paired_address_path());
    if let Some(addr) = addr_book.claimed() {
        health.set_claimed_address(addr);
    }

    let reopen = {
        let path = cfg.serial_port.clone();
        let baud = cfg.serial_baud;
        move || SerialWire::open(&path, baud)
    };
    let server = BusServer::new(
        cfg,
        wire,
        addr_book,
        catalog_writer,
        health,
        requests_rx,
        reopen,
    );
    let handle = std::thread::Builder::new()
        .name("gm3-bus".to_owned())
        .spawn(move || server.run())
        .expect("cannot spawn bus thread");

    Ok((gateway, handle))
}
