// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway daemon.
//!
//! Reads its configuration from the environment, opens the serial
//! port, and runs the bus task until told to stop. The HTTP
//! collaborator consumes the [`drv_gm3_api::Gateway`] handle this
//! process owns; its bind address is accepted here so one environment
//! configures the whole service.
//!
//! Exit codes: 0 on an orderly shutdown, 1 for invalid configuration,
//! 2 when the serial device cannot be opened.

use anyhow::Context;
use drv_gm3_api::Config;

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    log::info!(
        "gm3-gateway starting: {} at {} baud, controller {}, poll {}s",
        cfg.serial_port,
        cfg.serial_baud,
        cfg.controller_addr,
        cfg.poll_interval.as_secs(),
    );
    log::debug!(
        "HTTP collaborator binds {}:{}",
        cfg.api_host,
        cfg.api_port
    );

    let (gateway, bus) = match drv_gm3_bus_server::spawn(cfg) {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("cannot start bus task: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(gateway, bus) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(
    gateway: drv_gm3_api::Gateway,
    bus: std::thread::JoinHandle<()>,
) -> anyhow::Result<()> {
    let stopper = gateway.clone();
    ctrlc::set_handler(move || {
        log::info!("signal received, shutting down");
        stopper.shutdown();
    })
    .context("cannot install signal handler")?;

    bus.join()
        .map_err(|_| anyhow::anyhow!("bus task panicked"))?;

    let health = gateway.health();
    log::info!(
        "stopped after {}s (controller connected: {})",
        health.uptime,
        health.controller_connected,
    );
    Ok(())
}
