// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-level seam under the transport.
//!
//! Everything above this trait is deterministic protocol logic, tested
//! against scripted fakes; only [`SerialWire`] touches hardware.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::transport::TransportError;

pub trait Wire: Send {
    /// Reads whatever bytes are available, waiting up to `timeout` for
    /// the first one. Returns 0 on a quiet wire; an error means the
    /// device is gone.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes one whole frame worth of bytes.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// The real RS-485 adapter.
pub struct SerialWire {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialWire {
    /// Opens the device with the baud toggle reset: open at 9600,
    /// close, reopen at the target rate. Some USB RS-485 adapters come
    /// up wedged until they see a rate change.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let reset = serialport::new(path, 9600)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::PortUnavailable(e.to_string()))?;
        drop(reset);

        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::PortUnavailable(e.to_string()))?;

        log::info!("opened {path} at {baud} baud (8-N-1)");
        Ok(Self { port })
    }
}

impl Wire for SerialWire {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout).map_err(io::Error::other)?;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}
