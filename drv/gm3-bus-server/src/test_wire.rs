// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scripted in-memory wire for tests.
//!
//! Reads consume a queue of scripted events; a `Silence` event (or an
//! exhausted queue) models a read timeout, so a test's "500 ms of
//! quiet" costs no wall-clock time. Writes are recorded for assertion
//! and can be scripted to echo (as RS-485 adapters do) or to trigger a
//! queued response after the Nth transmission.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::wire::Wire;

enum Event {
    Rx(Vec<u8>),
    Silence,
}

#[derive(Default)]
struct State {
    events: VecDeque<Event>,
    writes: Vec<Vec<u8>>,
    echo: bool,
    replies: Vec<(usize, Vec<u8>)>,
    reads: usize,
    dead: bool,
}

#[derive(Clone)]
pub struct FakeWire {
    state: Arc<Mutex<State>>,
}

impl Default for FakeWire {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWire {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Queues bytes to arrive on a future read.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .events
            .push_back(Event::Rx(bytes.to_vec()));
    }

    /// Queues one timed-out read.
    pub fn push_silence(&self) {
        self.state.lock().unwrap().events.push_back(Event::Silence);
    }

    /// Every write loops back as received bytes, like a half-duplex
    /// adapter with local echo.
    pub fn echo_writes(&self) {
        self.state.lock().unwrap().echo = true;
    }

    /// After the `nth` write (1-based), `bytes` arrive on the wire.
    pub fn reply_after_writes(&self, nth: usize, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((nth, bytes.to_vec()));
    }

    /// All subsequent reads and writes fail, as if the adapter was
    /// unplugged.
    pub fn kill(&self) {
        self.state.lock().unwrap().dead = true;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn reads_observed(&self) -> usize {
        self.state.lock().unwrap().reads
    }
}

impl Wire for FakeWire {
    fn read(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        s.reads += 1;
        if s.dead {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "wire killed",
            ));
        }
        match s.events.pop_front() {
            Some(Event::Rx(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    s.events.push_front(Event::Rx(rest));
                }
                Ok(n)
            }
            Some(Event::Silence) | None => Ok(0),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.dead {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "wire killed",
            ));
        }
        s.writes.push(bytes.to_vec());
        let count = s.writes.len();
        if s.echo {
            let echoed = bytes.to_vec();
            s.events.push_back(Event::Rx(echoed));
        }
        let due: Vec<Vec<u8>> = s
            .replies
            .iter()
            .filter(|(nth, _)| *nth == count)
            .map(|(_, b)| b.clone())
            .collect();
        for bytes in due {
            s.events.push_back(Event::Rx(bytes));
        }
        Ok(())
    }
}
