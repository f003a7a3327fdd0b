// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deadline multiplexer for the bus task.
//!
//! The server loop has a single wait point but several periodic
//! obligations; each gets a named deadline here. A timer that has
//! fired stays quiet until it is armed again.

use enum_map::{Enum, EnumMap};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum TimerKind {
    /// One-shot catalog discovery (re-armed only while it keeps
    /// failing).
    Discovery,
    /// Periodic value refresh.
    Poll,
    /// Health-window check and stats push.
    Health,
}

#[derive(Default)]
pub struct Deadlines {
    timers: EnumMap<TimerKind, Option<Instant>>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_at(&mut self, which: TimerKind, at: Instant) {
        self.timers[which] = Some(at);
    }

    pub fn set_after(&mut self, which: TimerKind, after: Duration) {
        self.set_at(which, Instant::now() + after);
    }

    pub fn clear(&mut self, which: TimerKind) {
        self.timers[which] = None;
    }

    /// True exactly once per arming, when the deadline has passed.
    pub fn fired(&mut self, which: TimerKind, now: Instant) -> bool {
        match self.timers[which] {
            Some(at) if at <= now => {
                self.timers[which] = None;
                true
            }
            _ => false,
        }
    }
}
