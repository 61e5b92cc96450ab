// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A sticky wakeup signal: `send` never blocks and is safe to call any
//! number of times before anyone waits on it, matching `mg::box::Signal`.
//!
//! The scheduler uses two instances: one to wake a sleeping sched-thread
//! when the front queue receives work (or a waiter's deadline is close),
//! and one to wake idle workers once ready tasks exist.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Raise the signal. Idempotent: raising twice before anyone receives
    /// it is equivalent to raising it once.
    pub fn send(&self) {
        let mut raised = self.raised.lock().unwrap();
        if !*raised {
            *raised = true;
            self.condvar.notify_all();
        }
    }

    /// Block until the signal is raised, then clear it.
    pub fn receive_blocking(&self) {
        let mut raised = self.raised.lock().unwrap();
        while !*raised {
            raised = self.condvar.wait(raised).unwrap();
        }
        *raised = false;
    }

    /// Block until the signal is raised or `timeout` elapses. Clears the
    /// signal only if it was observed raised.
    pub fn receive_timed(&self, timeout: Duration) -> bool {
        let mut raised = self.raised.lock().unwrap();
        while !*raised {
            let (guard, result) = self.condvar.wait_timeout(raised, timeout).unwrap();
            raised = guard;
            if result.timed_out() && !*raised {
                return false;
            }
        }
        *raised = false;
        true
    }
}
