// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The socket-aware extension: couples tasks to kernel descriptors.
//!
//! `IoCore` is a thin wrapper around a [`Scheduler`] that was built with a
//! [`ReadinessSource`] attached. The readiness source is drained as part of
//! the scheduler's own `schedule_pass` (`spec.md` §4.5 step 1), and every
//! socket callback is delivered from inside the owning task's own callback
//! turn on a worker thread -- there is no separate reactor thread. The
//! reactor is generic over the readiness source so tests can supply an
//! in-memory fake instead of real epoll (see `tests/io_close_race.rs`).

pub mod epoll;
pub(crate) mod readiness;
pub mod subscription;

pub use epoll::Epoll;
pub use readiness::{Interest, ReadinessEvent, ReadinessSource};
pub use subscription::SocketSubscription;

pub(crate) use readiness::IoFields;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::Config;
use crate::error::SetupError;
use crate::scheduler::Scheduler;
use crate::task::TaskRef;

/// A scheduler with a socket-aware extension attached.
pub struct IoCore {
    scheduler: Scheduler,
}

impl IoCore {
    pub fn new(config: Config) -> Result<Self, SetupError> {
        let reactor = Epoll::new().map_err(SetupError::Os)?;
        Self::with_reactor(config, reactor)
    }

    pub fn with_reactor(config: Config, reactor: impl ReadinessSource + 'static) -> Result<Self, SetupError> {
        Ok(Self {
            scheduler: Scheduler::new_with_reactor(config, reactor)?,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Couple a freshly-created task to `fd`: events on `fd` matching
    /// `interest` invoke `subscription`'s callbacks on a worker thread as
    /// part of that task's own callback turn. Returns the task handle,
    /// already posted -- there is no separate owner task to create.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        subscription: Box<dyn SocketSubscription>,
    ) -> io::Result<TaskRef> {
        self.scheduler.register_io(fd, interest, subscription)
    }

    pub fn modify_interest(&self, task: &TaskRef, interest: Interest) -> io::Result<()> {
        self.scheduler.modify_io_interest(task, interest)
    }

    /// Begin closing `task`'s descriptor: marks it `Closing` and wakes it
    /// so the scheduler finalizes the close (unregister, one last
    /// `on_close` delivery) the next time it passes through `schedule_pass`
    /// step 3.
    pub fn close(&self, task: &TaskRef) {
        self.scheduler.close_io(task);
    }

    pub fn wait_empty(&self, timeout: Duration) -> usize {
        self.scheduler.wait_empty(timeout)
    }
}
