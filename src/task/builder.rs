// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ergonomic task construction, in the style of `kasync`'s `TaskBuilder`.

use super::{Task, TaskAction, TaskRef};

/// Builds a [`TaskRef`] with an initial deadline, without requiring the
/// caller to juggle `set_delay`/`set_deadline`/`set_wait` calls after the
/// fact.
pub struct TaskBuilder {
    deadline: Option<u64>,
    delay_ms: Option<u64>,
    wait: bool,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            deadline: None,
            delay_ms: None,
            wait: false,
        }
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run as soon as the scheduler sees it (the default).
    pub fn immediate(mut self) -> Self {
        self.deadline = None;
        self.delay_ms = None;
        self.wait = false;
        self
    }

    /// Run no sooner than `delay_ms` from now.
    pub fn after(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Run no sooner than the given absolute scheduler-clock deadline.
    pub fn at_deadline(mut self, deadline_ms: u64) -> Self {
        self.deadline = Some(deadline_ms);
        self
    }

    /// Never run until explicitly woken or signaled.
    pub fn wait_forever(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn build(self, callback: impl FnMut(&Task) -> TaskAction + Send + 'static) -> TaskRef {
        let task = Task::new(callback);
        if self.wait {
            task.set_wait();
        } else if let Some(deadline) = self.deadline {
            task.set_deadline(deadline);
        } else if let Some(delay) = self.delay_ms {
            task.set_delay(delay);
        }
        task
    }
}
