// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `TaskOneShot`: a task that runs a `FnOnce` exactly once and then deletes
//! itself, mirroring `mg::sch::TaskOneShot`.

use super::{Task, TaskAction, TaskRef};

/// Build a task that runs `callback` once, the next time the scheduler
/// sees it, then deletes itself. The returned [`TaskRef`] only needs to be
/// handed to [`Scheduler::post`](crate::Scheduler::post); nothing further
/// needs to be done with it afterwards.
pub fn spawn_one_shot(callback: impl FnOnce() + Send + 'static) -> TaskRef {
    let mut callback = Some(callback);
    Task::new(move |_task| {
        if let Some(f) = callback.take() {
            f();
        }
        TaskAction::Delete
    })
}
