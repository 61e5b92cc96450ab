// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker threads: `TaskSchedulerThread::Run`, one per configured thread.
//!
//! Every worker runs the same loop: try to become the scheduler, execute
//! whatever's ready, and sleep on the ready signal if there was nothing to
//! do. There is no designated dispatcher -- any worker may end up holding
//! the scheduler role on any given pass.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::scheduler::{PassOutcome, SchedulerShared};

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(shared: Arc<SchedulerShared>, thread_count: usize) -> Self {
        let handles = (0..thread_count.max(1))
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("taskcore-worker-{id}"))
                    .spawn(move || run(shared, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { handles }
    }

    pub(crate) fn join(&mut self) {
        for handle in std::mem::take(&mut self.handles) {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<SchedulerShared>, id: usize) {
    tracing::trace!(worker = id, "worker started");
    let consumer = shared.ready_consumer(id);
    let exec_batch = shared.exec_batch_size;

    loop {
        let mut outcome;
        loop {
            outcome = shared.schedule_pass();
            let mut batch = 0u32;
            while batch < exec_batch {
                let Some(task) = consumer.pop() else { break };
                SchedulerShared::execute(&shared, task);
                batch += 1;
            }
            if batch < exec_batch {
                break;
            }
        }

        if outcome == PassOutcome::Finished {
            break;
        }
        shared.wait_ready();
    }
    tracing::trace!(worker = id, "worker exiting");
    shared.signal_ready();
}
