// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ready queue: a sharded, multi-consumer FIFO.
//!
//! The Design Notes leave the implementation technique free as long as the
//! observable behavior (FIFO-per-shard, safe multi-consumer pop, no
//! ordering guarantee across shards) holds. `taskcore` shards the queue
//! into a fixed chain of sub-queues, each a short-held `Mutex<VecDeque<_>>`,
//! the same shape as `mg::common::MultiConsumerQueue`'s sub-queue chain,
//! without replicating its lock-free ring-buffer internals.
//!
//! This is *not* work-stealing: there are no per-worker local queues and no
//! idle-triggered theft heuristic. Every worker is just one consumer of the
//! same shared, sharded structure, and pops from whichever sub-queue its
//! rotating cursor currently points at.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::task::TaskRef;

#[derive(Debug)]
struct SubQueue {
    tasks: Mutex<std::collections::VecDeque<TaskRef>>,
}

impl SubQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(std::collections::VecDeque::new()),
        }
    }
}

/// Shared ready-queue state. Cloned cheaply via `Arc` by every worker.
#[derive(Debug)]
pub struct ReadyQueue {
    shards: Vec<SubQueue>,
    push_cursor: AtomicUsize,
    len: AtomicUsize,
}

impl ReadyQueue {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| SubQueue::new()).collect(),
            push_cursor: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-size every shard's backing `VecDeque` so the first `n` scheduled
    /// tasks don't force a reallocation, mirroring `TaskScheduler::Reserve`.
    /// Spread evenly across shards since pushes round-robin across them.
    pub fn reserve(&self, n: usize) {
        if n == 0 {
            return;
        }
        let per_shard = (n + self.shards.len() - 1) / self.shards.len();
        for shard in &self.shards {
            shard.tasks.lock().unwrap().reserve(per_shard);
        }
    }

    /// Push a batch of ready tasks, round-robining across shards so no
    /// single sub-queue becomes a hotspot under a scheduling pass that
    /// just drained a large front-queue batch.
    pub fn push_batch(&self, tasks: impl IntoIterator<Item = TaskRef>) {
        for task in tasks {
            let shard = self.push_cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
            self.shards[shard].tasks.lock().unwrap().push_back(task);
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A consumer's view into the ready queue: remembers which shard to
    /// try first so repeated pops by the same worker spread out instead of
    /// piling onto shard 0.
    pub fn consumer(&self, start_shard: usize) -> Consumer<'_> {
        Consumer {
            queue: self,
            cursor: AtomicUsize::new(start_shard % self.shards.len()),
        }
    }
}

pub struct Consumer<'q> {
    queue: &'q ReadyQueue,
    cursor: AtomicUsize,
}

impl Consumer<'_> {
    /// Pop one ready task, scanning shards starting at this consumer's
    /// cursor and wrapping around once.
    pub fn pop(&self) -> Option<TaskRef> {
        let shard_count = self.queue.shards.len();
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..shard_count {
            let idx = (start + offset) % shard_count;
            if let Some(task) = self.queue.shards[idx].tasks.lock().unwrap().pop_front() {
                self.cursor.store((idx + 1) % shard_count, Ordering::Relaxed);
                self.queue.len.fetch_sub(1, Ordering::Relaxed);
                return Some(task);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskAction};

    #[test]
    fn fifo_within_a_shard() {
        let q = ReadyQueue::new(1);
        let a = Task::new(|_| TaskAction::ExitExec);
        let b = Task::new(|_| TaskAction::ExitExec);
        q.push_batch([a.clone(), b.clone()]);
        let c = q.consumer(0);
        assert!(TaskRef::ptr_eq(&c.pop().unwrap(), &a));
        assert!(TaskRef::ptr_eq(&c.pop().unwrap(), &b));
        assert!(c.pop().is_none());
    }

    #[test]
    fn multiple_consumers_drain_everything_exactly_once() {
        let q = ReadyQueue::new(4);
        for _ in 0..100 {
            q.push_batch([Task::new(|_| TaskAction::ExitExec)]);
        }
        let c1 = q.consumer(0);
        let c2 = q.consumer(2);
        let mut total = 0;
        loop {
            let mut got_any = false;
            if c1.pop().is_some() {
                total += 1;
                got_any = true;
            }
            if c2.pop().is_some() {
                total += 1;
                got_any = true;
            }
            if !got_any {
                break;
            }
        }
        assert_eq!(total, 100);
        assert!(q.is_empty());
    }
}
