// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task status state machine and its exact atomic orderings.
//!
//! Transitions and their memory ordering are carried over verbatim from
//! `mg::sch::Task`'s `PostWakeup`/`PostSignal`/`ReceiveSignal`/`PrivExecute`:
//! task status can be read and written with relaxed ordering everywhere
//! *except* the wake/signal/receive-signal boundary, because every status
//! change that matters to another thread is additionally observed through
//! an acquire/release pair on the front queue (every task that transitions
//! out of `Waiting` is re-pushed there) -- the front queue is what actually
//! carries the happens-before edge, not the status word itself.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Not scheduled, not running: either brand new or just finished a
    /// callback invocation.
    Pending = 0,
    /// In the waiting queue (or about to be), asleep until its deadline or
    /// an explicit wake/signal.
    Waiting = 1,
    /// In the ready queue (or about to be), will run on its next turn.
    Ready = 2,
    /// Ready, but additionally carrying a signal the callback can observe
    /// via `receive_signal`. Outranks `Ready`: once signaled, a task can
    /// never be silently downgraded back to plain `Ready`.
    Signaled = 3,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Waiting,
            2 => TaskStatus::Ready,
            3 => TaskStatus::Signaled,
            _ => unreachable!("invalid task status byte"),
        }
    }
}

#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(initial: TaskStatus) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self, order: Ordering) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(order))
    }

    /// `PostWakeup`: move `Waiting`/`Pending` to `Ready`. A no-op if the
    /// task is already `Ready` or `Signaled` -- signaled status is never
    /// downgraded, and a second wakeup on an already-ready task changes
    /// nothing.
    ///
    /// Returns `true` if the task was `Waiting` and must be re-posted to
    /// the front queue so the scheduler picks it back up.
    pub fn wake(&self) -> bool {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let status = TaskStatus::from_u8(old);
            if status == TaskStatus::Signaled || status == TaskStatus::Ready {
                return false;
            }
            match self.0.compare_exchange_weak(
                old,
                TaskStatus::Ready as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return status == TaskStatus::Waiting,
                Err(cur) => old = cur,
            }
        }
    }

    /// `PostSignal`: unconditionally move to `Signaled`, released so the
    /// signal value set before calling this is visible to whichever
    /// thread later calls `receive_signal`.
    ///
    /// Returns `true` if the task was `Waiting` and must be re-posted.
    pub fn signal(&self) -> bool {
        let old = self.0.swap(TaskStatus::Signaled as u8, Ordering::Release);
        TaskStatus::from_u8(old) == TaskStatus::Waiting
    }

    /// `ReceiveSignal`: consume a pending signal, moving `Signaled` back
    /// to `Pending`. Acquire so that whatever the signaling thread wrote
    /// before calling `signal` is visible here.
    pub fn receive_signal(&self) -> bool {
        self.0
            .compare_exchange(
                TaskStatus::Signaled as u8,
                TaskStatus::Pending as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Scheduler-only: try to move from `from` to `to`. All scheduler-side
    /// transitions are relaxed; see the module doc for why that's sound.
    pub fn try_transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::Relaxed, Ordering::Relaxed)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }
}
