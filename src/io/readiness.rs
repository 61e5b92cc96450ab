// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The abstract readiness-source interface and the per-descriptor state a
//! task carries when it's coupled to a kernel socket.
//!
//! `spec.md` §4.8 asks for one interface that unifies readiness-oriented
//! backends (epoll, kqueue: "this fd is now readable/writable, check
//! yourself") and completion-oriented backends (IOCP, io_uring: "this
//! specific read of N bytes finished"). `taskcore` only ships the epoll
//! backend ([`epoll`](super::epoll)), but the trait is shaped so a
//! completion-oriented backend could merge results into the same
//! [`ReadinessEvent`] batch instead of having its own parallel path.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;

use super::subscription::SocketSubscription;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR    = 0b100;
    }
}

/// One batch of events as reported by a readiness source: a descriptor's
/// opaque registration key plus the bits that fired.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    pub key: u64,
    pub readiness: Interest,
}

/// What a concrete kernel event-multiplexing backend must provide.
pub trait ReadinessSource: Send + Sync {
    /// Start watching `fd` for `interest`, tagging future events for it
    /// with `key`.
    fn register(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()>;

    /// Change the watched interest for an already-registered `fd`.
    fn modify(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()>;

    /// Stop watching `fd`. Must be called before the descriptor is closed.
    fn unregister(&self, fd: RawFd) -> io::Result<()>;

    /// Block for up to `timeout` (or forever if `None`) and return however
    /// many events are currently available, merging repeated readiness on
    /// the same key into one entry.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadinessEvent>>;

    /// Unblock a concurrent or future `wait` call immediately.
    fn wake(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IoState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// The IO-only state `spec.md` §3 lists directly on the task data model:
/// the descriptor, the pending/ready event masks, an in-flight operation
/// count, and the close substate. Embedded in [`Task`](crate::task::Task)
/// (behind the `io` feature) rather than living on a separate wrapper type,
/// so the scheduler's own `schedule_pass` can drive it as part of the same
/// CAS-merge algorithm every other task goes through.
pub(crate) struct IoFields {
    pub(crate) fd: RawFd,
    pub(crate) key: u64,
    state: AtomicU8,
    pending_events: AtomicU8,
    ready_events: AtomicU8,
    operation_count: std::sync::atomic::AtomicUsize,
    subscription: Mutex<Box<dyn SocketSubscription>>,
}

impl IoFields {
    pub(crate) fn new(fd: RawFd, key: u64, subscription: Box<dyn SocketSubscription>) -> Self {
        Self {
            fd,
            key,
            state: AtomicU8::new(IoState::Open as u8),
            pending_events: AtomicU8::new(0),
            ready_events: AtomicU8::new(0),
            operation_count: std::sync::atomic::AtomicUsize::new(0),
            subscription: Mutex::new(subscription),
        }
    }

    /// Merge newly-observed readiness into the pending bitmask, matching
    /// the "readiness-oriented backends merge bits with OR" rule in
    /// `spec.md` §4.8. Called from `schedule_pass` step 1, which holds the
    /// scheduler role, so this needs no further synchronization against
    /// itself.
    pub(crate) fn merge_pending(&self, bits: Interest) {
        self.pending_events.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Move whatever accumulated in `pending_events` into `ready_events`,
    /// the step every task transitioning into `Ready` goes through (`spec.md`
    /// §4.5 step 3's "move pending_events to ready_events, clear pending").
    pub(crate) fn publish_ready(&self) {
        let pending = self.pending_events.swap(0, Ordering::AcqRel);
        if pending != 0 {
            self.ready_events.fetch_or(pending, Ordering::AcqRel);
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) == IoState::Closing as u8
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == IoState::Closed as u8
    }

    /// `Open` -> `Closing`. Returns whether this call performed the move
    /// (idempotent: a second `post_close` on an already-closing task is a
    /// harmless no-op).
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                IoState::Open as u8,
                IoState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Closing` -> `Closed`. Called from `schedule_pass` step 3, which
    /// only ever runs on whichever thread currently holds the scheduler
    /// role, so the compare-exchange here is really just a single-writer
    /// guard against the same task somehow reaching this twice.
    pub(crate) fn finalize_close(&self) -> bool {
        self.state
            .compare_exchange(
                IoState::Closing as u8,
                IoState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Dispatch whatever readiness accumulated since the last turn to the
    /// subscriber, then clear it. Called from inside the owning task's own
    /// callback (`Task::execute`, always on a worker thread), so this can
    /// never run concurrently with itself or with `dispatch_close` for the
    /// same task -- the serialization `spec.md` §6 requires.
    pub(crate) fn dispatch_ready(&self) {
        let bits = self.ready_events.swap(0, Ordering::AcqRel);
        if bits == 0 {
            return;
        }
        self.operation_count.fetch_add(1, Ordering::AcqRel);
        let readiness = Interest::from_bits_truncate(bits);
        {
            let mut sub = self.subscription.lock().unwrap();
            if readiness.contains(Interest::ERROR) {
                let err = io::Error::new(io::ErrorKind::Other, "socket error reported by readiness source");
                sub.on_error(&err);
            }
            if readiness.contains(Interest::READABLE) {
                sub.on_recv_ready();
            }
            if readiness.contains(Interest::WRITABLE) {
                sub.on_send_ready();
            }
            sub.on_event(
                readiness.contains(Interest::READABLE),
                readiness.contains(Interest::WRITABLE),
            );
        }
        self.operation_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn dispatch_close(&self) {
        self.subscription.lock().unwrap().on_close();
    }
}
