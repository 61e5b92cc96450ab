// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The IO core's close protocol against a fake in-memory readiness source:
//! a close racing an in-flight "completion" must not finalize until that
//! completion has actually been delivered, and must finalize exactly once.

#![cfg(feature = "io")]

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use taskcore::io::{Interest, IoCore, ReadinessEvent, ReadinessSource, SocketSubscription};
use taskcore::Config;

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<ReadinessEvent>>,
    cv: Condvar,
}

/// An in-memory stand-in for `Epoll`: events are injected directly by the
/// test instead of coming from the kernel. Cloning shares the same queue,
/// so the test can push events into the same instance the reactor thread
/// is draining.
#[derive(Clone, Default)]
struct FakeReadiness(Arc<Inner>);

impl FakeReadiness {
    fn push(&self, event: ReadinessEvent) {
        self.0.queue.lock().unwrap().push_back(event);
        self.0.cv.notify_all();
    }
}

impl ReadinessSource for FakeReadiness {
    fn register(&self, _fd: RawFd, _interest: Interest, _key: u64) -> io::Result<()> {
        Ok(())
    }

    fn modify(&self, _fd: RawFd, _interest: Interest, _key: u64) -> io::Result<()> {
        Ok(())
    }

    fn unregister(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadinessEvent>> {
        let mut queue = self.0.queue.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self
                .0
                .cv
                .wait_timeout(queue, timeout.unwrap_or(Duration::from_millis(50)))
                .unwrap();
            queue = guard;
        }
        Ok(queue.drain(..).collect())
    }

    fn wake(&self) {
        self.0.cv.notify_all();
    }
}

/// Reports every callback it receives over `tx`, and sleeps a little in
/// `on_recv_ready` to widen the window a concurrent `close` could race.
struct RecordingSubscription {
    tx: mpsc::Sender<&'static str>,
}

impl SocketSubscription for RecordingSubscription {
    fn on_recv_ready(&mut self) {
        let _ = self.tx.send("recv_ready");
        std::thread::sleep(Duration::from_millis(50));
    }

    fn on_close(&mut self) {
        let _ = self.tx.send("close");
    }
}

#[test]
fn close_waits_for_in_flight_event_and_finalizes_once() {
    let reactor = FakeReadiness::default();
    let injector = reactor.clone();
    let core = IoCore::with_reactor(Config::default(), reactor).unwrap();

    let (tx, rx) = mpsc::channel();
    let io_task = core
        .register(
            // Deliberately not a real, currently-open fd: this backend never
            // touches it at all beyond what's registered here.
            1_000_123,
            Interest::READABLE,
            Box::new(RecordingSubscription { tx }),
        )
        .unwrap();

    // Give the reactor a readiness event to process. The owning task's own
    // callback sends "recv_ready" as the very first thing it does, then
    // sleeps while still counted as an in-flight operation -- so once this
    // recv unblocks, a close raced against it is guaranteed to observe one
    // operation still outstanding, deterministically, with no sleep-based
    // guessing.
    injector.push(ReadinessEvent {
        key: 0,
        readiness: Interest::READABLE,
    });
    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, "recv_ready");

    core.close(&io_task);

    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, "close");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "close fired more than once");
}

#[test]
fn close_with_nothing_in_flight_finalizes_immediately() {
    let reactor = FakeReadiness::default();
    let core = IoCore::with_reactor(Config::default(), reactor).unwrap();

    let (tx, rx) = mpsc::channel();
    let io_task = core
        .register(1_000_124, Interest::READABLE, Box::new(RecordingSubscription { tx }))
        .unwrap();

    core.close(&io_task);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "close");
}
