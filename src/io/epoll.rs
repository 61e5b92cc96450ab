// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Linux `epoll` [`ReadinessSource`] backend.
//!
//! kqueue/IOCP/io_uring backends are acknowledged by the trait but not
//! implemented here -- out of scope the same way `spec.md` scopes out
//! "platform-specific I/O multiplexing primitives" in general, epoll is
//! the one concrete backend kept in-tree so the IO core extension is
//! actually exercisable end to end.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::readiness::{Interest, ReadinessEvent, ReadinessSource};

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn interest_to_epoll_events(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.contains(Interest::READABLE) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    events | libc::EPOLLRDHUP as u32
}

fn epoll_events_to_interest(events: u32) -> Interest {
    let mut interest = Interest::empty();
    if events & (libc::EPOLLIN as u32) != 0 {
        interest |= Interest::READABLE;
    }
    if events & (libc::EPOLLOUT as u32) != 0 {
        interest |= Interest::WRITABLE;
    }
    if events & ((libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32) != 0 {
        interest |= Interest::ERROR;
    }
    interest
}

/// An `epoll`-backed [`ReadinessSource`], with a dedicated `eventfd` used
/// purely to unblock a concurrent `epoll_wait` on demand ([`wake`](Self::wake)).
pub struct Epoll {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    keys: Mutex<HashMap<RawFd, u64>>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { check(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        let wake_fd = unsafe { check(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))? };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: u64::MAX, // reserved key for the wake descriptor
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event as *mut _)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            keys: Mutex::new(HashMap::new()),
        })
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

impl ReadinessSource for Epoll {
    fn register(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()> {
        self.keys.lock().unwrap().insert(fd, key);
        let mut event = libc::epoll_event {
            events: interest_to_epoll_events(interest),
            u64: key,
        };
        unsafe { check(libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event as *mut _))? };
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll_events(interest),
            u64: key,
        };
        unsafe { check(libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event as *mut _))? };
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.keys.lock().unwrap().remove(&fd);
        unsafe {
            check(libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ))?
        };
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadinessEvent>> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(self.epoll_fd, raw.as_mut_ptr(), raw.len() as i32, timeout_ms)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break rc as usize;
        };

        let mut events = Vec::with_capacity(n);
        for raw_event in &raw[..n] {
            if raw_event.u64 == u64::MAX {
                // Wake descriptor: drain it so the next epoll_wait doesn't
                // spuriously return immediately.
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }
            events.push(ReadinessEvent {
                key: raw_event.u64,
                readiness: epoll_events_to_interest(raw_event.events),
            });
        }
        Ok(events)
    }

    fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            );
        }
    }
}
