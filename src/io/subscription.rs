// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The callback surface a socket owner implements.
//!
//! Mirrors the external interface table in `spec.md` §6: one method per
//! event kind, each with a no-op default so a subscriber only needs to
//! override what it actually cares about -- the same "small trait, default
//! methods" shape as `Schedule` in `libs/kasync/src/task.rs`, rather than
//! one large callback struct with function-pointer fields.

use std::io;

/// Per-socket event callbacks. Delivered from inside the owning task's own
/// callback turn on a worker thread -- the same serialization guarantee
/// every other task callback has, since a task is never executed by more
/// than one worker at a time. None of these methods are ever called
/// concurrently for the same subscription, and `on_close` is always the
/// last call a subscription receives.
pub trait SocketSubscription: Send {
    fn on_connect(&mut self) {}
    fn on_connect_error(&mut self, _err: &io::Error) {}
    fn on_recv_ready(&mut self) {}
    fn on_recv_error(&mut self, _err: &io::Error) {}
    fn on_send_ready(&mut self) {}
    fn on_send_error(&mut self, _err: &io::Error) {}
    fn on_error(&mut self, _err: &io::Error) {}
    fn on_close(&mut self) {}
    /// Catch-all, called after the more specific callbacks above, useful
    /// for subscribers that just want the raw readiness bitmask.
    fn on_event(&mut self, _readable: bool, _writable: bool) {}
}
