// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: the unit of scheduling.
//!
//! A task wraps a callback and a status word. It moves between the front,
//! waiting and ready queues as the scheduler processes it, and is executed
//! at most once per visit to the ready queue.

mod builder;
mod oneshot;
mod state;

pub use builder::TaskBuilder;
pub use oneshot::spawn_one_shot;
pub use state::TaskStatus;

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::clock::INFINITE;
use crate::queue::front::{Linked, Links};
use state::StatusCell;

#[cfg(feature = "io")]
use crate::io::IoFields;

/// What a task's callback asks the worker to do once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// The task is done for good: deallocate it after this call.
    Delete,
    /// The task is done for good, but the caller retains its own handle
    /// and is responsible for the task's lifetime (no extra bookkeeping
    /// needed on the scheduler side beyond not rescheduling it).
    ExitExec,
    /// Re-arm the task: it goes back to `Pending` and will be considered
    /// for scheduling again next time something wakes, signals, or its
    /// deadline (if any) elapses.
    Yield,
}

pub type TaskCallback = Box<dyn FnMut(&Task) -> TaskAction + Send>;

/// Internal trait a task uses to re-post itself to its owning scheduler's
/// front queue after being woken or signaled while `Waiting`, and to query
/// that scheduler's clock. Implemented by `scheduler::SchedulerShared`; kept
/// as a trait (rather than a direct dependency on the scheduler module) so
/// `task` and `scheduler` don't form a hard cyclic module dependency.
pub(crate) trait Reposter: Send + Sync {
    fn repost(&self, task: TaskRef, via_signal: bool);
    fn now_ms(&self) -> u64;
}

pub struct Task {
    links: Links<Task>,
    heap_index: AtomicI32,
    status: StatusCell,
    deadline: AtomicU64,
    is_expired: AtomicBool,
    callback: Mutex<TaskCallback>,
    scheduler: Mutex<Option<Weak<dyn Reposter>>>,
    #[cfg(feature = "io")]
    io: Option<IoFields>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status.load(Ordering::Relaxed))
            .field("deadline", &self.deadline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a new task with the given callback, not yet attached to any
    /// scheduler. Call [`Scheduler::post`](crate::Scheduler::post) (or one
    /// of its `post_*` variants) to schedule it.
    pub fn new(callback: impl FnMut(&Task) -> TaskAction + Send + 'static) -> TaskRef {
        TaskRef(Arc::new(Task {
            links: Links::new(),
            heap_index: AtomicI32::new(-1),
            status: StatusCell::new(TaskStatus::Pending),
            deadline: AtomicU64::new(0),
            is_expired: AtomicBool::new(false),
            callback: Mutex::new(Box::new(callback)),
            scheduler: Mutex::new(None),
            #[cfg(feature = "io")]
            io: None,
        }))
    }

    /// Create a task coupled to a kernel descriptor: its callback is the
    /// fixed dispatcher that delivers accumulated readiness (or the final
    /// close) to `subscription`, matching `spec.md` §3's IO-only fields
    /// living directly on the task rather than on a side type.
    #[cfg(feature = "io")]
    pub(crate) fn new_io(
        fd: std::os::unix::io::RawFd,
        key: u64,
        subscription: Box<dyn crate::io::SocketSubscription>,
    ) -> TaskRef {
        TaskRef(Arc::new(Task {
            links: Links::new(),
            heap_index: AtomicI32::new(-1),
            status: StatusCell::new(TaskStatus::Pending),
            deadline: AtomicU64::new(0),
            is_expired: AtomicBool::new(false),
            callback: Mutex::new(Box::new(io_dispatch_callback)),
            scheduler: Mutex::new(None),
            io: Some(IoFields::new(fd, key, subscription)),
        }))
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load(Ordering::Relaxed)
    }

    pub fn is_signaled(&self) -> bool {
        self.status() == TaskStatus::Signaled
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired.load(Ordering::Relaxed)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    /// Replace the deadline outright. Takes effect the next time the
    /// scheduler observes this task in the front queue.
    pub fn set_delay(&self, delay_ms: u64) {
        self.set_deadline_raw(delay_ms.saturating_add(now_hint()));
    }

    pub fn set_deadline(&self, deadline_ms: u64) {
        self.set_deadline_raw(deadline_ms);
    }

    /// Only move the deadline earlier, never later -- used when several
    /// independent timeouts might apply to the same task and the earliest
    /// one should win.
    pub fn adjust_delay(&self, delay_ms: u64) {
        self.adjust_deadline(delay_ms.saturating_add(now_hint()));
    }

    pub fn adjust_deadline(&self, deadline_ms: u64) {
        let mut cur = self.deadline.load(Ordering::Relaxed);
        while deadline_ms < cur {
            match self.deadline.compare_exchange_weak(
                cur,
                deadline_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Wait forever: only an explicit wake or signal will schedule this
    /// task again.
    pub fn set_wait(&self) {
        self.set_deadline_raw(INFINITE);
    }

    fn set_deadline_raw(&self, v: u64) {
        self.deadline.store(v, Ordering::Relaxed);
    }

    pub(crate) fn clear_deadline_on_entry(&self) {
        self.deadline.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_expired(&self, v: bool) {
        self.is_expired.store(v, Ordering::Relaxed);
    }

    pub(crate) fn heap_index(&self) -> i32 {
        self.heap_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_heap_index(&self, idx: i32) {
        self.heap_index.store(idx, Ordering::Relaxed);
    }

    pub(crate) fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    pub(crate) fn attach_scheduler(&self, scheduler: Weak<dyn Reposter>) {
        let mut slot = self.scheduler.lock().unwrap();
        debug_assert!(
            slot.is_none(),
            "a task must not be posted while already owned by a scheduler"
        );
        *slot = Some(scheduler);
    }

    pub(crate) fn detach_scheduler(&self) {
        *self.scheduler.lock().unwrap() = None;
    }

    /// # Safety
    /// `self` must currently be managed by a live `Arc<Task>` (true for
    /// every `Task` reachable from outside this module, since the only
    /// public constructor returns a `TaskRef`).
    fn self_ref(&self) -> TaskRef {
        unsafe {
            let ptr = self as *const Task;
            Arc::increment_strong_count(ptr);
            TaskRef(Arc::from_raw(ptr))
        }
    }

    fn repost_if_waiting(&self, was_waiting: bool, via_signal: bool) {
        if !was_waiting {
            return;
        }
        let scheduler = self.scheduler.lock().unwrap().clone();
        if let Some(weak) = scheduler {
            if let Some(shared) = weak.upgrade() {
                shared.repost(self.self_ref(), via_signal);
            }
        }
    }

    /// `PostWakeup`: ask for this task to run again. Never downgrades a
    /// signaled task and is a no-op if already ready.
    pub fn wake(&self) {
        let was_waiting = self.status.wake();
        self.repost_if_waiting(was_waiting, false);
    }

    /// `PostSignal`: ask for this task to run again *and* record a signal
    /// the callback can observe with [`receive_signal`](Self::receive_signal).
    pub fn signal(&self) {
        let was_waiting = self.status.signal();
        self.repost_if_waiting(was_waiting, true);
    }

    /// Consume a pending signal. Returns `true` if one was pending.
    pub fn receive_signal(&self) -> bool {
        self.status.receive_signal()
    }

    /// Run the callback, matching `Task::PrivExecute`: touch-check, reset
    /// the deadline to zero, then invoke. The task must not be accessed
    /// afterwards if the callback returned `Delete`.
    pub(crate) fn execute(&self) -> TaskAction {
        self.clear_deadline_on_entry();
        let mut callback = self.callback.lock().unwrap();
        (callback)(self)
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_fields(&self) -> Option<&IoFields> {
        self.io.as_ref()
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_fd_key(&self) -> Option<(std::os::unix::io::RawFd, u64)> {
        self.io.as_ref().map(|io| (io.fd, io.key))
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_merge_pending(&self, bits: crate::io::Interest) {
        if let Some(io) = &self.io {
            io.merge_pending(bits);
        }
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_publish_ready(&self) {
        if let Some(io) = &self.io {
            io.publish_ready();
        }
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_is_closing(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.is_closing())
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_begin_close(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.begin_close())
    }

    #[cfg(feature = "io")]
    pub(crate) fn io_finalize_close(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.finalize_close())
    }

    #[cfg(test)]
    pub(crate) fn set_deadline_for_test(&self, deadline_ms: u64) {
        self.set_deadline_raw(deadline_ms);
    }
}

/// The fixed callback every IO-coupled task runs: deliver whatever readiness
/// accumulated since the last turn, or -- once the close protocol has
/// finalized -- the single closing callback, then retire the task for good.
/// Running this from inside `Task::execute` (always on a worker thread,
/// always at most once per task at a time) is what gives socket callbacks
/// the same "invoked on worker threads, serialized per task" guarantee every
/// other task callback already has.
#[cfg(feature = "io")]
fn io_dispatch_callback(task: &Task) -> TaskAction {
    let io = task
        .io_fields()
        .expect("io_dispatch_callback invoked on a task with no io fields");
    if io.is_closed() {
        io.dispatch_close();
        return TaskAction::Delete;
    }
    io.dispatch_ready();
    TaskAction::Yield
}

/// An owning, reference-counted handle to a [`Task`].
///
/// Cloning a `TaskRef` is cheap (an `Arc` clone) and shares the same
/// underlying task; this is the type every queue and every public API
/// passes around.
pub struct TaskRef(Arc<Task>);

impl TaskRef {
    pub fn ptr_eq(a: &TaskRef, b: &TaskRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn attach_scheduler(&self, scheduler: Weak<dyn Reposter>) {
        self.0.attach_scheduler(scheduler);
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        TaskRef(Arc::clone(&self.0))
    }
}

impl Deref for TaskRef {
    type Target = Task;
    fn deref(&self) -> &Task {
        &self.0
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

unsafe impl Linked for Task {
    type Handle = TaskRef;

    fn into_ptr(handle: TaskRef) -> NonNull<Task> {
        let ptr = Arc::into_raw(handle.0) as *mut Task;
        unsafe { NonNull::new_unchecked(ptr) }
    }

    unsafe fn from_ptr(ptr: NonNull<Task>) -> TaskRef {
        unsafe { TaskRef(Arc::from_raw(ptr.as_ptr())) }
    }

    unsafe fn links(ptr: NonNull<Task>) -> NonNull<Links<Task>> {
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*ptr.as_ptr()).links)) }
    }
}

thread_local! {
    /// The scheduler currently executing a callback on this thread, if any.
    /// Set by `SchedulerShared::execute` around the callback invocation and
    /// cleared on return -- the same "thread-local current scheduler
    /// pointer, set on worker entry and cleared on worker exit" shape the
    /// Design Notes call for, used here so a task can still reach its
    /// scheduler's clock even though `Task::scheduler` itself is detached
    /// before the callback runs.
    static CURRENT_SCHEDULER: Cell<Option<*const dyn Reposter>> = Cell::new(None);
}

/// RAII guard installing `scheduler` as the current thread's scheduler for
/// the duration of a callback invocation.
pub(crate) struct CurrentSchedulerGuard;

impl CurrentSchedulerGuard {
    /// # Safety
    /// `scheduler` must outlive the guard.
    pub(crate) unsafe fn enter(scheduler: &dyn Reposter) -> Self {
        let ptr: *const dyn Reposter = scheduler;
        CURRENT_SCHEDULER.with(|cell| cell.set(Some(ptr)));
        Self
    }
}

impl Drop for CurrentSchedulerGuard {
    fn drop(&mut self) {
        CURRENT_SCHEDULER.with(|cell| cell.set(None));
    }
}

fn current_scheduler_now_ms() -> Option<u64> {
    CURRENT_SCHEDULER.with(|cell| {
        // Safety: only ever set by `CurrentSchedulerGuard::enter`, which
        // guarantees the referent outlives the guard, and the guard's
        // lifetime brackets every access made from this thread.
        cell.get().map(|ptr| unsafe { (*ptr).now_ms() })
    })
}

/// "Now" for deadline math on a task mid-callback or not yet posted
/// anywhere. Prefers the clock of the scheduler currently executing this
/// thread's callback (see [`CURRENT_SCHEDULER`]), since a task's own
/// `scheduler` back-reference is cleared before its callback runs and
/// `set_delay`/`adjust_delay` are the standard way a callback re-arms its
/// own deadline before returning `Yield`. Falls back to a process-wide
/// monotonic origin only for a task that has never run under any scheduler
/// on this thread -- merely monotonic, not meant to agree with any
/// particular scheduler's clock.
fn now_hint() -> u64 {
    if let Some(now) = current_scheduler_now_ms() {
        return now;
    }
    use std::sync::OnceLock;
    use std::time::Instant;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}
