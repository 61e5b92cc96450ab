// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The migrating scheduler role and the scheduling pass.
//!
//! There is no dedicated dispatcher thread. Any worker that finds the
//! scheduler role free takes it, runs one [`schedule_pass`](SchedulerShared::schedule_pass),
//! and releases it; the rest execute whatever is ready. Releasing the role
//! always signals the ready-queue condition, even if nothing was scheduled
//! -- skipping that signal is how you get every worker asleep at once with
//! ready work sitting untouched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::clock::{Clock, INFINITE};
use crate::config::Config;
use crate::error::Closed;
use crate::queue::front::FrontQueue;
use crate::queue::ready::ReadyQueue;
use crate::queue::waiting::WaitingQueue;
use crate::signal::Signal;
use crate::stats::{Counters, Stats};
use crate::task::{CurrentSchedulerGuard, Reposter, Task, TaskAction, TaskRef, TaskStatus};
use crate::worker::WorkerPool;

#[cfg(feature = "io")]
use std::collections::HashMap;
#[cfg(feature = "io")]
use std::os::unix::io::RawFd;
#[cfg(feature = "io")]
use std::sync::atomic::AtomicU64;

#[cfg(feature = "io")]
use crate::io::{Interest, ReadinessEvent, ReadinessSource, SocketSubscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassOutcome {
    Busy,
    Done,
    Finished,
}

/// State shared between every worker thread and the public [`Scheduler`]
/// handle. Kept separate from `Scheduler` itself so tasks can hold a `Weak`
/// reference to it (via [`Reposter`]) without keeping worker threads alive.
pub(crate) struct SchedulerShared {
    front: FrontQueue<Task>,
    front_signal: Signal,
    pending: Mutex<VecDeque<TaskRef>>,
    waiting: Mutex<WaitingQueue>,
    ready: ReadyQueue,
    ready_signal: Signal,
    clock: Clock,
    scheduler_role: AtomicBool,
    stopped: AtomicBool,
    /// Tasks popped off the ready queue but not yet finished executing.
    /// Counted separately so `wait_empty` doesn't report a false "empty"
    /// in the window between a task leaving the ready queue and its
    /// callback actually returning.
    in_flight: AtomicUsize,
    counters: Counters,
    sched_batch_size: u32,
    pub(crate) exec_batch_size: u32,
    /// The kernel event source, if this scheduler was built with one
    /// attached (`spec.md` §4.5 step 1, §4.8's IO core). `None` for a plain
    /// `Scheduler::new` even when the `io` feature is compiled in.
    #[cfg(feature = "io")]
    readiness: Option<Arc<dyn ReadinessSource>>,
    /// Registration key -> owning task, so a drained kernel event can find
    /// the task it belongs to.
    #[cfg(feature = "io")]
    io_tasks: Mutex<HashMap<u64, TaskRef>>,
    #[cfg(feature = "io")]
    next_io_key: AtomicU64,
}

impl SchedulerShared {
    fn new(config: &Config) -> Self {
        let stub = Task::new(|_| TaskAction::ExitExec);
        let thread_count = config.thread_count();
        let sub_queue_size = config.sub_queue_size();
        let ready = ReadyQueue::new(thread_count.max(1));
        ready.reserve(config.reserve());
        Self {
            front: FrontQueue::new_with_stub(stub),
            front_signal: Signal::new(),
            pending: Mutex::new(VecDeque::new()),
            waiting: Mutex::new(WaitingQueue::new()),
            ready,
            ready_signal: Signal::new(),
            clock: Clock::new(),
            scheduler_role: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
            sched_batch_size: (sub_queue_size * thread_count).max(1) as u32,
            exec_batch_size: sub_queue_size.max(1) as u32,
            #[cfg(feature = "io")]
            readiness: None,
            #[cfg(feature = "io")]
            io_tasks: Mutex::new(HashMap::new()),
            #[cfg(feature = "io")]
            next_io_key: AtomicU64::new(0),
        }
    }

    #[cfg(feature = "io")]
    fn new_with_reactor(config: &Config, reactor: Arc<dyn ReadinessSource>) -> Self {
        let mut shared = Self::new(config);
        shared.readiness = Some(reactor);
        shared
    }

    pub(crate) fn ready_consumer(&self, start_shard: usize) -> crate::queue::ready::Consumer<'_> {
        self.ready.consumer(start_shard)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.front_signal.send();
        #[cfg(feature = "io")]
        if let Some(readiness) = &self.readiness {
            readiness.wake();
        }
    }

    pub(crate) fn wait_ready(&self) {
        self.ready_signal.receive_blocking();
    }

    pub(crate) fn signal_ready(&self) {
        self.ready_signal.send();
    }

    fn push_front(&self, task: TaskRef) {
        if self.front.push(task) {
            self.front_signal.send();
            #[cfg(feature = "io")]
            if let Some(readiness) = &self.readiness {
                readiness.wake();
            }
        }
    }

    fn post(shared: &Arc<SchedulerShared>, task: TaskRef) -> Result<(), Closed> {
        if shared.is_stopped() {
            tracing::debug!("post() rejected, scheduler is stopped");
            return Err(Closed(()));
        }
        let weak: Weak<dyn Reposter> = Arc::downgrade(shared);
        task.attach_scheduler(weak);
        shared.push_front(task);
        Ok(())
    }

    fn move_to_waiting(&self, task: TaskRef) {
        self.waiting.lock().unwrap().push(task);
    }

    fn remove_from_waiting(&self, heap_index: i32) {
        self.waiting.lock().unwrap().remove(heap_index);
    }

    /// Block until the next wakeup source: a front-queue push, a kernel
    /// event, or `timeout` elapsing. When a reactor is attached, its
    /// `wait` is the single blocking primitive for all three -- `push_front`
    /// and `request_stop` both also call `readiness.wake()`, and any
    /// harvested events are processed exactly like `schedule_pass` step 1
    /// does before looping back.
    fn park(&self, timeout: Option<Duration>) {
        #[cfg(feature = "io")]
        if let Some(readiness) = self.readiness.clone() {
            let events = readiness.wait(timeout).unwrap_or_default();
            if !events.is_empty() {
                let mut woken = Vec::new();
                self.apply_kernel_events(events, &mut woken);
                if !woken.is_empty() {
                    self.ready.push_batch(woken);
                    self.signal_ready();
                }
            }
            return;
        }
        match timeout {
            Some(d) => self.front_signal.receive_timed(d),
            None => self.front_signal.receive_blocking(),
        }
    }

    /// `spec.md` §4.5 step 1: drain whatever kernel events are currently
    /// available (non-blocking), merge each into its owning task's pending
    /// bitmask, and attempt the `Waiting` -> `Ready` CAS. A task that's not
    /// currently `Waiting` (e.g. still `Pending` in the front queue) simply
    /// keeps the merged bits for step 3 to pick up when it gets there.
    #[cfg(feature = "io")]
    fn apply_kernel_events(&self, events: Vec<ReadinessEvent>, ready_batch: &mut Vec<TaskRef>) {
        if events.is_empty() {
            return;
        }
        let io_tasks = self.io_tasks.lock().unwrap();
        for event in events {
            let Some(task) = io_tasks.get(&event.key).cloned() else {
                continue;
            };
            task.io_merge_pending(event.readiness);
            if task
                .status_cell()
                .try_transition(TaskStatus::Waiting, TaskStatus::Ready)
                .is_ok()
            {
                let idx = task.heap_index();
                if idx >= 0 {
                    self.remove_from_waiting(idx);
                }
                task.io_publish_ready();
                ready_batch.push(task);
            }
        }
    }

    #[cfg(feature = "io")]
    fn finalize_io_close(&self, task: &TaskRef) {
        if task.io_finalize_close() {
            if let Some((fd, key)) = task.io_fd_key() {
                if let Some(readiness) = &self.readiness {
                    let _ = readiness.unregister(fd);
                }
                self.io_tasks.lock().unwrap().remove(&key);
            }
        }
    }

    /// `TaskScheduler::PrivSchedule`: drain kernel events (IO core only),
    /// then the waiting queue of anything past its deadline, then the
    /// front queue, moving every newly-ready task into the ready queue, and
    /// block (holding the role) if there is truly nothing to do.
    pub(crate) fn schedule_pass(&self) -> PassOutcome {
        if self.scheduler_role.swap(true, Ordering::AcqRel) {
            return PassOutcome::Busy;
        }
        self.counters.scheduled_pass();
        let max_batch = self.sched_batch_size;

        let result = loop {
            let mut ready_batch: Vec<TaskRef> = Vec::new();
            let now = self.clock.now_ms();

            // 1. Drain kernel events (IO core only). Ordered before the
            // front-queue drain below and the waiting-queue check it's
            // combined with, per `spec.md` §4.5.
            #[cfg(feature = "io")]
            if let Some(readiness) = self.readiness.clone() {
                if let Ok(events) = readiness.wait(Some(Duration::ZERO)) {
                    self.apply_kernel_events(events, &mut ready_batch);
                }
            }

            // Waiting tasks are older than anything still in the front
            // queue, so they are handled next.
            {
                let mut waiting = self.waiting.lock().unwrap();
                let mut batch = 0u32;
                while batch < max_batch {
                    let Some(deadline) = waiting.peek().map(|t| t.deadline_ms()) else {
                        break;
                    };
                    if deadline > now {
                        break;
                    }
                    batch += 1;
                    let task = waiting.pop_min().unwrap();
                    task.set_expired(true);
                    if task
                        .status_cell()
                        .try_transition(TaskStatus::Waiting, TaskStatus::Ready)
                        .is_ok()
                    {
                        ready_batch.push(task);
                    }
                    // else: woken/signaled concurrently, already reposted
                    // through the front queue -- handled below instead.
                }
            }
            let expired_from_waiting = ready_batch.len() as u64;

            // 2 & 3. Front queue: drain into the pending buffer, then
            // dispatch up to a batch's worth. Leftovers stay in `pending`
            // for the next pass rather than being dropped.
            {
                let mut drained = Vec::new();
                self.front.drain_into(&mut drained);
                let mut pending = self.pending.lock().unwrap();
                pending.extend(drained);

                let mut batch = 0u32;
                while batch < max_batch {
                    let Some(task) = pending.pop_front() else {
                        break;
                    };
                    batch += 1;

                    #[cfg(feature = "io")]
                    if task.io_is_closing() {
                        self.finalize_io_close(&task);
                        let _ = task
                            .status_cell()
                            .try_transition(TaskStatus::Pending, TaskStatus::Ready);
                        let idx = task.heap_index();
                        if idx >= 0 {
                            drop(pending);
                            self.remove_from_waiting(idx);
                            pending = self.pending.lock().unwrap();
                        }
                        ready_batch.push(task);
                        continue;
                    }

                    let now = self.clock.now_ms();
                    let deadline = task.deadline_ms();
                    let mut went_to_waiting = false;

                    if now < deadline {
                        task.set_expired(false);
                        if task
                            .status_cell()
                            .try_transition(TaskStatus::Pending, TaskStatus::Waiting)
                            .is_ok()
                        {
                            if deadline != INFINITE {
                                drop(pending);
                                self.move_to_waiting(task.clone());
                                pending = self.pending.lock().unwrap();
                            } else {
                                debug_assert_eq!(task.heap_index(), -1);
                            }
                            went_to_waiting = true;
                        }
                        // else: CAS failed because the task was woken or
                        // signaled already -- fall through and make it
                        // ready despite the future deadline.
                    } else {
                        task.set_expired(true);
                        let _ = task
                            .status_cell()
                            .try_transition(TaskStatus::Pending, TaskStatus::Ready);
                    }

                    if !went_to_waiting {
                        let idx = task.heap_index();
                        if idx >= 0 {
                            drop(pending);
                            self.remove_from_waiting(idx);
                            pending = self.pending.lock().unwrap();
                        }
                        #[cfg(feature = "io")]
                        task.io_publish_ready();
                        ready_batch.push(task);
                    }
                }
            }

            self.counters.expired(expired_from_waiting);
            let produced_any = !ready_batch.is_empty();
            self.ready.push_batch(ready_batch);

            let pending_empty = self.pending.lock().unwrap().is_empty();
            if !produced_any && self.ready.is_empty() && pending_empty {
                let next_deadline = self.waiting.lock().unwrap().peek().map(|t| t.deadline_ms());
                match next_deadline {
                    Some(deadline) => {
                        let now = self.clock.now_ms();
                        if deadline > now {
                            self.park(Some(Duration::from_millis(deadline - now)));
                        }
                    }
                    None if self.is_stopped() => {
                        tracing::debug!("schedule_pass: stopped and nothing outstanding, finishing");
                        break PassOutcome::Finished;
                    }
                    None => self.park(None),
                }
                continue;
            }
            break PassOutcome::Done;
        };

        self.scheduler_role.store(false, Ordering::Release);
        // Always signal, even if nothing was scheduled: otherwise a
        // worker that just finished the pass above could go straight to
        // sleep waiting for ready tasks, followed by every other worker
        // doing the same, with nobody left to notice the role is free.
        self.signal_ready();
        result
    }

    /// `TaskScheduler::PrivExecute`: transition a popped task back to
    /// `Pending` before running it, and run it.
    pub(crate) fn execute(shared: &Arc<SchedulerShared>, task: TaskRef) {
        task.detach_scheduler();
        // `Ready` moves to `Pending` up front. A `Signaled` task is left
        // as-is going into the callback so it can observe the signal via
        // `Task::receive_signal`; if it doesn't, it's force-reset to
        // `Pending` below so the task is a clean slate the next time it's
        // posted.
        let _ = task
            .status_cell()
            .try_transition(TaskStatus::Ready, TaskStatus::Pending);
        shared.counters.executed(1);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let action = {
            // Safety: `shared` outlives this block, and the guard is
            // dropped before the block (and therefore `shared`'s borrow)
            // ends.
            let _guard = unsafe { CurrentSchedulerGuard::enter(&**shared) };
            task.execute()
        };
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        let _ = task
            .status_cell()
            .try_transition(TaskStatus::Signaled, TaskStatus::Pending);
        tracing::trace!(?action, "task executed");
        match action {
            TaskAction::Delete | TaskAction::ExitExec => {}
            TaskAction::Yield => {
                let _ = SchedulerShared::post(shared, task);
            }
        }
    }

    #[cfg(feature = "io")]
    fn register_io(
        shared: &Arc<SchedulerShared>,
        fd: RawFd,
        interest: Interest,
        subscription: Box<dyn SocketSubscription>,
    ) -> std::io::Result<TaskRef> {
        let readiness = shared
            .readiness
            .as_ref()
            .expect("register_io called on a scheduler with no reactor attached");
        let key = shared.next_io_key.fetch_add(1, Ordering::Relaxed);
        let task = Task::new_io(fd, key, subscription);
        readiness.register(fd, interest, key)?;
        shared.io_tasks.lock().unwrap().insert(key, task.clone());
        task.set_wait();
        SchedulerShared::post(shared, task.clone())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "scheduler is stopped"))?;
        Ok(task)
    }

    #[cfg(feature = "io")]
    fn close_io(task: &TaskRef) {
        if task.io_begin_close() {
            task.wake();
        }
    }

    #[cfg(feature = "io")]
    fn modify_io_interest(shared: &Arc<SchedulerShared>, task: &TaskRef, interest: Interest) -> std::io::Result<()> {
        let readiness = shared
            .readiness
            .as_ref()
            .expect("modify_io_interest called on a scheduler with no reactor attached");
        let (fd, key) = task
            .io_fd_key()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "not an io-coupled task"))?;
        readiness.modify(fd, interest, key)
    }
}

impl Reposter for SchedulerShared {
    fn repost(&self, task: TaskRef, via_signal: bool) {
        if via_signal {
            self.counters.signaled();
        } else {
            self.counters.woken();
        }
        self.push_front(task);
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// A running task scheduler: owns a pool of worker threads and the shared
/// queue/signal state they cooperate through.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: WorkerPool,
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Self, crate::error::SetupError> {
        let thread_count = config.thread_count();
        tracing::info!(thread_count, "starting scheduler");
        let shared = Arc::new(SchedulerShared::new(&config));
        let workers = WorkerPool::spawn(Arc::clone(&shared), thread_count);
        Ok(Self { shared, workers })
    }

    /// Start a scheduler with a socket-aware readiness source attached, so
    /// `schedule_pass` drains it as part of its regular kernel-event step.
    #[cfg(feature = "io")]
    pub(crate) fn new_with_reactor(
        config: Config,
        reactor: impl crate::io::ReadinessSource + 'static,
    ) -> Result<Self, crate::error::SetupError> {
        let thread_count = config.thread_count();
        tracing::info!(thread_count, "starting scheduler with io reactor");
        let shared = Arc::new(SchedulerShared::new_with_reactor(&config, Arc::new(reactor)));
        let workers = WorkerPool::spawn(Arc::clone(&shared), thread_count);
        Ok(Self { shared, workers })
    }

    pub fn with_default_config() -> Result<Self, crate::error::SetupError> {
        Self::new(Config::default())
    }

    /// The scheduler's own clock, in milliseconds since an arbitrary but
    /// fixed origin. The basis every `post_delay`/`post_deadline` deadline
    /// is computed against.
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Post a task to run as soon as the scheduler gets to it.
    pub fn post(&self, task: TaskRef) -> Result<(), Closed> {
        SchedulerShared::post(&self.shared, task)
    }

    /// Post a task to run no sooner than `delay_ms` from now, computed
    /// against this scheduler's own clock (not whatever clock the task may
    /// have last seen, which could belong to a different scheduler or to
    /// no scheduler at all).
    pub fn post_delay(&self, task: TaskRef, delay_ms: u64) -> Result<(), Closed> {
        let deadline = self.shared.clock.now_ms().saturating_add(delay_ms);
        task.set_deadline(deadline);
        self.post(task)
    }

    /// Post a task to run no sooner than the given absolute deadline, on
    /// the same basis as [`now_ms`](Self::now_ms).
    pub fn post_deadline(&self, task: TaskRef, deadline_ms: u64) -> Result<(), Closed> {
        task.set_deadline(deadline_ms);
        self.post(task)
    }

    /// Post a task that will not run until explicitly woken or signaled.
    pub fn post_wait(&self, task: TaskRef) -> Result<(), Closed> {
        task.set_wait();
        self.post(task)
    }

    /// Post a `FnOnce` to run exactly once.
    pub fn post_one_shot(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), Closed> {
        self.post(crate::task::spawn_one_shot(callback))
    }

    /// Couple a new task to `fd`, per `spec.md` §4.8's IO core. Only valid
    /// on a scheduler started with a reactor attached (see [`IoCore`](crate::io::IoCore)).
    #[cfg(feature = "io")]
    pub fn register_io(
        &self,
        fd: std::os::unix::io::RawFd,
        interest: crate::io::Interest,
        subscription: Box<dyn crate::io::SocketSubscription>,
    ) -> std::io::Result<TaskRef> {
        SchedulerShared::register_io(&self.shared, fd, interest, subscription)
    }

    #[cfg(feature = "io")]
    pub fn modify_io_interest(&self, task: &TaskRef, interest: crate::io::Interest) -> std::io::Result<()> {
        SchedulerShared::modify_io_interest(&self.shared, task, interest)
    }

    /// Begin the close protocol for an IO-coupled task: mark it `Closing`
    /// and wake it so `schedule_pass` step 3 finalizes it (unregister, one
    /// last `on_close`) the next time it passes through.
    #[cfg(feature = "io")]
    pub fn close_io(&self, task: &TaskRef) {
        SchedulerShared::close_io(task);
    }

    /// Block until every queue (front, pending, waiting, ready) is empty,
    /// or `timeout` elapses. Returns the number of tasks still outstanding
    /// when it returned -- zero means everything really did drain.
    pub fn wait_empty(&self, timeout: Duration) -> usize {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding_count();
            if outstanding == 0 || std::time::Instant::now() >= deadline {
                return outstanding;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn outstanding_count(&self) -> usize {
        self.shared.front.len()
            + self.shared.pending.lock().unwrap().len()
            + self.shared.waiting.lock().unwrap().len()
            + self.shared.ready.len()
            + self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting new tasks and shut every worker thread down once
    /// all four queues have drained.
    pub fn stop(mut self) {
        tracing::info!("stopping scheduler");
        self.shared.request_stop();
        self.workers.join();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // `stop` consumes `self` to join worker threads; if the caller
        // drops the scheduler without calling it, at least make sure the
        // workers notice and wind down on their own instead of parking on
        // the front signal forever.
        self.shared.request_stop();
    }
}
