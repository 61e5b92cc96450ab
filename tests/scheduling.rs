// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduler behavior across real worker threads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskcore::config::ThreadCount;
use taskcore::task::TaskStatus;
use taskcore::{Config, Scheduler, Task, TaskAction};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two tasks signal each other a fixed number of times, counting hops.
/// Exercises `Task::signal`/`receive_signal` waking a `Waiting` task back
/// through the scheduler.
#[test]
fn ping_pong_signals_drive_each_other() {
    init_tracing();
    let scheduler = Scheduler::new(
        Config::builder()
            .thread_count(ThreadCount::Fixed(2))
            .build(),
    )
    .unwrap();

    const HOPS: u64 = 200;
    let hops = Arc::new(AtomicU64::new(0));

    // Each task's peer slot is filled in once both tasks exist.
    let peer_of_a: Arc<Mutex<Option<taskcore::TaskRef>>> = Arc::new(Mutex::new(None));
    let peer_of_b: Arc<Mutex<Option<taskcore::TaskRef>>> = Arc::new(Mutex::new(None));

    // Every hop always signals the peer once more before possibly deciding
    // to stop, so the last hop still wakes the other side instead of
    // leaving it parked in `Waiting` forever.
    let hops_a = Arc::clone(&hops);
    let peer_of_a_ref = Arc::clone(&peer_of_a);
    let a = Task::new(move |task| {
        task.receive_signal();
        let n = hops_a.fetch_add(1, Ordering::Relaxed);
        if let Some(peer) = peer_of_a_ref.lock().unwrap().as_ref() {
            peer.signal();
        }
        if n >= HOPS {
            TaskAction::Delete
        } else {
            TaskAction::Yield
        }
    });

    let hops_b = Arc::clone(&hops);
    let peer_of_b_ref = Arc::clone(&peer_of_b);
    let b = Task::new(move |task| {
        task.receive_signal();
        let n = hops_b.fetch_add(1, Ordering::Relaxed);
        if let Some(peer) = peer_of_b_ref.lock().unwrap().as_ref() {
            peer.signal();
        }
        if n >= HOPS {
            TaskAction::Delete
        } else {
            TaskAction::Yield
        }
    });

    *peer_of_a.lock().unwrap() = Some(b.clone());
    *peer_of_b.lock().unwrap() = Some(a.clone());
    scheduler.post_wait(a.clone()).unwrap();
    scheduler.post_wait(b).unwrap();

    // Both tasks are posted wait-forever, so nothing runs until one side
    // is kicked by hand.
    a.signal();

    let outstanding = scheduler.wait_empty(Duration::from_secs(5));
    assert_eq!(outstanding, 0, "scheduler never drained");
    assert!(hops.load(Ordering::Relaxed) >= HOPS);
}

/// Ten thousand one-shot tasks, each incrementing a shared counter exactly
/// once, posted from outside any worker thread.
#[test]
fn ten_thousand_one_shots_each_run_exactly_once() {
    init_tracing();
    let scheduler = Scheduler::with_default_config().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        let counter = Arc::clone(&counter);
        scheduler
            .post_one_shot(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    let outstanding = scheduler.wait_empty(Duration::from_secs(10));
    assert_eq!(outstanding, 0);
    assert_eq!(counter.load(Ordering::Relaxed), 10_000);
}

/// A delayed task must not run before its deadline, and does run shortly
/// after it.
#[test]
fn delayed_task_waits_for_its_deadline() {
    init_tracing();
    let scheduler = Scheduler::with_default_config().unwrap();
    let ran_at = Arc::new(Mutex::new(None::<std::time::Instant>));

    let started = std::time::Instant::now();
    let ran_at_task = Arc::clone(&ran_at);
    let task = Task::new(move |_| {
        *ran_at_task.lock().unwrap() = Some(std::time::Instant::now());
        TaskAction::Delete
    });
    scheduler.post_delay(task, 200).unwrap();

    scheduler.wait_empty(Duration::from_secs(5));
    let ran_at = ran_at.lock().unwrap().expect("task never ran");
    assert!(
        ran_at.duration_since(started) >= Duration::from_millis(150),
        "task ran before its deadline"
    );
}

/// A signal is never lost by a concurrent wake, and a signaled task that
/// hasn't yet been observed stays signaled across a plain wake.
#[test]
fn signal_outranks_wake_and_is_never_downgraded() {
    let task = Task::new(|_| TaskAction::ExitExec);
    assert_eq!(task.status(), TaskStatus::Pending);

    task.wake();
    assert_eq!(task.status(), TaskStatus::Ready);

    task.signal();
    assert!(task.is_signaled());

    // A wake arriving after the signal must not downgrade it.
    task.wake();
    assert!(task.is_signaled());

    assert!(task.receive_signal());
    assert!(!task.is_signaled());
    assert_eq!(task.status(), TaskStatus::Pending);
    assert!(!task.receive_signal());
}

/// Several tasks posted with scattered deadlines run in roughly ascending
/// deadline order, matching the waiting queue's min-heap ordering.
#[test]
fn tasks_run_in_deadline_order() {
    init_tracing();
    let scheduler = Scheduler::new(
        Config::builder()
            .thread_count(ThreadCount::Fixed(1))
            .build(),
    )
    .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let deadlines = [80u64, 10, 50, 5, 30];

    for (i, delay) in deadlines.iter().enumerate() {
        let order = Arc::clone(&order);
        let task = Task::new(move |_| {
            order.lock().unwrap().push(i);
            TaskAction::Delete
        });
        scheduler.post_delay(task, *delay).unwrap();
    }

    scheduler.wait_empty(Duration::from_secs(5));
    let order = order.lock().unwrap();
    assert_eq!(order.len(), deadlines.len());

    let mut expected: Vec<usize> = (0..deadlines.len()).collect();
    expected.sort_by_key(|&i| deadlines[i]);
    assert_eq!(*order, expected);
}
