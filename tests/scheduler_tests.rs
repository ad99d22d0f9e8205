use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coroio::scheduler::thread_id;
use coroio::{Coroutine, IoManager, Scheduler, Task};
use parking_lot::Mutex;

#[test]
fn every_callback_runs_exactly_once() {
    let iom = IoManager::new(4, false, "sched_many").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let counter = counter.clone();
        iom.schedule(Task::callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    iom.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 1000);
    assert_eq!(iom.stat().scheduled(), 1000);
    assert_eq!(iom.stat().executed(), 1000);
    assert_eq!(iom.thread_ids().len(), 4);
}

#[test]
fn plain_scheduler_runs_batch() {
    let sched = Scheduler::new(2, false, "sched_plain");
    sched.start().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..64)
        .map(|_| {
            let counter = counter.clone();
            Task::callback(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    sched.schedule_batch(tasks);
    sched.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 64);
    assert!(sched.is_stopping());
}

#[test]
fn pinned_tasks_run_on_their_thread() {
    let iom = IoManager::new(3, false, "sched_pinned").unwrap();
    let target = iom.thread_ids()[1];
    let seen = Arc::new(Mutex::new(HashSet::new()));
    for _ in 0..50 {
        let seen = seen.clone();
        iom.schedule_on(Task::callback(move || {
            seen.lock().insert(thread_id());
        }), target);
    }
    iom.stop();
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen.contains(&target));
}

#[test]
fn yielding_coroutine_is_rescheduled() {
    let iom = IoManager::new(2, false, "sched_yield").unwrap();
    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    let co = Coroutine::new(
        move || {
            for _ in 0..3 {
                s.fetch_add(1, Ordering::SeqCst);
                Coroutine::yield_to_ready();
            }
            s.fetch_add(1, Ordering::SeqCst);
        },
        0,
    );
    iom.schedule(co.clone());
    iom.stop();
    assert_eq!(steps.load(Ordering::SeqCst), 4);
    assert_eq!(co.state(), coroio::State::Terminate);
    assert!(iom.stat().yielded() >= 3);
}

#[test]
fn panicking_callback_does_not_kill_worker() {
    let iom = IoManager::new(1, false, "sched_panic").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    iom.schedule(Task::callback(|| panic!("boom")));
    let c = counter.clone();
    iom.schedule(Task::callback(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));
    iom.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
