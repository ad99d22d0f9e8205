use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coroio::hook::originals::originals;
use coroio::timer::ManualClock;
use coroio::{Coroutine, Event, IoHandle, IoManager, Task};
use parking_lot::Mutex;

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rt = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rt, 0);
    (fds[0], fds[1])
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Write into `fd` until its peer's receive buffer is full.
fn fill(fd: RawFd) {
    let chunk = [0u8; 4096];
    loop {
        let n = unsafe { (originals().send)(fd, chunk.as_ptr().cast(), chunk.len(), libc::MSG_DONTWAIT) };
        if n < 0 {
            assert_eq!(errno(), libc::EAGAIN);
            return;
        }
    }
}

#[test]
fn cancel_all_wakes_both_waiters_once() {
    let iom = IoManager::new(2, false, "reactor_cancel_all").unwrap();
    let (a, b) = socketpair();
    fill(a);

    let resumed = Arc::new(AtomicUsize::new(0));
    // Per waiter: did the operation still fail with EAGAIN after waking?
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for event in [Event::Read, Event::Write] {
        let resumed = resumed.clone();
        let outcomes = outcomes.clone();
        iom.schedule(Task::callback(move || {
            let iom = IoHandle::current().unwrap();
            iom.add_event(a, event, None).unwrap();
            Coroutine::yield_to_suspend();

            let mut byte = [0u8; 1];
            let n = unsafe {
                match event {
                    Event::Read => (originals().recv)(a, byte.as_mut_ptr().cast(), 1, libc::MSG_DONTWAIT),
                    Event::Write => (originals().send)(a, byte.as_ptr().cast(), 1, libc::MSG_DONTWAIT),
                }
            };
            outcomes.lock().push((event, n == -1 && errno() == libc::EAGAIN));
            resumed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wait_until("both events registered", || iom.pending_events() == 2);
    assert!(iom.cancel_all(a));
    wait_until("both waiters resumed", || resumed.load(Ordering::SeqCst) == 2);
    assert_eq!(iom.pending_events(), 0);
    assert!(!iom.cancel_all(a));

    let outcomes = outcomes.lock().clone();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|&(_, failed)| failed));
    assert!(outcomes.iter().any(|&(e, _)| e == Event::Read));
    assert!(outcomes.iter().any(|&(e, _)| e == Event::Write));

    // The context is clean: the same fd can be registered again.
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iom.add_event(
        a,
        Event::Read,
        Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(unsafe { (originals().write)(b, b"x".as_ptr().cast(), 1) }, 1);
    wait_until("re-registered read fires", || hits.load(Ordering::SeqCst) == 1);

    drop(iom);
    assert_eq!(resumed.load(Ordering::SeqCst), 2);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn double_registration_is_rejected() {
    let iom = IoManager::new(1, false, "reactor_double").unwrap();
    let (a, b) = socketpair();
    iom.add_event(a, Event::Read, Some(Box::new(|| {}))).unwrap();

    let second = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = iom.add_event(a, Event::Read, Some(Box::new(|| {})));
    }));
    assert!(second.is_err());
    assert_eq!(iom.pending_events(), 1);

    assert!(iom.del_event(a, Event::Read));
    drop(iom);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn timer_fires_on_time() {
    let iom = IoManager::new(1, false, "reactor_timer").unwrap();
    let fired = Arc::new(Mutex::new(None));
    let f = fired.clone();
    let start = Instant::now();
    iom.add_timer(
        1000,
        move || {
            f.lock().get_or_insert_with(|| start.elapsed());
        },
        false,
    );
    wait_until("timer", || fired.lock().is_some());
    let elapsed = fired.lock().unwrap_or_default();
    assert!(elapsed >= Duration::from_millis(999), "fired early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1500), "fired late: {:?}", elapsed);
}

#[test]
fn recurring_timer_repeats_until_cancelled() {
    let iom = IoManager::new(1, false, "reactor_recurring").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let timer = iom.add_timer(
        20,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );
    wait_until("three ticks", || hits.load(Ordering::SeqCst) >= 3);
    assert!(timer.cancel());
    assert!(!timer.cancel());
    // Stopping returns once no timer is left.
    drop(iom);
}

#[test]
fn rollback_expires_pending_timers() {
    let clock = Arc::new(ManualClock::new(10_000_000));
    let iom = IoManager::builder()
        .threads(1)
        .use_caller(false)
        .name("reactor_rollback")
        .max_wait(Duration::from_millis(50))
        .clock(clock.clone())
        .build()
        .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let h = hits.clone();
        iom.add_timer(
            60_000,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    clock.set(10_000_000 - 2 * 3_600_000);
    wait_until("rollback expiry", || hits.load(Ordering::SeqCst) == 3);
    assert!(!iom.timers().has_timer());
}

#[test]
fn rollback_while_idle_does_not_expire_later_timers() {
    let clock = Arc::new(ManualClock::new(10_000_000));
    let iom = IoManager::builder()
        .threads(1)
        .use_caller(false)
        .name("reactor_idle_rollback")
        .max_wait(Duration::from_millis(20))
        .clock(clock.clone())
        .build()
        .unwrap();
    // Let the idle loop observe the rollback with no timers armed.
    std::thread::sleep(Duration::from_millis(50));
    clock.set(10_000_000 - 2 * 3_600_000);
    std::thread::sleep(Duration::from_millis(100));

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let timer = iom.add_timer(
        60_000,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(timer.cancel());
}

#[test]
fn double_registration_in_coroutine_ends_it_in_except() {
    let iom = IoManager::new(1, false, "reactor_double_co").unwrap();
    let (a, b) = socketpair();
    let handle = iom.handle();
    let co = Coroutine::new(
        move || {
            handle.add_event(a, Event::Read, Some(Box::new(|| {}))).unwrap();
            let _ = handle.add_event(a, Event::Read, Some(Box::new(|| {})));
        },
        0,
    );
    iom.schedule(co.clone());
    wait_until("coroutine end", || co.state() == coroio::State::Except);
    assert_eq!(iom.pending_events(), 1);

    assert!(iom.del_event(a, Event::Read));
    drop(iom);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}
