use hyp_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new([0u16; 4]);
    {
        let mut g = l.lock();
        g[1] = 1;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    assert_eq!(l.lock()[1], 1);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(7u8);
    let held = l.try_lock().unwrap();
    assert!(l.try_lock().is_none());
    drop(held);
    assert_eq!(*l.try_lock().unwrap(), 7);
}

#[test]
fn with_lock_returns_the_closure_result() {
    let l = SpinLock::new(Vec::<u64>::new());
    let n = l.with_lock(|pages| {
        pages.extend([0x1000, 0x2000]);
        pages.len()
    });
    assert_eq!(n, 2);
    assert_eq!(l.into_inner(), [0x1000, 0x2000]);
}

#[test]
fn waiting_for_a_held_lock_counts_as_contention() {
    let lock = Arc::new(SpinLock::new(0u32));
    let held = lock.lock();
    assert_eq!(lock.contentions(), 0);

    let waiter = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || lock.with_lock(|v| *v += 1))
    };
    while lock.contentions() == 0 {
        thread::yield_now();
    }
    drop(held);
    waiter.join().unwrap();

    assert_eq!(lock.contentions(), 1);
    assert_eq!(lock.with_lock(|v| *v), 1);
    assert_eq!(lock.contentions(), 1);
}

#[test]
fn get_mut_needs_no_locking() {
    let mut l = SpinLock::new(1u32);
    *l.get_mut() += 1;
    assert_eq!(*l.lock(), 2);
}

#[test]
fn concurrent_transitions_are_serialized() {
    let cpus = 8;
    let rounds = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(cpus));

    let handles: Vec<_> = (0..cpus)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..rounds {
                    lock.with_lock(|v| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "mutual exclusion violated");
                        *v += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), cpus * rounds);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}
