use hyp_sync::RwSpinLock;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn readers_share_writers_exclude() {
    let l = RwSpinLock::new(5u32);
    let r1 = l.read();
    let r2 = l.try_read().unwrap();
    assert_eq!(*r1 + *r2, 10);
    assert!(l.try_write().is_none());
    drop((r1, r2));

    let mut w = l.try_write().unwrap();
    *w = 6;
    assert!(l.try_read().is_none());
    assert!(l.try_write().is_none());
    drop(w);
    assert_eq!(*l.read(), 6);
}

#[test]
fn writers_see_a_consistent_pair() {
    let threads = 6;
    let rounds = 2_000;
    let lock = Arc::new(RwSpinLock::new((0u64, 0u64)));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..rounds {
                    if i % 2 == 0 {
                        let mut w = lock.write();
                        w.0 += 1;
                        w.1 += 1;
                    } else {
                        let r = lock.read();
                        assert_eq!(r.0, r.1);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let r = lock.read();
    assert_eq!(r.0, (threads as u64 / 2) * rounds);
}
