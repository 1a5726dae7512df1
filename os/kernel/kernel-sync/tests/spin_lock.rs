use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());

    // A failed attempt must not release the lock held by `g1`.
    assert!(l.try_lock().is_none());
    assert!(l.is_locked());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(vec![1_u64, 2, 4]);
    let total = l.with_lock(|v| {
        v.push(8);
        v.iter().sum::<u64>()
    });
    assert_eq!(total, 15);
    assert!(!l.is_locked());
    assert_eq!(l.into_inner(), vec![1, 2, 4, 8]);
}

#[test]
fn get_mut_needs_no_locking() {
    let mut l = SpinLock::new([0usize; 4]);
    l.get_mut()[2] = 7;
    assert_eq!(l.lock()[2], 7);
}

/// Simulates many cores handing out and returning frames through one lock.
#[test]
fn contended_sections_are_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let pool = Arc::new(SpinLock::new((0usize, 0usize))); // (allocated, freed)
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    pool.with_lock(|(allocated, freed)| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        if i % 2 == 0 {
                            *allocated += 1;
                        } else {
                            *freed += 1;
                        }
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let (allocated, freed) = pool.with_lock(|p| *p);
    assert_eq!(allocated + freed, threads * iters);
    assert_eq!(allocated, freed);
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
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
