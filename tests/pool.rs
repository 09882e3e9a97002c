//! Connection pool capacity under concurrent borrowers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::fiber;
use weft::net::ConnectionPool;
use weft::runtime::Runtime;

/// With `max_per_key = 2` and four concurrent borrowers, the late two
/// suspend until earlier ones return, and at no instant are more than
/// two connections live for the key.
#[test]
fn borrowers_beyond_the_cap_suspend() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pool: ConnectionPool<&'static str, u32> = ConnectionPool::new(2);
        let opened = Arc::new(AtomicU32::new(0));
        let in_use = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let opened = Arc::clone(&opened);
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                fiber::defer(move || {
                    let guard = pool
                        .borrow("db", || Ok(opened.fetch_add(1, Ordering::SeqCst)))
                        .unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    fiber::sleep(Duration::from_millis(20)).unwrap();
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "cap was exceeded");
        assert_eq!(opened.load(Ordering::SeqCst), 2, "idle reuse expected");
        assert_eq!(pool.live(&"db"), 2);
        assert_eq!(pool.idle(&"db"), 2);
    })
    .unwrap();
}

#[test]
fn borrow_timeout_fires_when_saturated() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pool: ConnectionPool<&'static str, u32> = ConnectionPool::new(1);
        let _held = pool.borrow("k", || Ok(1)).unwrap();
        match pool.borrow_timeout("k", || Ok(2), Duration::from_millis(20)) {
            Err(weft::Error::TimedOut) => {}
            Err(e) => panic!("expected a timeout, got {e:?}"),
            Ok(_) => panic!("expected a timeout, got a connection"),
        }
    })
    .unwrap();
}

#[test]
fn interrupting_a_blocked_borrower_unblocks_it() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pool: ConnectionPool<&'static str, u32> = ConnectionPool::new(1);
        let held = pool.borrow("k", || Ok(1)).unwrap();
        let pool2 = pool.clone();
        let blocked = fiber::defer(move || match pool2.borrow("k", || Ok(2)) {
            Err(weft::Error::Interrupted) => true,
            Err(e) => panic!("expected interruption, got {e:?}"),
            Ok(_) => panic!("expected interruption, got a connection"),
        });
        fiber::yield_now().unwrap();
        blocked.interrupt();
        assert!(blocked.join().unwrap());
        drop(held);
    })
    .unwrap();
}
