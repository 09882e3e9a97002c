//! The runtime object owning the scheduler threads.
//!
//! There is no process-wide default runtime: a program creates a
//! [`Runtime`] explicitly at startup, launches its root fiber through
//! [`Runtime::run`] and spawns everything else from there. Listeners,
//! connectors and background workers all operate inside fibers of some
//! runtime.
//!
//! ```no_run
//! use weft::runtime::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! rt.run(|| {
//!     println!("hello from the root fiber");
//! }).unwrap();
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::fiber::sched::{current_ctx, run_loop, Sched};
use crate::fiber::{self, Builder, JoinHandle};
use crate::reactor::Reactor;

struct Worker {
    sched: Arc<Sched>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct RuntimeInner {
    main: Arc<Sched>,
    main_reactor: Mutex<Option<Reactor>>,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    finished: AtomicBool,
}

/// A handle to the scheduler set. Cheap to clone; all clones refer to the
/// same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime with a single scheduler driven by the thread that calls
    /// [`run`](Self::run).
    pub fn new() -> Result<Self> {
        Self::with_workers(0)
    }

    /// A runtime with `workers` additional scheduler threads, each owning
    /// its own reactor and fiber set. Fibers never migrate between them.
    pub fn with_workers(workers: usize) -> Result<Self> {
        let (main_reactor, main_waker) = Reactor::new()?;
        let main = Arc::new(Sched::new(0, main_waker));

        let mut worker_handles = Vec::with_capacity(workers);
        for id in 1..=workers {
            let (reactor, waker) = Reactor::new()?;
            let sched = Arc::new(Sched::new(id, waker));
            let sched2 = Arc::clone(&sched);
            let thread = thread::Builder::new()
                .name(format!("weft-worker/{id}"))
                .spawn(move || {
                    let mut reactor = reactor;
                    run_loop(&sched2, &mut reactor, |st| st.shutdown && st.live == 0);
                })?;
            worker_handles.push(Worker {
                sched,
                thread: Mutex::new(Some(thread)),
            });
        }

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                main,
                main_reactor: Mutex::new(Some(main_reactor)),
                workers: worker_handles,
                next_worker: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            }),
        })
    }

    /// Runs `f` as the root fiber, driving the event loop on the calling
    /// thread until it returns. Every fiber still alive at that point is
    /// interrupted, the schedulers drain, worker threads are joined, and
    /// the root fiber's value is returned.
    ///
    /// A runtime runs once; a second call fails with a usage error.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if current_ctx().is_some() {
            return Err(Error::usage("Runtime::run called from inside a fiber"));
        }
        let mut reactor = {
            let mut slot = self
                .inner
                .main_reactor
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
                .ok_or_else(|| Error::usage("this runtime has already run"))?
        };

        let root = fiber::spawn_with(&self.inner.main, Builder::new().name("main"), false, f)?;
        run_loop(&self.inner.main, &mut reactor, |_| root.is_finished());

        // The root is done: interrupt whatever it left behind and drain.
        self.inner.main.interrupt_all();
        for w in &self.inner.workers {
            w.sched.interrupt_all();
        }
        run_loop(&self.inner.main, &mut reactor, |st| st.live == 0);
        for w in &self.inner.workers {
            if let Some(t) = w.thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = t.join();
            }
        }
        self.inner.finished.store(true, Ordering::Release);

        root.join()
    }

    /// Spawns a fiber on the caller's scheduler (tail of the runnable
    /// FIFO). Outside of a fiber the main scheduler is used.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sched = match current_ctx() {
            Some(ctx) => ctx.sched,
            None => Arc::clone(&self.inner.main),
        };
        fiber::spawn_with(&sched, Builder::new(), false, f)
    }

    /// Spawns a fiber on one of the worker schedulers, chosen round-robin.
    /// Falls back to the main scheduler when the runtime has no workers.
    pub fn spawn_worker<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sched = if self.inner.workers.is_empty() {
            Arc::clone(&self.inner.main)
        } else {
            let n = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
            Arc::clone(&self.inner.workers[n % self.inner.workers.len()].sched)
        };
        fiber::spawn_with(&sched, Builder::new(), false, f)
    }

    /// Number of worker schedulers (the main scheduler not included).
    pub fn workers(&self) -> usize {
        self.inner.workers.len()
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        // Never ran to completion: release the worker threads. They exit
        // once their fiber sets drain; we do not block on them here.
        self.main.interrupt_all();
        for w in &self.workers {
            w.sched.interrupt_all();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.inner.workers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn run_returns_root_value() {
        let rt = Runtime::new().unwrap();
        let v = rt.run(|| 40 + 2).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn run_twice_is_an_error() {
        let rt = Runtime::new().unwrap();
        rt.run(|| ()).unwrap();
        let rt2 = rt.clone();
        assert!(matches!(rt2.run(|| ()), Err(Error::Usage(_))));
    }

    #[test]
    fn spawn_and_join() {
        let rt = Runtime::new().unwrap();
        let v = rt
            .run(|| {
                let h = fiber::start(|| 7u32);
                h.join().unwrap()
            })
            .unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn start_transfers_execution_immediately() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let order = Arc::new(std::sync::Mutex::new(Vec::new()));
            let o = Arc::clone(&order);
            let h = fiber::start(move || o.lock().unwrap().push("child"));
            order.lock().unwrap().push("parent");
            h.join().unwrap();
            let order = order.lock().unwrap();
            assert_eq!(*order, ["child", "parent"]);
        })
        .unwrap();
    }

    #[test]
    fn yield_is_fifo_fair() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let log = Arc::new(std::sync::Mutex::new(Vec::new()));
            let handles: Vec<_> = (0..3)
                .map(|i| {
                    let log = Arc::clone(&log);
                    fiber::defer(move || {
                        for round in 0..2 {
                            log.lock().unwrap().push((i, round));
                            fiber::yield_now().unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let log = log.lock().unwrap();
            // Every runnable fiber gets a turn before a yielded one runs
            // again: rounds never interleave out of order.
            assert_eq!(*log, [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);
        })
        .unwrap();
    }

    #[test]
    fn sleep_never_wakes_early() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let before = fiber::clock();
            fiber::sleep(Duration::from_millis(20)).unwrap();
            assert!(before.elapsed() >= Duration::from_millis(20));
        })
        .unwrap();
    }

    #[test]
    fn interruption_is_edge_triggered() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let hits = Arc::new(AtomicU32::new(0));
            let hits2 = Arc::clone(&hits);
            let h = fiber::defer(move || {
                // First suspension observes exactly one interruption...
                match fiber::sleep(Duration::from_secs(60)) {
                    Err(crate::error::Error::Interrupted) => {
                        hits2.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("expected interruption, got {other:?}"),
                }
                // ...and the next one completes normally.
                fiber::sleep(Duration::from_millis(1)).unwrap();
            });
            let task = h.task();
            // Interrupt many times while the target is still runnable.
            task.interrupt();
            task.interrupt();
            task.interrupt();
            h.join().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        })
        .unwrap();
    }

    #[test]
    fn join_reraises_fiber_panic() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let h = fiber::defer(|| panic!("boom"));
            match h.join() {
                Err(Error::Task(msg)) => assert!(msg.contains("boom")),
                other => panic!("expected task error, got {other:?}"),
            }
        })
        .unwrap();
    }

    #[test]
    fn channel_crosses_fibers() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let (tx, rx) = fiber::channel::<u32>(2);
            let producer = fiber::defer(move || {
                for i in 0..10 {
                    tx.send(i).unwrap();
                }
            });
            let got: Vec<u32> = rx.iter().take(10).collect();
            producer.join().unwrap();
            assert_eq!(got, (0..10).collect::<Vec<_>>());
        })
        .unwrap();
    }

    #[test]
    fn mailbox_skips_unmatched_messages() {
        use crate::fiber::mailbox::{on, receive};

        struct A(u32);
        struct B(&'static str);

        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let me = fiber::current().unwrap();
            me.send(A(1)).unwrap();
            me.send(B("first b")).unwrap();
            me.send(A(2)).unwrap();

            let got = Arc::new(std::sync::Mutex::new(Vec::new()));
            let g = Arc::clone(&got);
            // Only interested in B: the two A messages are skipped in
            // place, not dequeued.
            receive((on(move |B(s): B| g.lock().unwrap().push(s)),)).unwrap();

            let g = Arc::clone(&got);
            receive((on(move |A(n): A| g.lock().unwrap().push(if n == 1 { "a1" } else { "a2" })),))
                .unwrap();
            let g = Arc::clone(&got);
            receive((on(move |A(n): A| g.lock().unwrap().push(if n == 1 { "a1" } else { "a2" })),))
                .unwrap();
            assert_eq!(*got.lock().unwrap(), ["first b", "a1", "a2"]);
        })
        .unwrap();
    }

    #[test]
    fn worker_fibers_run_on_other_threads() {
        let rt = Runtime::with_workers(2).unwrap();
        let rt2 = rt.clone();
        rt.run(move || {
            let main_thread = std::thread::current().id();
            let h = rt2.spawn_worker(move || std::thread::current().id() != main_thread);
            assert!(h.unwrap().join().unwrap());
        })
        .unwrap();
    }

    #[test]
    fn cond_signal_wakes_waiter() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let cond = Arc::new(fiber::Cond::new());
            let flag = Arc::new(AtomicU32::new(0));
            let (c, f) = (Arc::clone(&cond), Arc::clone(&flag));
            let h = fiber::defer(move || {
                while f.load(Ordering::SeqCst) == 0 {
                    c.wait().unwrap();
                }
            });
            fiber::yield_now().unwrap();
            flag.store(1, Ordering::SeqCst);
            cond.signal();
            h.join().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn fiber_mutex_excludes() {
        let rt = Runtime::new().unwrap();
        rt.run(|| {
            let m = Arc::new(fiber::Mutex::new(0u32));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let m = Arc::clone(&m);
                    fiber::defer(move || {
                        for _ in 0..100 {
                            let mut g = m.lock();
                            let v = *g;
                            fiber::yield_now().unwrap();
                            *g = v + 1;
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(*m.lock(), 400);
        })
        .unwrap();
    }
}
