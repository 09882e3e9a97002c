//! FIFO wait queues shared by every blocking primitive.
//!
//! A queue entry is either a fiber (woken through its scheduler) or a
//! plain OS thread (woken through a private condvar), so channels, task
//! pipes and pools work across both worlds. The queue itself carries no
//! lock: it always lives inside the owning primitive's mutex, which is
//! what establishes happens-before for the data the waiters exchange.
//!
//! Waiters are woken in FIFO order of suspension. Entries whose fiber has
//! already resumed for another reason (timeout, interruption) are stale;
//! `wake_one` skips them and keeps popping until a wake actually lands.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::clock::Deadline;
use crate::fiber::sched::{FiberCtx, WaitTicket, WakeReason};

/// Single-use parker for a non-fiber OS thread.
pub(crate) struct ThreadWaiter {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl ThreadWaiter {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Returns `false` on timeout.
    pub fn wait(&self, deadline: Deadline) -> bool {
        let mut woken = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *woken {
                return true;
            }
            match deadline.remaining() {
                None => {
                    woken = self.cv.wait(woken).unwrap_or_else(|e| e.into_inner());
                }
                Some(left) if left.is_zero() => return false,
                Some(left) => {
                    let (guard, _timeout) = self
                        .cv
                        .wait_timeout(woken, left)
                        .unwrap_or_else(|e| e.into_inner());
                    woken = guard;
                }
            }
        }
    }

    pub fn wake(&self) {
        let mut woken = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *woken = true;
        self.cv.notify_one();
    }
}

enum Waiter {
    Fiber {
        sched: Arc<crate::fiber::sched::Sched>,
        slot: usize,
        seq: u64,
    },
    Thread(Arc<ThreadWaiter>),
}

pub(crate) struct WaitQueue {
    q: VecDeque<(u64, Waiter)>,
    next_id: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            q: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Registers the given armed fiber suspension. The returned id lets the
    /// waiter remove itself when the wait ends abnormally.
    pub fn push_fiber(&mut self, ctx: &FiberCtx, ticket: WaitTicket) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.q.push_back((
            id,
            Waiter::Fiber {
                sched: Arc::clone(&ctx.sched),
                slot: ctx.slot,
                seq: ticket.0,
            },
        ));
        id
    }

    pub fn push_thread(&mut self, tw: Arc<ThreadWaiter>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.q.push_back((id, Waiter::Thread(tw)));
        id
    }

    /// Removes an entry that timed out or was interrupted before being
    /// woken, so a later wake is not wasted on it.
    pub fn remove(&mut self, id: u64) {
        if let Some(pos) = self.q.iter().position(|(i, _)| *i == id) {
            self.q.remove(pos);
        }
    }

    /// Wakes the longest-suspended live waiter. Returns `false` when the
    /// queue drained without landing a wake.
    pub fn wake_one(&mut self) -> bool {
        while let Some((_, w)) = self.q.pop_front() {
            match w {
                Waiter::Fiber { sched, slot, seq } => {
                    if sched.wake_external(slot, seq, WakeReason::Ready) {
                        return true;
                    }
                }
                Waiter::Thread(tw) => {
                    tw.wake();
                    return true;
                }
            }
        }
        false
    }

    pub fn wake_all(&mut self) {
        while let Some((_, w)) = self.q.pop_front() {
            match w {
                Waiter::Fiber { sched, slot, seq } => {
                    sched.wake_external(slot, seq, WakeReason::Ready);
                }
                Waiter::Thread(tw) => tw.wake(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
