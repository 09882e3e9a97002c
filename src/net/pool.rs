//! A bounded keyed connection pool.
//!
//! Connections are grouped by a caller-supplied key (for an HTTP client:
//! scheme, host, port, TLS fingerprint, proxy). Per key, at most
//! `max_per_key` connections exist at any instant, idle and borrowed
//! combined; a borrower beyond the cap suspends in FIFO order until an
//! earlier borrower returns or discards its connection. The RAII
//! [`Pooled`] guard makes the return path single and deterministic, so a
//! connection cannot be returned twice or by a non-borrower.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched::{current_ctx, WaitKind, WakeReason};
use crate::fiber::wait::{ThreadWaiter, WaitQueue};

struct KeyState<C> {
    idle: Vec<C>,
    /// Open connections for this key: idle plus borrowed.
    live: usize,
    waiters: WaitQueue,
}

impl<C> Default for KeyState<C> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            live: 0,
            waiters: WaitQueue::new(),
        }
    }
}

struct PoolShared<K, C> {
    state: Mutex<HashMap<K, KeyState<C>>>,
    max_per_key: usize,
}

pub struct ConnectionPool<K, C> {
    shared: Arc<PoolShared<K, C>>,
}

impl<K, C> Clone for ConnectionPool<K, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Eq + Hash + Clone, C> ConnectionPool<K, C> {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(HashMap::new()),
                max_per_key: max_per_key.max(1),
            }),
        }
    }

    pub fn max_per_key(&self) -> usize {
        self.shared.max_per_key
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, KeyState<C>>> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrows a connection for `key`: an idle one when available, a
    /// freshly opened one while below the cap, otherwise the caller
    /// suspends until a slot frees up.
    pub fn borrow(&self, key: K, connect: impl FnOnce() -> Result<C>) -> Result<Pooled<K, C>> {
        self.borrow_deadline(key, connect, Deadline::NEVER)
    }

    pub fn borrow_timeout(
        &self,
        key: K,
        connect: impl FnOnce() -> Result<C>,
        timeout: Duration,
    ) -> Result<Pooled<K, C>> {
        self.borrow_deadline(key, connect, Deadline::after(timeout))
    }

    fn borrow_deadline(
        &self,
        key: K,
        connect: impl FnOnce() -> Result<C>,
        deadline: Deadline,
    ) -> Result<Pooled<K, C>> {
        loop {
            let mut state = self.lock();
            let ks = state.entry(key.clone()).or_default();
            if let Some(conn) = ks.idle.pop() {
                return Ok(self.guard(key, conn));
            }
            if ks.live < self.shared.max_per_key {
                ks.live += 1;
                drop(state);
                // The connect runs without the pool lock; the reserved
                // slot is released again if it fails.
                match connect() {
                    Ok(conn) => return Ok(self.guard(key, conn)),
                    Err(e) => {
                        let mut state = self.lock();
                        if let Some(ks) = state.get_mut(&key) {
                            ks.live -= 1;
                            ks.waiters.wake_one();
                        }
                        return Err(e);
                    }
                }
            }
            self.wait_for_slot(state, &key, deadline)?;
        }
    }

    fn wait_for_slot(
        &self,
        mut state: MutexGuard<'_, HashMap<K, KeyState<C>>>,
        key: &K,
        deadline: Deadline,
    ) -> Result<()> {
        let ks = state.get_mut(key).expect("key state was just created");
        match current_ctx() {
            Some(ctx) => {
                let ticket = ctx.begin_wait()?;
                let id = ks.waiters.push_fiber(&ctx, ticket);
                drop(state);
                match ctx.commit_wait(ticket, WaitKind::Queue, deadline) {
                    WakeReason::Ready => Ok(()),
                    reason => {
                        if let Some(ks) = self.lock().get_mut(key) {
                            ks.waiters.remove(id);
                        }
                        match reason {
                            WakeReason::TimedOut => Err(Error::TimedOut),
                            _ => Err(Error::Interrupted),
                        }
                    }
                }
            }
            None => {
                let tw = Arc::new(ThreadWaiter::new());
                let id = ks.waiters.push_thread(Arc::clone(&tw));
                drop(state);
                if tw.wait(deadline) {
                    Ok(())
                } else {
                    if let Some(ks) = self.lock().get_mut(key) {
                        ks.waiters.remove(id);
                    }
                    Err(Error::TimedOut)
                }
            }
        }
    }

    fn guard(&self, key: K, conn: C) -> Pooled<K, C> {
        Pooled {
            pool: self.clone(),
            key,
            conn: Some(conn),
        }
    }

    /// Connections currently open for `key` (idle plus borrowed).
    pub fn live(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, |ks| ks.live)
    }

    /// Idle connections currently pooled for `key`.
    pub fn idle(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, |ks| ks.idle.len())
    }
}

/// A borrowed pool connection. Dropping the guard returns the connection
/// to the idle set; [`discard`](Pooled::discard) closes the slot instead
/// (for connections observed to be broken).
pub struct Pooled<K: Eq + Hash + Clone, C> {
    pool: ConnectionPool<K, C>,
    key: K,
    conn: Option<C>,
}

impl<K: Eq + Hash + Clone, C> Pooled<K, C> {
    /// Drops the connection and frees its slot so a waiting borrower can
    /// open a fresh one.
    pub fn discard(mut self) {
        self.conn = None;
        self.release(None);
    }

    /// Removes the connection from the pool entirely, transferring
    /// ownership to the caller and freeing its slot.
    pub fn detach(mut self) -> C {
        let conn = self.conn.take().expect("guard not yet released");
        self.release(None);
        conn
    }

    fn release(&mut self, returned: Option<C>) {
        let mut state = self.pool.lock();
        if let Some(ks) = state.get_mut(&self.key) {
            match returned {
                Some(conn) => ks.idle.push(conn),
                None => ks.live -= 1,
            }
            ks.waiters.wake_one();
        }
    }
}

impl<K: Eq + Hash + Clone, C> std::ops::Deref for Pooled<K, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("guard not yet released")
    }
}

impl<K: Eq + Hash + Clone, C> std::ops::DerefMut for Pooled<K, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("guard not yet released")
    }
}

impl<K: Eq + Hash + Clone, C> Drop for Pooled<K, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.release(Some(conn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_connections_are_reused() {
        let pool: ConnectionPool<&str, u32> = ConnectionPool::new(2);
        {
            let c = pool.borrow("k", || Ok(11)).unwrap();
            assert_eq!(*c, 11);
        }
        assert_eq!(pool.idle(&"k"), 1);
        let c = pool.borrow("k", || Ok(22)).unwrap();
        // The idle connection is handed out; the connect closure is not
        // invoked.
        assert_eq!(*c, 11);
    }

    #[test]
    fn failed_connect_frees_the_slot() {
        let pool: ConnectionPool<&str, u32> = ConnectionPool::new(1);
        assert!(pool
            .borrow("k", || Err(Error::usage("no route")))
            .is_err());
        assert_eq!(pool.live(&"k"), 0);
        let c = pool.borrow("k", || Ok(1)).unwrap();
        assert_eq!(*c, 1);
    }

    #[test]
    fn discard_closes_the_slot() {
        let pool: ConnectionPool<&str, u32> = ConnectionPool::new(1);
        let c = pool.borrow("k", || Ok(1)).unwrap();
        c.discard();
        assert_eq!(pool.live(&"k"), 0);
        assert_eq!(pool.idle(&"k"), 0);
    }

    #[test]
    fn keys_have_independent_caps() {
        let pool: ConnectionPool<&str, u32> = ConnectionPool::new(1);
        let _a = pool.borrow("a", || Ok(1)).unwrap();
        let _b = pool.borrow("b", || Ok(2)).unwrap();
        assert_eq!(pool.live(&"a"), 1);
        assert_eq!(pool.live(&"b"), 1);
    }
}
