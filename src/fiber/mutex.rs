//! Locks for the cooperative multitasking environment.
//!
//! All three primitives suspend the acquiring fiber while the lock is
//! contended and hand the lock over in FIFO order of suspension. They work
//! across scheduler threads as well. Lock acquisition is deliberately not
//! an interruption delivery point: a pending interruption stays flagged
//! and fires at the caller's next interruptible suspension instead, so a
//! fiber can always release what it acquired.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;

use crate::clock::Deadline;
use crate::fiber::sched::{current_ctx, WaitKind, WakeReason};
use crate::fiber::wait::{ThreadWaiter, WaitQueue};

/// Identity of a lock holder: a fiber or, outside the runtime, a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerId {
    Fiber(u64),
    Thread(std::thread::ThreadId),
}

fn owner_id() -> OwnerId {
    match current_ctx() {
        Some(ctx) => OwnerId::Fiber(ctx.task_id),
        None => OwnerId::Thread(std::thread::current().id()),
    }
}

/// Registers the caller in a wait queue selected from the held state
/// `guard`, releases the guard, and parks with interruption masked. The
/// single lock acquisition for check-and-register is what rules out lost
/// wake-ups.
fn wait_in_queue<T>(
    mut guard: StdMutexGuard<'_, T>,
    select: impl FnOnce(&mut T) -> &mut WaitQueue,
) {
    match current_ctx() {
        Some(ctx) => {
            let prev = ctx.set_shielded(true);
            // Shielded, so this cannot fail with an interruption.
            let ticket = ctx.begin_wait().expect("shielded wait cannot be interrupted");
            select(&mut guard).push_fiber(&ctx, ticket);
            drop(guard);
            let reason = ctx.commit_wait(ticket, WaitKind::Queue, Deadline::NEVER);
            debug_assert_ne!(reason, WakeReason::Interrupted);
            ctx.set_shielded(prev);
        }
        None => {
            let tw = Arc::new(ThreadWaiter::new());
            select(&mut guard).push_thread(Arc::clone(&tw));
            drop(guard);
            tw.wait(Deadline::NEVER);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

struct MutexState {
    owner: Option<OwnerId>,
    waiters: WaitQueue,
}

/// A mutual-exclusion primitive protecting shared data, usable from fibers
/// and plain threads.
pub struct Mutex<T: ?Sized> {
    state: StdMutex<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Self {
        Self {
            state: StdMutex::new(MutexState {
                owner: None,
                waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    fn lock_state(&self) -> StdMutexGuard<'_, MutexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires the mutex, yielding the current fiber until it is able to
    /// do so. A RAII guard allows scoped unlock; the mutex unlocks when
    /// the guard goes out of scope.
    ///
    /// Locking a mutex the current fiber already holds deadlocks, as it
    /// does for an OS mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = owner_id();
        loop {
            let mut st = self.lock_state();
            if st.owner.is_none() {
                st.owner = Some(me);
                return MutexGuard { lock: self };
            }
            wait_in_queue(st, |st| &mut st.waiters);
        }
    }

    /// Attempts to acquire this lock without yielding; `None` when held.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut st = self.lock_state();
        if st.owner.is_none() {
            st.owner = Some(owner_id());
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    /// Equivalent to `drop(guard)` but more self-documenting.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data; no locking is
    /// needed since the mutable borrow guarantees exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T>
where
    T: Sized,
{
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.owner = None;
        st.waiters.wake_one();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// RecursiveMutex
////////////////////////////////////////////////////////////////////////////////

struct RecursiveState {
    owner: Option<OwnerId>,
    depth: u32,
    waiters: WaitQueue,
}

/// A re-entrant lock guarding a critical *section* rather than data: the
/// fiber holding it may lock again without deadlocking, and the lock is
/// released when the outermost guard drops.
pub struct RecursiveMutex {
    state: StdMutex<RecursiveState>,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(RecursiveState {
                owner: None,
                depth: 0,
                waiters: WaitQueue::new(),
            }),
        }
    }

    fn lock_state(&self) -> StdMutexGuard<'_, RecursiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires the lock, yielding until the current fiber can hold it.
    pub fn lock(&self) -> RecursiveGuard<'_> {
        let me = owner_id();
        loop {
            let mut st = self.lock_state();
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    return RecursiveGuard { lock: self };
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    return RecursiveGuard { lock: self };
                }
                Some(_) => {}
            }
            wait_in_queue(st, |st| &mut st.waiters);
        }
    }

    pub fn try_lock(&self) -> Option<RecursiveGuard<'_>> {
        let me = owner_id();
        let mut st = self.lock_state();
        match st.owner {
            None => {
                st.owner = Some(me);
                st.depth = 1;
                Some(RecursiveGuard { lock: self })
            }
            Some(owner) if owner == me => {
                st.depth += 1;
                Some(RecursiveGuard { lock: self })
            }
            Some(_) => None,
        }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecursiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveMutex").finish_non_exhaustive()
    }
}

pub struct RecursiveGuard<'a> {
    lock: &'a RecursiveMutex,
}

impl Drop for RecursiveGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            st.waiters.wake_one();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// RwLock
////////////////////////////////////////////////////////////////////////////////

struct RwState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
}

/// A reader-writer lock with writer preference: once a writer is waiting,
/// new readers queue up behind it instead of starving it.
pub struct RwLock<T: ?Sized> {
    state: StdMutex<RwState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(t: T) -> Self {
        Self {
            state: StdMutex::new(RwState {
                readers: 0,
                writer: false,
                writers_waiting: 0,
                read_waiters: WaitQueue::new(),
                write_waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    fn lock_state(&self) -> StdMutexGuard<'_, RwState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires shared access, yielding while a writer holds or awaits the
    /// lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let mut st = self.lock_state();
            if !st.writer && st.writers_waiting == 0 {
                st.readers += 1;
                return RwLockReadGuard { lock: self };
            }
            wait_in_queue(st, |st| &mut st.read_waiters);
        }
    }

    /// Acquires exclusive access, yielding while any reader or writer
    /// holds the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let mut st = self.lock_state();
            if !st.writer && st.readers == 0 {
                st.writer = true;
                return RwLockWriteGuard { lock: self };
            }
            st.writers_waiting += 1;
            wait_in_queue(st, |st| &mut st.write_waiters);
            self.lock_state().writers_waiting -= 1;
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut st = self.lock_state();
        if !st.writer && st.writers_waiting == 0 {
            st.readers += 1;
            Some(RwLockReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut st = self.lock_state();
        if !st.writer && st.readers == 0 {
            st.writer = true;
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.readers -= 1;
        if st.readers == 0 && !st.write_waiters.wake_one() {
            st.read_waiters.wake_all();
        }
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.writer = false;
        if !st.write_waiters.wake_one() {
            st.read_waiters.wake_all();
        }
    }
}
