//! Cooperative multitasking module.
//!
//! With the fiber module you can create, run and manage fibers, and use
//! synchronization mechanisms similar to condition variables and channels
//! to coordinate them.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! control changes hands only at *suspension points* (I/O waits, [`sleep`],
//! [`yield_now`], blocking channel/pipe/mailbox operations, contended mutex
//! acquisition, [`Cond`] waits and [`JoinHandle::join`]). Within one
//! scheduler, a fiber's operations between suspension points are atomic
//! with respect to all other fibers.
//!
//! A runaway fiber can be stopped with [`TaskHandle::interrupt`].
//! Interruption is advisory and edge-triggered: the target's next
//! suspension point fails with [`Error::Interrupted`], however many times
//! the interrupt was requested in between.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};

pub mod channel;
pub mod mailbox;
pub mod mutex;
pub(crate) mod sched;
pub(crate) mod wait;

pub use channel::{
    channel, Receiver, RecvError, SendError, Sender, TryRecvError, TrySendError,
};
pub use mutex::{Mutex, MutexGuard, RecursiveMutex, RwLock};

use sched::{current_ctx, FiberCtx, JoinShared, SpawnSpec, WaitKind, WakeReason};

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// The currently supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `stack_size`: specifies the desired stack size for the fiber
///
/// The [`start`](Builder::start) and [`defer`](Builder::defer) methods take
/// ownership of the builder and produce a [`JoinHandle`] with the given
/// configuration. The [`fiber::start`](start), [`fiber::start_proc`]
/// (start_proc) and [`fiber::defer`](defer) free functions use a `Builder`
/// with default configuration and unwrap the return value.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawns a new fiber on the current scheduler and **yields** execution
    /// to it immediately, returning its [`JoinHandle`].
    pub fn start<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ctx = require_ctx()?;
        let handle = spawn_with(&ctx.sched, self, true, f)?;
        // Hand the baton over without consuming a pending interruption:
        // that belongs to the caller's next real suspension point.
        let prev = ctx.set_shielded(true);
        let _ = ctx.yield_now();
        ctx.set_shielded(prev);
        Ok(handle)
    }

    /// Spawns a new fiber on the current scheduler and schedules it after
    /// everything currently runnable, returning its [`JoinHandle`].
    pub fn defer<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ctx = require_ctx()?;
        spawn_with(&ctx.sched, self, false, f)
    }
}

fn require_ctx() -> Result<FiberCtx> {
    current_ctx().ok_or_else(|| {
        Error::usage("fiber API called outside of a runtime; use Runtime::spawn instead")
    })
}

pub(crate) fn spawn_with<F, T>(
    sched: &Arc<sched::Sched>,
    builder: Builder,
    at_front: bool,
    f: F,
) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let spec = SpawnSpec {
        name: builder.name.unwrap_or_else(|| "<fiber>".into()),
        stack_size: builder.stack_size,
        at_front,
    };
    let (slot, task_id, join) = sched::spawn_on(sched, spec, f)?;
    Ok(JoinHandle {
        task: TaskHandle {
            sched: Arc::clone(sched),
            slot,
            task_id,
        },
        join,
        joined: false,
    })
}

////////////////////////////////////////////////////////////////////////////////
// TaskHandle
////////////////////////////////////////////////////////////////////////////////

/// A clonable, non-owning reference to a fiber: its identity, its mailbox
/// and its interruption entry point.
#[derive(Clone)]
pub struct TaskHandle {
    sched: Arc<sched::Sched>,
    slot: usize,
    task_id: u64,
}

impl TaskHandle {
    /// The fiber's process-wide monotonic id.
    pub fn id(&self) -> u64 {
        self.task_id
    }

    /// Requests interruption. Asynchronous and edge-triggered: the target's
    /// next suspension point fails with [`Error::Interrupted`]; if it is
    /// suspended right now, that suspension fails immediately.
    pub fn interrupt(&self) {
        self.sched.interrupt(self.slot, self.task_id);
    }

    /// Delivers a message to the fiber's mailbox (see [`mailbox`]).
    /// Fails with a usage error when the fiber has terminated.
    pub fn send<M: Any + Send>(&self, msg: M) -> Result<()> {
        sched::post_message(&self.sched, self.slot, self.task_id, Box::new(msg))
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.task_id).finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}
impl Eq for TaskHandle {}
impl std::hash::Hash for TaskHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.task_id.hash(state)
    }
}

/// Handle of the currently running fiber, if any.
pub fn current() -> Option<TaskHandle> {
    current_ctx().map(|ctx| TaskHandle {
        sched: ctx.sched,
        slot: ctx.slot,
        task_id: ctx.task_id,
    })
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned permission to join on a fiber (block on its termination).
///
/// Dropping the handle implicitly *detaches* the fiber: it keeps running,
/// and an abnormal termination is logged and swallowed instead of being
/// re-raised. The scheduler never terminates the process on a fiber error.
pub struct JoinHandle<T> {
    task: TaskHandle,
    join: Arc<JoinShared<T>>,
    joined: bool,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> u64 {
        self.task.id()
    }

    /// A clonable handle to the same fiber.
    pub fn task(&self) -> TaskHandle {
        self.task.clone()
    }

    /// See [`TaskHandle::interrupt`].
    pub fn interrupt(&self) {
        self.task.interrupt();
    }

    /// `true` once the fiber has terminated and its result is available.
    pub fn is_finished(&self) -> bool {
        self.join.lock().result.is_some()
    }

    /// Suspends until the fiber terminates and re-raises its error if any.
    /// This is a suspension point; an interruption of the *joining* fiber
    /// surfaces as [`Error::Interrupted`] while the target keeps running.
    pub fn join(self) -> Result<T> {
        self.join_inner(false)
    }

    /// Like [`join`](Self::join) but with interruption delivery masked for
    /// the duration of this call only.
    pub fn join_uninterruptible(self) -> Result<T> {
        self.join_inner(true)
    }

    fn join_inner(mut self, shielded: bool) -> Result<T> {
        self.joined = true;
        let ctx = current_ctx();
        loop {
            let mut inner = self.join.lock();
            if let Some(res) = inner.result.take() {
                return res.map_err(Error::Task);
            }
            match &ctx {
                Some(ctx) => {
                    let prev = shielded.then(|| ctx.set_shielded(true));
                    let ticket = match ctx.begin_wait() {
                        Ok(t) => t,
                        Err(e) => {
                            if let Some(p) = prev {
                                ctx.set_shielded(p);
                            }
                            return Err(e);
                        }
                    };
                    let id = inner.waiters.push_fiber(ctx, ticket);
                    drop(inner);
                    let reason = ctx.commit_wait(ticket, WaitKind::Queue, Deadline::NEVER);
                    if let Some(p) = prev {
                        ctx.set_shielded(p);
                    }
                    if reason == WakeReason::Interrupted {
                        self.join.lock().waiters.remove(id);
                        return Err(Error::Interrupted);
                    }
                }
                None => {
                    let tw = Arc::new(wait::ThreadWaiter::new());
                    inner.waiters.push_thread(Arc::clone(&tw));
                    drop(inner);
                    tw.wait(Deadline::NEVER);
                }
            }
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        let mut inner = self.join.lock();
        inner.detached = true;
        if let Some(Err(msg)) = &inner.result {
            log::error!(
                "fiber {} terminated with an unhandled error: {msg}",
                self.task.id()
            );
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.task.id()).finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Creates a new fiber and **yields** execution to it immediately,
/// returning a [`JoinHandle`] for the new fiber.
///
/// The join handle implicitly *detaches* the child fiber upon being
/// dropped; [`JoinHandle::join`] acquires the fiber function's result.
///
/// This creates a fiber with the default parameters of [`Builder`]; use
/// the builder to set a name or stack size.
///
/// # Panics
/// Panics when called outside of a running [`Runtime`].
///
/// [`Runtime`]: crate::runtime::Runtime
pub fn start<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().start(f).expect("failed to spawn fiber")
}

/// Creates a new *proc* fiber (one that does not return a value) and
/// **yields** execution to it immediately.
///
/// For more details see [`start`].
pub fn start_proc<F>(f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().start(f).expect("failed to spawn fiber")
}

/// Creates a new fiber and schedules it for execution after everything
/// currently runnable, returning a [`JoinHandle`] for it.
pub fn defer<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().defer(f).expect("failed to spawn fiber")
}

/// Puts the current fiber to sleep for at least `time`. The fiber is never
/// resumed earlier than requested, but may be resumed later.
///
/// This is a suspension point: an interruption surfaces here as
/// [`Error::Interrupted`]. Outside of a runtime this falls back to a plain
/// thread sleep.
pub fn sleep(time: Duration) -> Result<()> {
    match current_ctx() {
        Some(ctx) => match ctx.suspend(WaitKind::Sleep, Deadline::after(time))? {
            WakeReason::Interrupted => Err(Error::Interrupted),
            WakeReason::TimedOut | WakeReason::Ready => Ok(()),
        },
        None => {
            std::thread::sleep(time);
            Ok(())
        }
    }
}

/// [`sleep`] with interruption delivery masked for the duration of the
/// call only.
pub fn sleep_uninterruptible(time: Duration) {
    match current_ctx() {
        Some(ctx) => {
            let prev = ctx.set_shielded(true);
            let _ = sleep(time);
            ctx.set_shielded(prev);
        }
        None => std::thread::sleep(time),
    }
}

/// Returns control to the scheduler, placing the current fiber at the tail
/// of the runnable queue. Every fiber runnable at the time of the yield
/// gets a chance to run before this fiber resumes.
///
/// Returns [`Error::Interrupted`] when the fiber was interrupted.
pub fn yield_now() -> Result<()> {
    match current_ctx() {
        Some(ctx) => ctx.yield_now(),
        None => {
            std::thread::yield_now();
            Ok(())
        }
    }
}

/// Report loop begin time. Uses the monotonic clock.
pub fn clock() -> std::time::Instant {
    crate::clock::now()
}

////////////////////////////////////////////////////////////////////////////////
// Cond
////////////////////////////////////////////////////////////////////////////////

/// Conditional variable for cooperative multitasking.
///
/// A cond (short for "condition variable") is a synchronization primitive
/// that allows fibers to yield until some predicate is satisfied. Fiber
/// conditions have two basic operations, [`wait`](Cond::wait) and
/// [`signal`](Cond::signal): `wait` suspends execution of the fiber (i.e.
/// yields) until `signal` is called; `broadcast` wakes every waiter.
///
/// Like `pthread_cond`, `Cond` can issue spurious wake ups, so callers are
/// expected to re-check their predicate in a loop. Unlike `pthread_cond`
/// it does not require mutex wrapping. Waiters are woken in FIFO order of
/// suspension.
pub struct Cond {
    waiters: std::sync::Mutex<wait::WaitQueue>,
}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new() -> Self {
        Self {
            waiters: std::sync::Mutex::new(wait::WaitQueue::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, wait::WaitQueue> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake one fiber waiting for the cond. Does nothing if no one is
    /// waiting. Does not yield.
    pub fn signal(&self) {
        self.lock().wake_one();
    }

    /// Wake up all fibers waiting for the cond. Does not yield.
    pub fn broadcast(&self) {
        self.lock().wake_all();
    }

    /// Suspends the current fiber until [`signal`](Self::signal) is called.
    pub fn wait(&self) -> Result<()> {
        self.wait_deadline(Deadline::NEVER).map(drop)
    }

    /// Suspends the current fiber until a signal or the timeout. Returns
    /// `Ok(true)` on signal (or spurious wake up), `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_deadline(Deadline::after(timeout))
    }

    fn wait_deadline(&self, deadline: Deadline) -> Result<bool> {
        match current_ctx() {
            Some(ctx) => {
                let ticket = ctx.begin_wait()?;
                let id = {
                    let mut q = self.lock();
                    q.push_fiber(&ctx, ticket)
                };
                match ctx.commit_wait(ticket, WaitKind::Queue, deadline) {
                    WakeReason::Ready => Ok(true),
                    WakeReason::TimedOut => {
                        self.lock().remove(id);
                        Ok(false)
                    }
                    WakeReason::Interrupted => {
                        self.lock().remove(id);
                        Err(Error::Interrupted)
                    }
                }
            }
            None => {
                let tw = Arc::new(wait::ThreadWaiter::new());
                let id = self.lock().push_thread(Arc::clone(&tw));
                let woken = tw.wait(deadline);
                if !woken {
                    self.lock().remove(id);
                }
                Ok(woken)
            }
        }
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond").finish_non_exhaustive()
    }
}
