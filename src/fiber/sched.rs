//! The cooperative scheduler.
//!
//! One scheduler exists per runtime thread. Each fiber is hosted on a
//! dedicated OS thread whose execution is gated by its scheduler: per
//! scheduler exactly one fiber runs at any instant and the baton changes
//! hands only at suspension points, so between suspension points a fiber's
//! operations are atomic with respect to every other fiber on the same
//! scheduler. Fibers never migrate.
//!
//! The scheduler thread itself runs [`run_loop`]: it hands the baton to
//! runnable fibers in FIFO order and, when none are runnable, parks in the
//! reactor until an fd, timer or cross-thread waker produces a wake-up.

use std::any::Any;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use slab::Slab;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::reactor::{IoEvents, Reactor, Wakeup};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: std::cell::RefCell<Option<FiberCtx>> = const { std::cell::RefCell::new(None) };
}

/// Identity and scheduler affinity of the currently running fiber.
#[derive(Clone)]
pub(crate) struct FiberCtx {
    pub sched: Arc<Sched>,
    pub slot: usize,
    pub task_id: u64,
}

pub(crate) fn current_ctx() -> Option<FiberCtx> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Why a suspended fiber resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Ready,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiberState {
    Created,
    Runnable,
    Running,
    Waiting,
}

/// What a suspending fiber asked the reactor for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitKind {
    /// Timer only (or indefinite park when the deadline is `NEVER`).
    Sleep,
    /// Readiness on an fd, with an optional timer.
    Io { fd: RawFd, events: IoEvents },
    /// An external wait queue holds a reference and will wake us; the
    /// reactor only contributes the timeout.
    Queue,
}

#[derive(Debug, Clone, Copy)]
struct PendingWait {
    kind: WaitKind,
    deadline: Deadline,
    seq: u64,
}

/// A ticket for an armed-but-not-yet-committed suspension. Wakes arriving
/// in the window between arming and committing are stored and consumed at
/// commit, so publishing a waiter before suspending cannot lose a wake-up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitTicket(pub(crate) u64);

struct FiberSlot {
    task_id: u64,
    state: FiberState,
    cv: Arc<Condvar>,
    interrupted: bool,
    shielded: bool,
    armed: bool,
    early_wake: Option<WakeReason>,
    wait_seq: u64,
    wake: WakeReason,
    pending: Option<PendingWait>,
    io_fd: Option<RawFd>,
    mailbox: VecDeque<Box<dyn Any + Send>>,
    mailbox_waiting: bool,
}

pub(crate) struct SchedState {
    slots: Slab<FiberSlot>,
    runnable: VecDeque<usize>,
    current: Option<usize>,
    pub(crate) live: usize,
    pub(crate) shutdown: bool,
    pending_dereg: Vec<(RawFd, usize)>,
}

pub(crate) struct Sched {
    pub(crate) id: usize,
    state: Mutex<SchedState>,
    loop_cv: Condvar,
    waker: mio::Waker,
}

impl Sched {
    pub fn new(id: usize, waker: mio::Waker) -> Self {
        Self {
            id,
            state: Mutex::new(SchedState {
                slots: Slab::new(),
                runnable: VecDeque::new(),
                current: None,
                live: 0,
                shutdown: false,
                pending_dereg: Vec::new(),
            }),
            loop_cv: Condvar::new(),
            waker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wakes a waiting fiber from outside the scheduler thread. Returns
    /// `false` when the ticket is stale (the fiber already resumed for
    /// another reason).
    pub(crate) fn wake_external(&self, slot: usize, seq: u64, reason: WakeReason) -> bool {
        let woke = {
            let mut st = self.lock();
            wake_locked(&mut st, slot, seq, reason)
        };
        if woke {
            let _ = self.waker.wake();
        }
        woke
    }

    /// Marks the target for interruption. Edge-triggered: a waiting fiber
    /// is woken with `Interrupted` right away, a running or runnable one
    /// observes exactly one `Interrupted` at its next suspension point.
    pub(crate) fn interrupt(&self, slot: usize, task_id: u64) {
        {
            let mut st = self.lock();
            let Some(s) = st.slots.get_mut(slot) else {
                return;
            };
            if s.task_id != task_id {
                return;
            }
            if s.shielded {
                s.interrupted = true;
            } else if s.state == FiberState::Waiting {
                let seq = s.wait_seq;
                wake_locked(&mut st, slot, seq, WakeReason::Interrupted);
            } else if s.armed && s.early_wake.is_none() {
                s.early_wake = Some(WakeReason::Interrupted);
            } else {
                s.interrupted = true;
            }
        }
        let _ = self.waker.wake();
    }

    /// Flags shutdown and interrupts every live fiber so blocked accept
    /// loops and handlers unwind through their suspension points.
    pub(crate) fn interrupt_all(&self) {
        let targets: Vec<(usize, u64)> = {
            let mut st = self.lock();
            st.shutdown = true;
            st.slots.iter().map(|(k, s)| (k, s.task_id)).collect()
        };
        for (slot, task_id) in targets {
            self.interrupt(slot, task_id);
        }
        let _ = self.waker.wake();
    }

    pub(crate) fn wake_reactor(&self) {
        let _ = self.waker.wake();
    }
}

impl std::fmt::Debug for Sched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sched").field("id", &self.id).finish_non_exhaustive()
    }
}

fn wake_locked(st: &mut SchedState, slot: usize, seq: u64, reason: WakeReason) -> bool {
    let Some(s) = st.slots.get_mut(slot) else {
        return false;
    };
    if s.armed && s.wait_seq == seq {
        // Woken before the suspension was committed.
        if s.early_wake.is_none() {
            s.early_wake = Some(reason);
            return true;
        }
        return false;
    }
    if s.state != FiberState::Waiting || s.wait_seq != seq {
        return false;
    }
    s.wake = reason;
    s.state = FiberState::Runnable;
    s.pending = None;
    if let Some(fd) = s.io_fd.take() {
        st.pending_dereg.push((fd, slot));
    }
    st.runnable.push_back(slot);
    true
}

fn wait_until_scheduled<'a>(
    mut st: MutexGuard<'a, SchedState>,
    slot: usize,
) -> MutexGuard<'a, SchedState> {
    let cv = st.slots[slot].cv.clone();
    loop {
        if st.current == Some(slot) && st.slots[slot].state == FiberState::Running {
            return st;
        }
        st = cv.wait(st).unwrap_or_else(|e| e.into_inner());
    }
}

/// Releases the baton and blocks the calling fiber thread until the
/// scheduler hands it back.
fn park<'a>(
    sched: &'a Sched,
    mut st: MutexGuard<'a, SchedState>,
    slot: usize,
) -> MutexGuard<'a, SchedState> {
    st.current = None;
    sched.loop_cv.notify_one();
    wait_until_scheduled(st, slot)
}

impl FiberCtx {
    /// Arms the next suspension. Returns `Err(Interrupted)` when a pending
    /// interruption is consumed instead (the suspension never starts).
    pub(crate) fn begin_wait(&self) -> Result<WaitTicket> {
        let mut st = self.sched.lock();
        let s = st
            .slots
            .get_mut(self.slot)
            .expect("current fiber has a live slot");
        if s.interrupted && !s.shielded {
            s.interrupted = false;
            return Err(Error::Interrupted);
        }
        s.wait_seq += 1;
        s.armed = true;
        s.early_wake = None;
        Ok(WaitTicket(s.wait_seq))
    }

    /// Suspends until woken. Any wake that raced with the arming window is
    /// returned immediately.
    pub(crate) fn commit_wait(
        &self,
        ticket: WaitTicket,
        kind: WaitKind,
        deadline: Deadline,
    ) -> WakeReason {
        let mut st = self.sched.lock();
        {
            let s = st
                .slots
                .get_mut(self.slot)
                .expect("current fiber has a live slot");
            debug_assert_eq!(s.wait_seq, ticket.0);
            s.armed = false;
            if let Some(r) = s.early_wake.take() {
                return r;
            }
            if deadline.expired() {
                return WakeReason::TimedOut;
            }
            s.state = FiberState::Waiting;
            s.wake = WakeReason::Ready;
            s.pending = Some(PendingWait {
                kind,
                deadline,
                seq: ticket.0,
            });
        }
        st = park(&self.sched, st, self.slot);
        st.slots[self.slot].wake
    }

    /// One-shot suspension with no external wait queue involved.
    pub(crate) fn suspend(&self, kind: WaitKind, deadline: Deadline) -> Result<WakeReason> {
        let ticket = self.begin_wait()?;
        Ok(self.commit_wait(ticket, kind, deadline))
    }

    /// Re-queues the current fiber at the tail of the runnable FIFO.
    pub(crate) fn yield_now(&self) -> Result<()> {
        let mut st = self.sched.lock();
        {
            let s = st
                .slots
                .get_mut(self.slot)
                .expect("current fiber has a live slot");
            if s.interrupted && !s.shielded {
                s.interrupted = false;
                return Err(Error::Interrupted);
            }
            s.state = FiberState::Runnable;
            s.wake = WakeReason::Ready;
        }
        let slot = self.slot;
        st.runnable.push_back(slot);
        let _unused = park(&self.sched, st, slot);
        Ok(())
    }

    /// Masks interruption delivery for the duration of an enclosed call.
    /// Returns the previous masking state.
    pub(crate) fn set_shielded(&self, shielded: bool) -> bool {
        let mut st = self.sched.lock();
        let s = st
            .slots
            .get_mut(self.slot)
            .expect("current fiber has a live slot");
        std::mem::replace(&mut s.shielded, shielded)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Mailbox
////////////////////////////////////////////////////////////////////////////////

/// Enqueues a message for the target fiber; wakes it when it is blocked in
/// a mailbox receive.
pub(crate) fn post_message(
    sched: &Sched,
    slot: usize,
    task_id: u64,
    msg: Box<dyn Any + Send>,
) -> Result<()> {
    let woke = {
        let mut st = sched.lock();
        let Some(s) = st.slots.get_mut(slot) else {
            return Err(Error::usage("message target fiber has terminated"));
        };
        if s.task_id != task_id {
            return Err(Error::usage("message target fiber has terminated"));
        }
        s.mailbox.push_back(msg);
        if s.mailbox_waiting && s.state == FiberState::Waiting {
            let seq = s.wait_seq;
            wake_locked(&mut st, slot, seq, WakeReason::Ready)
        } else {
            false
        }
    };
    if woke {
        sched.wake_reactor();
    }
    Ok(())
}

/// Scans the current fiber's mailbox from the head and removes the first
/// message `accepts` claims; messages it declines stay in place. Blocks
/// until an acceptable message arrives, the deadline passes or the fiber
/// is interrupted.
pub(crate) fn mailbox_receive(
    ctx: &FiberCtx,
    accepts: &mut dyn FnMut(&(dyn Any + Send)) -> bool,
    deadline: Deadline,
) -> Result<Box<dyn Any + Send>> {
    loop {
        let mut st = ctx.sched.lock();
        let s = st
            .slots
            .get_mut(ctx.slot)
            .expect("current fiber has a live slot");
        if s.interrupted && !s.shielded {
            s.interrupted = false;
            return Err(Error::Interrupted);
        }
        if let Some(pos) = s.mailbox.iter().position(|m| accepts(m.as_ref())) {
            let msg = s.mailbox.remove(pos).expect("position is in range");
            return Ok(msg);
        }
        if deadline.expired() {
            return Err(Error::TimedOut);
        }
        s.wait_seq += 1;
        let seq = s.wait_seq;
        s.mailbox_waiting = true;
        s.state = FiberState::Waiting;
        s.wake = WakeReason::Ready;
        s.pending = Some(PendingWait {
            kind: WaitKind::Queue,
            deadline,
            seq,
        });
        let slot = ctx.slot;
        st = park(&ctx.sched, st, slot);
        let s = &mut st.slots[slot];
        s.mailbox_waiting = false;
        match s.wake {
            WakeReason::Interrupted => return Err(Error::Interrupted),
            // Ready means a new message arrived: rescan. TimedOut rescans
            // once and reports through the deadline check above.
            WakeReason::Ready | WakeReason::TimedOut => {}
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Spawning
////////////////////////////////////////////////////////////////////////////////

/// Shared completion state between a fiber and its join handle.
pub(crate) struct JoinShared<T> {
    inner: Mutex<JoinInner<T>>,
}

pub(crate) struct JoinInner<T> {
    pub result: Option<std::result::Result<T, String>>,
    pub waiters: crate::fiber::wait::WaitQueue,
    pub detached: bool,
}

impl<T> JoinShared<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(JoinInner {
                result: None,
                waiters: crate::fiber::wait::WaitQueue::new(),
                detached: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JoinInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct SpawnSpec {
    pub name: String,
    pub stack_size: Option<usize>,
    /// Immediate start: the new fiber goes to the head of the runnable
    /// queue instead of the tail.
    pub at_front: bool,
}

pub(crate) fn spawn_on<T, F>(
    sched: &Arc<Sched>,
    spec: SpawnSpec,
    f: F,
) -> Result<(usize, u64, Arc<JoinShared<T>>)>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
    let join = Arc::new(JoinShared::new());

    let slot = {
        let mut st = sched.lock();
        let slot = st.slots.insert(FiberSlot {
            task_id,
            state: FiberState::Created,
            cv: Arc::new(Condvar::new()),
            interrupted: false,
            shielded: false,
            armed: false,
            early_wake: None,
            wait_seq: 0,
            wake: WakeReason::Ready,
            pending: None,
            io_fd: None,
            mailbox: VecDeque::new(),
            mailbox_waiting: false,
        });
        st.live += 1;
        slot
    };

    let mut builder = thread::Builder::new().name(format!("fiber/{}", spec.name));
    if let Some(size) = spec.stack_size {
        builder = builder.stack_size(size);
    }
    let sched2 = Arc::clone(sched);
    let join2 = Arc::clone(&join);
    let spawned = builder.spawn(move || fiber_main(sched2, slot, task_id, join2, f));
    if let Err(e) = spawned {
        let mut st = sched.lock();
        st.slots.remove(slot);
        st.live -= 1;
        return Err(e.into());
    }

    {
        let mut st = sched.lock();
        let s = &mut st.slots[slot];
        s.state = FiberState::Runnable;
        if spec.at_front {
            st.runnable.push_front(slot);
        } else {
            st.runnable.push_back(slot);
        }
    }
    sched.wake_reactor();
    Ok((slot, task_id, join))
}

fn fiber_main<T, F>(sched: Arc<Sched>, slot: usize, task_id: u64, join: Arc<JoinShared<T>>, f: F)
where
    F: FnOnce() -> T,
{
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(FiberCtx {
            sched: Arc::clone(&sched),
            slot,
            task_id,
        })
    });

    {
        let st = sched.lock();
        let _st = wait_until_scheduled(st, slot);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(f));

    {
        let mut inner = join.lock();
        match result {
            Ok(v) => inner.result = Some(Ok(v)),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                if inner.detached {
                    log::error!("fiber {task_id} terminated with an unhandled error: {msg}");
                }
                inner.result = Some(Err(msg));
            }
        }
        inner.waiters.wake_all();
    }

    let mut st = sched.lock();
    st.slots.remove(slot);
    st.live -= 1;
    st.current = None;
    sched.loop_cv.notify_one();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler loop
////////////////////////////////////////////////////////////////////////////////

fn drain_deregs(st: &mut SchedState, reactor: &mut Reactor) {
    for (fd, token) in st.pending_dereg.drain(..) {
        reactor.remove_io(fd, token);
    }
}

/// Drives the scheduler until `should_exit` reports true while no fiber is
/// runnable.
pub(crate) fn run_loop(
    sched: &Arc<Sched>,
    reactor: &mut Reactor,
    mut should_exit: impl FnMut(&SchedState) -> bool,
) {
    let mut wakeups: Vec<Wakeup> = Vec::new();
    let mut st = sched.lock();
    loop {
        while let Some(next) = st.runnable.pop_front() {
            {
                let Some(s) = st.slots.get_mut(next) else {
                    continue;
                };
                if s.state != FiberState::Runnable {
                    continue;
                }
                s.state = FiberState::Running;
            }
            st.current = Some(next);
            st.slots[next].cv.notify_one();
            while st.current.is_some() {
                st = sched
                    .loop_cv
                    .wait(st)
                    .unwrap_or_else(|e| e.into_inner());
            }

            // The fiber suspended or terminated; apply whatever it asked
            // the reactor for, unless something already woke it.
            let pending = st.slots.get_mut(next).and_then(|s| {
                let p = s.pending.take()?;
                (s.state == FiberState::Waiting && s.wait_seq == p.seq).then_some(p)
            });
            if let Some(p) = pending {
                match p.kind {
                    WaitKind::Io { fd, events } => match reactor.add_io(fd, events, next) {
                        Ok(()) => {
                            st.slots[next].io_fd = Some(fd);
                            if let Some(at) = p.deadline.instant() {
                                reactor.add_timer(at, next, p.seq);
                            }
                        }
                        Err(e) => {
                            log::warn!("reactor registration failed for fd: {e}");
                            wake_locked(&mut st, next, p.seq, WakeReason::Ready);
                        }
                    },
                    WaitKind::Sleep | WaitKind::Queue => {
                        if let Some(at) = p.deadline.instant() {
                            reactor.add_timer(at, next, p.seq);
                        }
                    }
                }
            }
            drain_deregs(&mut st, reactor);
        }

        drain_deregs(&mut st, reactor);
        if should_exit(&st) {
            return;
        }

        drop(st);
        wakeups.clear();
        if let Err(e) = reactor.poll(&mut wakeups) {
            log::error!("reactor poll failed: {e}");
        }
        st = sched.lock();
        for w in &wakeups {
            match *w {
                Wakeup::Io { token } => {
                    let seq = match st.slots.get(token) {
                        Some(s) if s.io_fd.is_some() => s.wait_seq,
                        _ => continue,
                    };
                    wake_locked(&mut st, token, seq, WakeReason::Ready);
                }
                Wakeup::Timer { token, seq } => {
                    wake_locked(&mut st, token, seq, WakeReason::TimedOut);
                }
            }
        }
        drain_deregs(&mut st, reactor);
    }
}
