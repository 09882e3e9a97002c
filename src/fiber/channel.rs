//! Typed bounded channels between fibers (and plain threads).
//!
//! The sending and receiving halves count their live ends: when the last
//! `Sender` is dropped the channel is closed and blocked receivers drain
//! the remaining messages before observing disconnection; when the last
//! `Receiver` is dropped further sends fail immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Deadline;
use crate::fiber::sched::{current_ctx, WaitKind, WakeReason};
use crate::fiber::wait::{ThreadWaiter, WaitQueue};

type StdResult<T, E> = std::result::Result<T, E>;

/// Creates a new bounded channel, returning the sender/receiver halves.
///
/// All data sent on the `Sender` becomes available on the `Receiver` in
/// the order it was sent. `send` blocks while the buffer is full, `recv`
/// blocks while it is empty. A capacity of zero behaves like a capacity
/// of one.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Channel {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            tx_count: 1,
            rx_count: 1,
            send_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
        }),
    });
    (Sender(Arc::clone(&shared)), Receiver(shared))
}

struct State<T> {
    queue: VecDeque<T>,
    capacity: usize,
    tx_count: usize,
    rx_count: usize,
    send_waiters: WaitQueue,
    recv_waiters: WaitQueue,
}

pub struct Channel<T> {
    state: Mutex<State<T>>,
}

impl<T> Channel<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a message over the channel, yielding while the buffer is full.
    ///
    /// In case the channel was closed or the current fiber was interrupted
    /// the message is handed back inside the error so the caller can reuse
    /// it.
    fn send(&self, t: T, deadline: Deadline) -> StdResult<(), SendError<T>> {
        loop {
            let mut state = self.lock();
            if state.rx_count == 0 {
                return Err(SendError::Disconnected(t));
            }
            if state.queue.len() < state.capacity {
                state.queue.push_back(t);
                state.recv_waiters.wake_one();
                return Ok(());
            }
            match current_ctx() {
                Some(ctx) => {
                    let ticket = match ctx.begin_wait() {
                        Ok(ticket) => ticket,
                        Err(_) => return Err(SendError::Disconnected(t)),
                    };
                    let id = state.send_waiters.push_fiber(&ctx, ticket);
                    drop(state);
                    match ctx.commit_wait(ticket, WaitKind::Queue, deadline) {
                        WakeReason::Ready => {}
                        WakeReason::TimedOut => {
                            self.lock().send_waiters.remove(id);
                            return Err(SendError::Timeout(t));
                        }
                        WakeReason::Interrupted => {
                            self.lock().send_waiters.remove(id);
                            return Err(SendError::Disconnected(t));
                        }
                    }
                }
                None => {
                    let tw = Arc::new(ThreadWaiter::new());
                    let id = state.send_waiters.push_thread(Arc::clone(&tw));
                    drop(state);
                    if !tw.wait(deadline) {
                        self.lock().send_waiters.remove(id);
                        return Err(SendError::Timeout(t));
                    }
                }
            }
            // Re-check the condition; the freed capacity may have been
            // claimed by a competing sender in the meantime.
        }
    }

    /// Receive a message, yielding while the channel is empty and open.
    fn recv(&self, deadline: Deadline) -> StdResult<T, RecvError> {
        loop {
            let mut state = self.lock();
            if let Some(t) = state.queue.pop_front() {
                state.send_waiters.wake_one();
                return Ok(t);
            }
            if state.tx_count == 0 {
                return Err(RecvError::Disconnected);
            }
            match current_ctx() {
                Some(ctx) => {
                    let ticket = match ctx.begin_wait() {
                        Ok(ticket) => ticket,
                        Err(_) => return Err(RecvError::Disconnected),
                    };
                    let id = state.recv_waiters.push_fiber(&ctx, ticket);
                    drop(state);
                    match ctx.commit_wait(ticket, WaitKind::Queue, deadline) {
                        WakeReason::Ready => {}
                        WakeReason::TimedOut => {
                            self.lock().recv_waiters.remove(id);
                            return Err(RecvError::Timeout);
                        }
                        WakeReason::Interrupted => {
                            self.lock().recv_waiters.remove(id);
                            return Err(RecvError::Disconnected);
                        }
                    }
                }
                None => {
                    let tw = Arc::new(ThreadWaiter::new());
                    let id = state.recv_waiters.push_thread(Arc::clone(&tw));
                    drop(state);
                    if !tw.wait(deadline) {
                        self.lock().recv_waiters.remove(id);
                        return Err(RecvError::Timeout);
                    }
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

pub struct Sender<T>(Arc<Channel<T>>);

impl<T> Sender<T> {
    /// Blocks until the message is delivered into the buffer. On a closed
    /// channel the message is returned back to the caller.
    pub fn send(&self, t: T) -> StdResult<(), T> {
        self.0.send(t, Deadline::NEVER).map_err(SendError::into_inner)
    }

    pub fn send_timeout(&self, t: T, timeout: Duration) -> StdResult<(), SendError<T>> {
        self.0.send(t, Deadline::after(timeout))
    }

    pub fn try_send(&self, t: T) -> StdResult<(), TrySendError<T>> {
        self.0.send(t, Deadline::after(Duration::ZERO)).map_err(From::from)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.lock().tx_count += 1;
        Sender(Arc::clone(&self.0))
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.tx_count -= 1;
        if state.tx_count == 0 {
            // Pending receivers must observe the disconnect.
            state.recv_waiters.wake_all();
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Timeout(T),
    Disconnected(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Disconnected(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Disconnected(t) => t,
        }
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Disconnected(t) => Self::Disconnected(t),
            SendError::Timeout(t) => Self::Full(t),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

pub struct Receiver<T>(Arc<Channel<T>>);

impl<T> Receiver<T> {
    /// Blocks until a message is available; `None` once the channel is
    /// closed and drained (or the current fiber is interrupted).
    pub fn recv(&self) -> Option<T> {
        self.0.recv(Deadline::NEVER).ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> StdResult<T, RecvError> {
        self.0.recv(Deadline::after(timeout))
    }

    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        self.0.recv(Deadline::after(Duration::ZERO)).map_err(From::from)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }

    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { rx: self }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.lock().rx_count += 1;
        Receiver(Arc::clone(&self.0))
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.rx_count -= 1;
        if state.rx_count == 0 {
            state.send_waiters.wake_all();
        }
    }
}

pub struct Iter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

pub struct TryIter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub struct IntoIter<T> {
    rx: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { rx: self }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Disconnected => Self::Disconnected,
            RecvError::Timeout => Self::Empty,
        }
    }
}
