//! The event reactor: converts fd readiness and timer expirations into
//! fiber wake-ups.
//!
//! One reactor exists per scheduler thread and is only ever touched by its
//! scheduler loop; cross-thread interaction happens through the
//! [`mio::Waker`] alone. Readiness is delivered edge-agnostically here and
//! converted into level-triggered behavior at the stream layer, which
//! retries the syscall until `EWOULDBLOCK` before waiting again.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::clock;

bitflags::bitflags! {
    /// Readiness events a fiber can wait for on a file descriptor.
    pub struct IoEvents: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// A wake-up produced by one reactor iteration. `token` identifies the
/// waiting fiber slot; a single satisfied handle wakes at most one fiber.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wakeup {
    Io { token: usize },
    Timer { token: usize, seq: u64 },
}

/// Per-fd registration state. A connection split into reader and writer
/// halves may have two distinct fibers waiting on the same fd, one per
/// direction.
#[derive(Default)]
struct FdEntry {
    read_waiter: Option<usize>,
    write_waiter: Option<usize>,
}

impl FdEntry {
    fn interest(&self) -> Option<Interest> {
        match (self.read_waiter.is_some(), self.write_waiter.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct TimerEntry {
    at: Instant,
    token: usize,
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdEntry>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
}

impl Reactor {
    /// Creates the reactor together with the waker other threads use to
    /// interrupt a blocking [`Reactor::poll`].
    pub fn new() -> io::Result<(Self, mio::Waker)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok((
            Self {
                poll,
                events: Events::with_capacity(256),
                fds: HashMap::new(),
                timers: BinaryHeap::new(),
            },
            waker,
        ))
    }

    /// Associates `fd` with the waiting fiber `token` for the requested
    /// events. Idempotent for the same fd: a second direction merges into
    /// the existing registration.
    pub fn add_io(&mut self, fd: RawFd, events: IoEvents, token: usize) -> io::Result<()> {
        let entry = self.fds.entry(fd).or_default();
        let was_registered = entry.interest().is_some();
        if events.contains(IoEvents::READ) {
            entry.read_waiter = Some(token);
        }
        if events.contains(IoEvents::WRITE) {
            entry.write_waiter = Some(token);
        }
        let interest = entry
            .interest()
            .expect("at least one direction was just set");
        if was_registered {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(fd as usize), interest)
        }
    }

    /// Drops the waiter `token` from `fd`, narrowing or removing the OS
    /// registration.
    pub fn remove_io(&mut self, fd: RawFd, token: usize) {
        let Some(entry) = self.fds.get_mut(&fd) else {
            return;
        };
        if entry.read_waiter == Some(token) {
            entry.read_waiter = None;
        }
        if entry.write_waiter == Some(token) {
            entry.write_waiter = None;
        }
        match entry.interest() {
            Some(interest) => {
                let _ = self
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest);
            }
            None => {
                self.fds.remove(&fd);
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
    }

    /// Arms a one-shot timer. Stale timers are filtered by `seq` at expiry
    /// instead of being removed from the heap.
    pub fn add_timer(&mut self, at: Instant, token: usize, seq: u64) {
        self.timers.push(Reverse(TimerEntry { at, token, seq }));
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.at)
    }

    /// Blocks until readiness, timer expiry or a waker wake, collecting the
    /// resulting wake-ups. A timer never fires before its deadline.
    pub fn poll(&mut self, out: &mut Vec<Wakeup>) -> io::Result<()> {
        let timeout = match self.next_timer() {
            Some(at) => Some(at.saturating_duration_since(clock::now())),
            None => None,
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let fd = token.0 as RawFd;
            let Some(entry) = self.fds.get_mut(&fd) else {
                continue;
            };
            // An error or hang-up must wake whoever waits on the fd so the
            // failure surfaces through the subsequent syscall.
            let fatal = event.is_error() || event.is_read_closed() || event.is_write_closed();
            let mut woken: Vec<usize> = Vec::new();
            if event.is_readable() || fatal {
                if let Some(t) = entry.read_waiter.take() {
                    woken.push(t);
                }
            }
            if event.is_writable() || fatal {
                if let Some(t) = entry.write_waiter.take() {
                    woken.push(t);
                }
            }
            match entry.interest() {
                Some(interest) => {
                    let _ = self
                        .poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), token, interest);
                }
                None => {
                    self.fds.remove(&fd);
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
            for t in woken {
                out.push(Wakeup::Io { token: t });
            }
        }

        let now = clock::now();
        while let Some(Reverse(t)) = self.timers.peek() {
            if t.at > now {
                break;
            }
            let Reverse(t) = self.timers.pop().expect("peeked entry exists");
            out.push(Wakeup::Timer {
                token: t.token,
                seq: t.seq,
            });
        }
        Ok(())
    }

}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("fds", &self.fds.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}
