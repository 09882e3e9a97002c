//! Task pipes: bounded byte FIFOs with blocking semantics.
//!
//! A [`TaskPipe`] moves bytes between exactly two parties, a producer and
//! a consumer, which may live in different fibers or different OS threads.
//! Bytes arrive in FIFO order with no duplication or loss: at any time
//! while the pipe is open, bytes written equal bytes read plus bytes
//! buffered. Waiters are woken in FIFO order of suspension.
//!
//! [`pipe_pair`] presents two pipes as a pair of connected full-duplex
//! streams, which is how in-process connections are built.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched::{current_ctx, WaitKind, WakeReason};
use crate::fiber::wait::{ThreadWaiter, WaitQueue};
use crate::stream::{ConnectionStream, InputStream, IoMode, OutputStream};

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    grow_when_full: bool,
    closed: bool,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
}

impl PipeState {
    fn space(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }
}

/// A bounded FIFO of bytes between one writer and one reader.
#[derive(Clone)]
pub struct TaskPipe {
    state: Arc<Mutex<PipeState>>,
}

impl TaskPipe {
    /// `grow_when_full` switches a full pipe from blocking the writer to
    /// expanding its capacity so every write is admitted immediately.
    pub fn new(capacity: usize, grow_when_full: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(PipeState {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                grow_when_full,
                closed: false,
                read_waiters: WaitQueue::new(),
                write_waiters: WaitQueue::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes according to `mode`, blocking while the pipe is full (unless
    /// growable). Writing to a closed pipe is a broken-pipe error.
    pub fn write(&self, buf: &[u8], mode: IoMode) -> Result<usize> {
        let mut written = 0;
        loop {
            let mut st = self.lock();
            if st.closed {
                return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
            }
            let space = if st.grow_when_full {
                buf.len() - written
            } else {
                st.space()
            };
            let n = space.min(buf.len() - written);
            if n > 0 {
                st.buf.extend(&buf[written..written + n]);
                written += n;
                st.read_waiters.wake_one();
            }
            let done = match mode {
                IoMode::All => written == buf.len(),
                IoMode::Once => written > 0 || buf.is_empty(),
                IoMode::Immediate => true,
            };
            if done {
                return Ok(written);
            }
            self.park(st, Select::Write, Deadline::NEVER)?;
        }
    }

    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.write(buf, IoMode::All).map(drop)
    }

    /// Reads according to `mode`, blocking while the pipe is empty and
    /// open. Returns 0 once the pipe is closed and drained.
    pub fn read(&self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read = 0;
        loop {
            let mut st = self.lock();
            let n = st.buf.len().min(buf.len() - read);
            for b in buf[read..read + n].iter_mut() {
                *b = st.buf.pop_front().expect("length was checked");
            }
            if n > 0 {
                read += n;
                st.write_waiters.wake_one();
            }
            let done = match mode {
                IoMode::All => read == buf.len(),
                IoMode::Once => read > 0,
                IoMode::Immediate => true,
            };
            if done {
                return Ok(read);
            }
            if st.closed {
                return if mode == IoMode::All {
                    Err(crate::stream::unexpected_eof())
                } else {
                    Ok(read)
                };
            }
            self.park(st, Select::Read, Deadline::NEVER)?;
        }
    }

    /// A borrowed view of the contiguous readable front of the pipe;
    /// consumes nothing and may be empty.
    pub fn peek(&self) -> PipeView<'_> {
        PipeView {
            guard: self.lock(),
        }
    }

    /// Marks the pipe closed and wakes all waiters; pending bytes stay
    /// readable until drained.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.read_waiters.wake_all();
        st.write_waiters.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least one byte is readable or the pipe is closed.
    /// `false` on timeout.
    pub fn wait_for_data(&self, timeout: Duration) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        loop {
            let st = self.lock();
            if !st.buf.is_empty() || st.closed {
                return Ok(true);
            }
            match self.park(st, Select::Read, deadline) {
                Ok(()) => {}
                Err(Error::TimedOut) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for TaskPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("TaskPipe")
            .field("buffered", &st.buf.len())
            .field("capacity", &st.capacity)
            .field("closed", &st.closed)
            .finish()
    }
}

/// Borrowed view into the readable front of a pipe.
pub struct PipeView<'a> {
    guard: MutexGuard<'a, PipeState>,
}

impl std::ops::Deref for PipeView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.buf.as_slices().0
    }
}

#[derive(Clone, Copy)]
enum Select {
    Read,
    Write,
}

fn select_queue(st: &mut PipeState, select: Select) -> &mut WaitQueue {
    match select {
        Select::Read => &mut st.read_waiters,
        Select::Write => &mut st.write_waiters,
    }
}

impl TaskPipe {
    /// Registers the caller in the chosen wait set, releases the state
    /// lock and parks. The caller re-checks its condition on return.
    fn park(
        &self,
        mut st: MutexGuard<'_, PipeState>,
        select: Select,
        deadline: Deadline,
    ) -> Result<()> {
        match current_ctx() {
            Some(ctx) => {
                let ticket = ctx.begin_wait()?;
                let id = select_queue(&mut st, select).push_fiber(&ctx, ticket);
                drop(st);
                match ctx.commit_wait(ticket, WaitKind::Queue, deadline) {
                    WakeReason::Ready => Ok(()),
                    reason => {
                        select_queue(&mut self.lock(), select).remove(id);
                        match reason {
                            WakeReason::TimedOut => Err(Error::TimedOut),
                            _ => Err(Error::Interrupted),
                        }
                    }
                }
            }
            None => {
                let tw = Arc::new(ThreadWaiter::new());
                let id = select_queue(&mut st, select).push_thread(Arc::clone(&tw));
                drop(st);
                if tw.wait(deadline) {
                    Ok(())
                } else {
                    select_queue(&mut self.lock(), select).remove(id);
                    Err(Error::TimedOut)
                }
            }
        }
    }
}

/// Two task pipes presented as a pair of connected full-duplex streams.
/// Bytes written to one end become readable on the other.
pub fn pipe_pair(capacity: usize) -> (PipeStream, PipeStream) {
    let a = TaskPipe::new(capacity, false);
    let b = TaskPipe::new(capacity, false);
    (
        PipeStream {
            rx: a.clone(),
            tx: b.clone(),
            peek_buf: Vec::new(),
        },
        PipeStream {
            rx: b,
            tx: a,
            peek_buf: Vec::new(),
        },
    )
}

/// One end of an in-process full-duplex connection backed by task pipes.
#[derive(Clone)]
pub struct PipeStream {
    rx: TaskPipe,
    tx: TaskPipe,
    peek_buf: Vec<u8>,
}

impl InputStream for PipeStream {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        self.rx.read(buf, mode)
    }

    fn least_size(&mut self) -> Result<u64> {
        self.rx.wait_for_data(crate::clock::INFINITY)?;
        Ok(self.rx.len() as u64)
    }

    fn data_available(&self) -> usize {
        self.rx.len()
    }

    fn peek(&mut self) -> Result<&[u8]> {
        let view = self.rx.peek();
        self.peek_buf.clear();
        self.peek_buf.extend_from_slice(&view);
        drop(view);
        Ok(&self.peek_buf)
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.rx.wait_for_data(timeout)
    }
}

impl OutputStream for PipeStream {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        self.tx.write(buf, mode)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.tx.close();
        Ok(())
    }
}

impl ConnectionStream for PipeStream {
    fn connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn close(&mut self) -> Result<()> {
        self.tx.close();
        self.rx.close();
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_no_loss() {
        let pipe = TaskPipe::new(64, false);
        pipe.write_all(b"abc").unwrap();
        pipe.write_all(b"def").unwrap();
        let mut buf = [0u8; 6];
        pipe.read(&mut buf, IoMode::All).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn growable_pipe_admits_oversized_write() {
        let pipe = TaskPipe::new(4, true);
        pipe.write_all(b"0123456789").unwrap();
        assert_eq!(pipe.len(), 10);
    }

    #[test]
    fn bounded_pipe_never_exceeds_capacity() {
        let pipe = TaskPipe::new(4, false);
        let n = pipe.write(b"0123456789", IoMode::Immediate).unwrap();
        assert_eq!(n, 4);
        assert_eq!(pipe.len(), 4);
    }

    #[test]
    fn read_after_close_drains_then_zero() {
        let pipe = TaskPipe::new(16, false);
        pipe.write_all(b"tail").unwrap();
        pipe.close();
        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf, IoMode::Once).unwrap(), 4);
        assert_eq!(pipe.read(&mut buf, IoMode::Once).unwrap(), 0);
        assert!(pipe.write_all(b"x").is_err());
    }

    #[test]
    fn peek_is_non_consuming() {
        let pipe = TaskPipe::new(16, false);
        pipe.write_all(b"look").unwrap();
        assert_eq!(&*pipe.peek(), b"look");
        assert_eq!(pipe.len(), 4);
    }

    #[test]
    fn pipe_pair_is_cross_connected() {
        let (mut a, mut b) = pipe_pair(32);
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read(&mut buf, IoMode::All).unwrap();
        assert_eq!(&buf, b"ping");
        b.write_all(b"pong").unwrap();
        a.read(&mut buf, IoMode::All).unwrap();
        assert_eq!(&buf, b"pong");
    }
}
