//! Per-fiber heterogeneous mailboxes.
//!
//! Any fiber holding a [`TaskHandle`] can [`send`](TaskHandle::send) a
//! value of any `Any + Send` type to the target's mailbox. The receiving
//! fiber declares which message types it is ready for by supplying one
//! handler per type; [`receive`] scans the mailbox from the head and
//! removes the *first* message matching *any* supplied handler. Messages
//! no handler matches are skipped in place, never dequeued, and stay
//! available for later receives with a matching handler.
//!
//! ```no_run
//! use weft::fiber::mailbox::{on, receive};
//!
//! struct Ping(u32);
//! struct Quit;
//!
//! receive((
//!     on(|Ping(n): Ping| println!("ping {n}")),
//!     on(|_: Quit| println!("bye")),
//! )).unwrap();
//! ```
//!
//! [`TaskHandle`]: crate::fiber::TaskHandle
//! [`TaskHandle::send`]: crate::fiber::TaskHandle::send

use std::any::Any;
use std::marker::PhantomData;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched::{self, current_ctx};

/// One typed message handler; build with [`on`].
pub struct On<M, F> {
    f: F,
    marker: PhantomData<fn(M)>,
}

/// Wraps a closure into a handler for messages of type `M`.
pub fn on<M, F>(f: F) -> On<M, F>
where
    M: Any + Send,
    F: FnMut(M),
{
    On {
        f,
        marker: PhantomData,
    }
}

pub trait Handler {
    fn matches(&self, msg: &(dyn Any + Send)) -> bool;
    fn call(&mut self, msg: Box<dyn Any + Send>);
}

impl<M, F> Handler for On<M, F>
where
    M: Any + Send,
    F: FnMut(M),
{
    fn matches(&self, msg: &(dyn Any + Send)) -> bool {
        msg.is::<M>()
    }

    fn call(&mut self, msg: Box<dyn Any + Send>) {
        let msg = msg
            .downcast::<M>()
            .expect("matches() verified the message type");
        (self.f)(*msg);
    }
}

/// A tuple of [`Handler`]s, one per message type the receive is ready for.
pub trait HandlerSet {
    fn matches(&self, msg: &(dyn Any + Send)) -> bool;
    fn dispatch(&mut self, msg: Box<dyn Any + Send>);
}

macro_rules! impl_handler_set {
    ($($h:ident : $idx:tt),+) => {
        impl<$($h: Handler),+> HandlerSet for ($($h,)+) {
            fn matches(&self, msg: &(dyn Any + Send)) -> bool {
                $(self.$idx.matches(msg))||+
            }

            fn dispatch(&mut self, msg: Box<dyn Any + Send>) {
                $(
                    if self.$idx.matches(msg.as_ref()) {
                        return self.$idx.call(msg);
                    }
                )+
                unreachable!("dispatch called with an unmatched message");
            }
        }
    };
}

impl_handler_set! { H0: 0 }
impl_handler_set! { H0: 0, H1: 1 }
impl_handler_set! { H0: 0, H1: 1, H2: 2 }
impl_handler_set! { H0: 0, H1: 1, H2: 2, H3: 3 }
impl_handler_set! { H0: 0, H1: 1, H2: 2, H3: 3, H4: 4 }

/// Blocks until a message matching one of the handlers is at hand, then
/// dispatches it. Only valid inside a fiber.
pub fn receive<H: HandlerSet>(handlers: H) -> Result<()> {
    receive_deadline(handlers, Deadline::NEVER).map(drop)
}

/// Like [`receive`] but bounded; returns `Ok(false)` when the timeout
/// elapses with no matching message.
pub fn receive_timeout<H: HandlerSet>(handlers: H, timeout: Duration) -> Result<bool> {
    receive_deadline(handlers, Deadline::after(timeout))
}

fn receive_deadline<H: HandlerSet>(mut handlers: H, deadline: Deadline) -> Result<bool> {
    let ctx = current_ctx()
        .ok_or_else(|| Error::usage("mailbox receive is only available inside a fiber"))?;
    let msg = match sched::mailbox_receive(&ctx, &mut |m| handlers.matches(m), deadline) {
        Ok(msg) => msg,
        Err(Error::TimedOut) => return Ok(false),
        Err(e) => return Err(e),
    };
    handlers.dispatch(msg);
    Ok(true)
}
