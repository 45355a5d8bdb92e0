//! Async adapters
//!
//! The engine never blocks: it runs on an `EventLoop` that somebody has to
//! drive. The adapters here drive it from `poll`, so a readable can be
//! consumed as a `futures::Stream` and stream completion awaited as a
//! `Future` on a single-threaded executor (a tokio `LocalSet`, for example).
//! Chunks pushed from another task wake the poller through the loop's waker.
//!
//! Timeouts are the caller's business: wrap the futures in
//! `tokio::time::timeout` or similar.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::channel::oneshot;
use futures::Stream;

use crate::chunk::Chunk;
use crate::error::{Result, StreamError};
use crate::idgen::ListenerId;
use crate::notification::{Event, EventKind, Observable};
use crate::readable::Readable;
use crate::scheduler::EventLoop;
use crate::writable::Writable;

type WakerSlot = Rc<RefCell<Option<Waker>>>;

fn wake(slot: &WakerSlot) {
    let waker = slot.borrow_mut().take();
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Chunks of a readable, pulled in paused mode
///
/// Yields `Err` once if the stream fails, then ends.
pub struct Chunks {
    readable: Readable,
    waker: WakerSlot,
    listeners: Vec<ListenerId>,
    done: bool,
}

impl Chunks {
    fn new(readable: &Readable) -> Self {
        let waker: WakerSlot = Rc::new(RefCell::new(None));
        let listeners = [
            EventKind::Readable,
            EventKind::End,
            EventKind::Error,
            EventKind::Close,
        ]
        .into_iter()
        .map(|kind| {
            let waker = waker.clone();
            readable.on(kind, move |_| wake(&waker))
        })
        .collect();
        Self {
            readable: readable.clone(),
            waker,
            listeners,
            done: false,
        }
    }
}

impl Stream for Chunks {
    type Item = Result<Chunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(chunk) = this.readable.read(None) {
                return Poll::Ready(Some(Ok(chunk)));
            }
            if let Some(e) = this.readable.error() {
                this.done = true;
                return Poll::Ready(Some(Err(e)));
            }
            if this.readable.is_destroyed()
                || (this.readable.received_end() && this.readable.buffered_len() == 0)
            {
                // let the end notification go out before reporting completion
                this.readable.event_loop().run_until_idle();
                this.done = true;
                return Poll::Ready(None);
            }
            if this.readable.event_loop().run_until_idle() == 0 {
                *this.waker.borrow_mut() = Some(cx.waker().clone());
                this.readable.event_loop().register_waker(cx.waker());
                return Poll::Pending;
            }
        }
    }
}

impl Drop for Chunks {
    fn drop(&mut self) {
        for id in self.listeners.drain(..) {
            self.readable.unsubscribe(id);
        }
    }
}

/// Resolves when a stream reaches its terminal notification
///
/// Polling drives the event loop. A stream closed without reaching the
/// notification resolves to `StreamError::Destroyed`.
pub struct Completion {
    event_loop: EventLoop,
    receiver: oneshot::Receiver<Result<()>>,
}

impl Completion {
    fn watch(event_loop: &EventLoop, target: &impl Observable, success: EventKind) -> Self {
        let (sender, receiver) = oneshot::channel();
        let sender = Rc::new(RefCell::new(Some(sender)));

        for kind in [success, EventKind::Error, EventKind::Close] {
            let sender = sender.clone();
            target.once(kind, move |event| {
                let result = match event {
                    Event::Error(e) => Err(e.clone()),
                    Event::Close => Err(StreamError::Destroyed),
                    _ => Ok(()),
                };
                if let Some(sender) = sender.borrow_mut().take() {
                    // the receiver may be gone already
                    let _ = sender.send(result);
                }
            });
        }
        Self {
            event_loop: event_loop.clone(),
            receiver,
        }
    }

    fn resolved(event_loop: &EventLoop, result: Result<()>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self {
            event_loop: event_loop.clone(),
            receiver,
        }
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match Pin::new(&mut self.receiver).poll(cx) {
                Poll::Ready(Ok(result)) => return Poll::Ready(result),
                Poll::Ready(Err(oneshot::Canceled)) => {
                    return Poll::Ready(Err(StreamError::Destroyed))
                }
                Poll::Pending => {}
            }
            if self.event_loop.run_until_idle() == 0 {
                self.event_loop.register_waker(cx.waker());
                return Poll::Pending;
            }
        }
    }
}

impl Readable {
    /// Consume the stream as an async `Stream` of chunks
    ///
    /// Registers a `readable` listener, which switches the stream to paused
    /// mode.
    #[must_use]
    pub fn chunks(&self) -> Chunks {
        Chunks::new(self)
    }

    /// Resolves once `end` is emitted; the data must be consumed by someone
    #[must_use]
    pub fn ended(&self) -> Completion {
        if self.is_ended() {
            return Completion::resolved(self.event_loop(), Ok(()));
        }
        if let Some(e) = self.error() {
            return Completion::resolved(self.event_loop(), Err(e));
        }
        Completion::watch(self.event_loop(), self, EventKind::End)
    }
}

impl Writable {
    /// Resolves once `finish` is emitted
    #[must_use]
    pub fn finished(&self) -> Completion {
        if self.is_finished() {
            return Completion::resolved(self.event_loop(), Ok(()));
        }
        if let Some(e) = self.error() {
            return Completion::resolved(self.event_loop(), Err(e));
        }
        Completion::watch(self.event_loop(), self, EventKind::Finish)
    }
}
