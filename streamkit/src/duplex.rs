//! Duplex: an independently buffered Readable half and Writable half behind
//! one handle
//!
//! Data-side notifications (`data`, `end`, `readable`) come from the
//! readable half; write-side ones (`drain`, `prefinish`, `finish`) from the
//! writable half. `error` listeners are attached to both. `close` fires once:
//! after both halves have closed, or as soon as a failed half closes.

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

use serde::Deserialize;

use crate::ack::Ack;
use crate::chunk::Chunk;
use crate::encoding::Encoding;
use crate::error::{Result, StreamError};
use crate::idgen::{next_listener_id, ListenerId};
use crate::notification::{Callback, Event, EventKind, Observable};
use crate::readable::{Readable, ReadableOptions, WeakReadable};
use crate::scheduler::EventLoop;
use crate::writable::{WeakWritable, Writable, WritableOptions};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    /// When false, the end of the readable half ends the writable half
    pub allow_half_open: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            readable: ReadableOptions::default(),
            writable: WritableOptions::default(),
            allow_half_open: true,
        }
    }
}

/// Weak back-references from hooks to the halves that own them
#[derive(Default)]
pub(crate) struct Halves {
    readable: OnceCell<WeakReadable>,
    writable: OnceCell<WeakWritable>,
}

impl Halves {
    pub(crate) fn bind(&self, readable: &Readable, writable: &Writable) {
        // set once, right after construction
        let _ = self.readable.set(readable.downgrade());
        let _ = self.writable.set(writable.downgrade());
    }

    pub(crate) fn get(&self) -> Option<(Readable, Writable)> {
        let readable = self.readable.get()?.upgrade()?;
        let writable = self.writable.get()?.upgrade()?;
        Some((readable, writable))
    }
}

/// Subscribe on the half that owns `kind`
pub(crate) fn route_subscribe(
    readable: &Readable,
    writable: &Writable,
    kind: EventKind,
    once: bool,
    callback: Callback,
) -> ListenerId {
    match kind {
        EventKind::Data | EventKind::End | EventKind::Readable => {
            readable.subscribe(kind, once, callback)
        }
        EventKind::Drain | EventKind::Prefinish | EventKind::Finish => {
            writable.subscribe(kind, once, callback)
        }
        EventKind::Error => {
            let id = next_listener_id();
            readable.listen_as(id, kind, once, callback.clone());
            writable.listen_as(id, kind, once, callback);
            id
        }
        EventKind::Close => {
            let id = next_listener_id();
            let callback = close_once(readable, writable, callback);
            readable.listen_as(id, kind, once, callback.clone());
            writable.listen_as(id, kind, once, callback);
            id
        }
    }
}

/// Wrap a `close` listener so it runs once for the pair of halves
fn close_once(readable: &Readable, writable: &Writable, callback: Callback) -> Callback {
    let (readable, writable) = (readable.downgrade(), writable.downgrade());
    let fired = Cell::new(false);
    Rc::new(RefCell::new(move |event: &Event| {
        if fired.get() {
            return;
        }
        let (readable, writable) = (readable.upgrade(), writable.upgrade());
        let readable_done = readable
            .as_ref()
            .map_or(true, |r| r.is_ended() || r.is_destroyed());
        let writable_done = writable
            .as_ref()
            .map_or(true, |w| w.is_finished() || w.is_destroyed());
        let failed = readable.as_ref().is_some_and(|r| r.error().is_some())
            || writable.as_ref().is_some_and(|w| w.error().is_some());
        if !(readable_done && writable_done) && !failed {
            return;
        }
        if let Ok(mut f) = callback.try_borrow_mut() {
            fired.set(true);
            f(event);
        }
    }))
}

pub(crate) fn route_unsubscribe(readable: &Readable, writable: &Writable, id: ListenerId) -> bool {
    let from_readable = readable.unsubscribe(id);
    let from_writable = writable.unsubscribe(id);
    from_readable || from_writable
}

/// End `writable` when `readable` ends
fn close_half_open(readable: &Readable, writable: &Writable) {
    let writable = writable.downgrade();
    readable.once(EventKind::End, move |_| {
        if let Some(writable) = writable.upgrade() {
            log::debug!("duplex: readable half ended, ending writable half");
            if let Err(e) = writable.end() {
                log::debug!("duplex: could not end writable half: {e}");
            }
        }
    });
}

#[derive(Clone)]
pub struct Duplex {
    readable: Readable,
    writable: Writable,
}

impl Duplex {
    /// Duplex with its own producer (`fill`) and consumer (`write`) hooks
    pub fn new(
        event_loop: &EventLoop,
        options: DuplexOptions,
        mut fill: impl FnMut(&Duplex, usize) -> Result<()> + 'static,
        mut write: impl FnMut(&Duplex, Chunk, Option<Encoding>, Ack) + 'static,
    ) -> Self {
        let halves = Rc::new(Halves::default());

        let h = halves.clone();
        let readable = Readable::with_fill(event_loop, options.readable, move |_, size| {
            match h.get() {
                Some((readable, writable)) => fill(&Duplex { readable, writable }, size),
                None => Ok(()),
            }
        });

        let h = halves.clone();
        let writable = Writable::new(event_loop, options.writable, move |_, chunk, encoding, ack| {
            match h.get() {
                Some((readable, writable)) => {
                    write(&Duplex { readable, writable }, chunk, encoding, ack);
                }
                None => ack.err(StreamError::Destroyed),
            }
        });

        halves.bind(&readable, &writable);
        if !options.allow_half_open {
            close_half_open(&readable, &writable);
        }
        Self { readable, writable }
    }

    /// Wrap an existing writable and readable into one stream: writes go to
    /// `writable`, reads come from `readable`
    #[must_use]
    pub fn from_parts(writable: Writable, readable: Readable) -> Self {
        Self { readable, writable }
    }

    #[must_use]
    pub fn readable(&self) -> &Readable {
        &self.readable
    }

    #[must_use]
    pub fn writable(&self) -> &Writable {
        &self.writable
    }

    /// # Errors
    /// See `Readable::push`.
    pub fn push(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.readable.push(chunk)
    }

    /// # Errors
    /// See `Readable::push_end`.
    pub fn push_end(&self) -> Result<bool> {
        self.readable.push_end()
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        self.readable.read(n)
    }

    /// # Errors
    /// See `Writable::write`.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.writable.write(chunk)
    }

    /// # Errors
    /// See `Writable::end`.
    pub fn end(&self) -> Result<()> {
        self.writable.end()
    }

    pub fn pause(&self) {
        self.readable.pause();
    }

    pub fn resume(&self) {
        self.readable.resume();
    }

    /// Destroy both halves; the error is reported once, by the writable half
    pub fn destroy(&self, error: Option<StreamError>) {
        self.writable.destroy(error);
        self.readable.destroy(None);
    }
}

impl Observable for Duplex {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        route_subscribe(&self.readable, &self.writable, kind, once, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        route_unsubscribe(&self.readable, &self.writable, id)
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
