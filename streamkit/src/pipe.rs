//! Pipe controller
//!
//! `source.pipe(&dest)` forwards every chunk of `source` to `dest.write()`.
//! When a write returns false the source is paused until `dest` emits
//! `drain`; when the source ends, `dest.end()` is called (unless
//! `PipeOptions::end` is false).
//!
//! Errors are not propagated: an error on the source removes the link but
//! leaves `dest` untouched. An error, `close` or `finish` on `dest` removes
//! the link as well.

use serde::Deserialize;

use crate::duplex::Duplex;
use crate::idgen::{next_listener_id, ListenerId};
use crate::notification::{Event, EventKind, Observable};
use crate::readable::{Readable, ReadableMode};
use crate::transform::Transform;
use crate::writable::Writable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// One source-to-destination association, owned by the source
pub(crate) struct PipeLink {
    id: ListenerId,
    dest: Writable,
    source_listeners: Vec<ListenerId>,
    dest_listeners: Vec<ListenerId>,
    awaiting_drain: bool,
}

/// Anything with a readable half
pub trait ReadableSide {
    fn readable_half(&self) -> &Readable;

    /// Pipe into `dest`; returns `dest` for chaining
    fn pipe<W>(&self, dest: &W) -> W
    where
        Self: Sized,
        W: WritableSide + Clone,
    {
        self.pipe_with(dest, PipeOptions::default())
    }

    fn pipe_with<W>(&self, dest: &W, options: PipeOptions) -> W
    where
        Self: Sized,
        W: WritableSide + Clone,
    {
        pipe(self.readable_half(), dest.writable_half(), options);
        dest.clone()
    }

    /// Remove the link to `dest`; returns false if there was none
    fn unpipe<W>(&self, dest: &W) -> bool
    where
        Self: Sized,
        W: WritableSide,
    {
        unpipe(self.readable_half(), dest.writable_half())
    }

    /// Remove every link; returns how many there were
    fn unpipe_all(&self) -> usize {
        let source = self.readable_half();
        let ids: Vec<ListenerId> = source.pipes().borrow().iter().map(|l| l.id).collect();
        ids.into_iter()
            .filter(|id| unlink(source, *id))
            .count()
    }

    fn pipe_count(&self) -> usize {
        self.readable_half().pipes().borrow().len()
    }
}

/// Anything with a writable half
pub trait WritableSide {
    fn writable_half(&self) -> &Writable;
}

/// A pipeline stage: both readable and writable
pub trait Stage: ReadableSide + WritableSide {}

impl<T: ReadableSide + WritableSide> Stage for T {}

impl ReadableSide for Readable {
    fn readable_half(&self) -> &Readable {
        self
    }
}

impl WritableSide for Writable {
    fn writable_half(&self) -> &Writable {
        self
    }
}

impl ReadableSide for Transform {
    fn readable_half(&self) -> &Readable {
        self.readable()
    }
}

impl WritableSide for Transform {
    fn writable_half(&self) -> &Writable {
        self.writable()
    }
}

impl ReadableSide for Duplex {
    fn readable_half(&self) -> &Readable {
        self.readable()
    }
}

impl WritableSide for Duplex {
    fn writable_half(&self) -> &Writable {
        self.writable()
    }
}

/// Link `source` to `dest`
pub fn pipe(source: &Readable, dest: &Writable, options: PipeOptions) {
    let link = next_listener_id();
    tracing::debug!(link = link.id(), end = options.end, "pipe: linking");

    let dest_listeners = vec![
        {
            let source = source.clone();
            dest.on(EventKind::Drain, move |_| on_drain(&source, link))
        },
        {
            let source = source.clone();
            dest.once(EventKind::Error, move |_| {
                unlink(&source, link);
            })
        },
        {
            let source = source.clone();
            dest.once(EventKind::Close, move |_| {
                unlink(&source, link);
            })
        },
        {
            let source = source.clone();
            dest.once(EventKind::Finish, move |_| {
                unlink(&source, link);
            })
        },
    ];

    let mut source_listeners = Vec::with_capacity(4);
    {
        let (weak, dest) = (source.downgrade(), dest.clone());
        source_listeners.push(source.once(EventKind::End, move |_| {
            if options.end {
                if let Err(e) = dest.end() {
                    log::debug!("pipe: could not end destination: {e}");
                }
            }
            if let Some(source) = weak.upgrade() {
                unlink(&source, link);
            }
        }));
    }
    for kind in [EventKind::Error, EventKind::Close] {
        let weak = source.downgrade();
        source_listeners.push(source.once(kind, move |_| {
            if let Some(source) = weak.upgrade() {
                unlink(&source, link);
            }
        }));
    }

    source.pipes().borrow_mut().push(PipeLink {
        id: link,
        dest: dest.clone(),
        source_listeners,
        dest_listeners,
        awaiting_drain: false,
    });

    let data = {
        let (weak, dest) = (source.downgrade(), dest.clone());
        source.on(EventKind::Data, move |event| {
            let Event::Data(chunk) = event else {
                return;
            };
            let accepted = match dest.write(chunk.clone()) {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::debug!("pipe: write failed: {e}");
                    false
                }
            };
            if !accepted {
                if let Some(source) = weak.upgrade() {
                    set_awaiting(&source, link, true);
                    source.pause();
                }
            }
        })
    };
    if let Some(l) = source
        .pipes()
        .borrow_mut()
        .iter_mut()
        .find(|l| l.id == link)
    {
        l.source_listeners.push(data);
    }

    if source.mode() != ReadableMode::Flowing {
        source.resume();
    }
}

/// Remove the link from `source` to `dest`
pub fn unpipe(source: &Readable, dest: &Writable) -> bool {
    let link = source
        .pipes()
        .borrow()
        .iter()
        .find(|l| l.dest.ptr_eq(dest))
        .map(|l| l.id);
    link.is_some_and(|id| unlink(source, id))
}

fn unlink(source: &Readable, link: ListenerId) -> bool {
    let removed = {
        let mut pipes = source.pipes().borrow_mut();
        match pipes.iter().position(|l| l.id == link) {
            Some(pos) => pipes.remove(pos),
            None => return false,
        }
    };
    for id in removed.source_listeners {
        source.unsubscribe(id);
    }
    for id in removed.dest_listeners {
        removed.dest.unsubscribe(id);
    }
    tracing::debug!(link = link.id(), "pipe: unlinked");
    true
}

fn set_awaiting(source: &Readable, link: ListenerId, awaiting: bool) {
    if let Some(l) = source
        .pipes()
        .borrow_mut()
        .iter_mut()
        .find(|l| l.id == link)
    {
        l.awaiting_drain = awaiting;
    }
}

fn on_drain(source: &Readable, link: ListenerId) {
    set_awaiting(source, link, false);
    let blocked = source.pipes().borrow().iter().any(|l| l.awaiting_drain);
    if !blocked && source.listener_count(EventKind::Data) > 0 {
        source.resume();
    }
}
