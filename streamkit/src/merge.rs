//! Fan-in of several readables into one output stream
//!
//! Chunks are forwarded from whichever source has data first; the order
//! within one source is preserved. The output ends once the merge is sealed
//! (no more sources will be added) and every source has ended. An error on a
//! source is re-emitted on the output, which then stays open.

use std::cell::RefCell;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{ProtocolViolation, Result};
use crate::idgen::ListenerId;
use crate::notification::{Callback, Event, EventKind, Observable};
use crate::pipe::{pipe, PipeOptions, ReadableSide};
use crate::readable::Readable;
use crate::scheduler::EventLoop;
use crate::transform::{Transform, TransformOptions};

#[derive(Default)]
struct Sources {
    active: Vec<Readable>,
    sealed: bool,
    ended: bool,
}

#[derive(Clone)]
pub struct Merge {
    output: Transform,
    sources: Rc<RefCell<Sources>>,
}

impl Merge {
    #[must_use]
    pub fn new(event_loop: &EventLoop, options: TransformOptions) -> Self {
        Self {
            output: Transform::pass_through(event_loop, options),
            sources: Rc::new(RefCell::new(Sources::default())),
        }
    }

    /// Start forwarding `source`
    ///
    /// # Errors
    /// Fails with `ProtocolViolation::AddAfterSeal` once `seal` was called.
    pub fn add(&self, source: &impl ReadableSide) -> Result<()> {
        if self.sources.borrow().sealed {
            return Err(ProtocolViolation::AddAfterSeal.into());
        }
        self.attach(source.readable_half());
        Ok(())
    }

    fn attach(&self, source: &Readable) {
        self.sources.borrow_mut().active.push(source.clone());
        let count = self.sources.borrow().active.len();
        tracing::debug!(sources = count, "merge: source added");

        let (sources, output) = (Rc::downgrade(&self.sources), self.output.clone());
        let weak_source = source.downgrade();
        source.once(EventKind::End, move |_| {
            if let (Some(sources), Some(source)) = (sources.upgrade(), weak_source.upgrade()) {
                sources
                    .borrow_mut()
                    .active
                    .retain(|s| !s.ptr_eq(&source));
                tracing::debug!(
                    sources = sources.borrow().active.len(),
                    "merge: source ended"
                );
                finish_if_done(&sources, &output);
            }
        });

        let (sources, output) = (Rc::downgrade(&self.sources), self.output.clone());
        let weak_source = source.downgrade();
        source.on(EventKind::Error, move |event| {
            if let Event::Error(e) = event {
                tracing::debug!(error = %e, "merge: source failed");
                output.readable().emit(event);
            }
            // a failed source never ends; stop waiting for it
            if let (Some(sources), Some(source)) = (sources.upgrade(), weak_source.upgrade()) {
                sources
                    .borrow_mut()
                    .active
                    .retain(|s| !s.ptr_eq(&source));
                finish_if_done(&sources, &output);
            }
        });

        pipe(source, self.output.writable(), PipeOptions { end: false });
    }

    /// No more sources will be added
    pub fn seal(&self) {
        self.sources.borrow_mut().sealed = true;
        finish_if_done(&self.sources, &self.output);
    }

    /// No source is currently active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.borrow().active.is_empty()
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.borrow().active.len()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sources.borrow().sealed
    }

    #[must_use]
    pub fn output(&self) -> &Transform {
        &self.output
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        self.output.read(n)
    }
}

fn finish_if_done(sources: &Rc<RefCell<Sources>>, output: &Transform) {
    {
        let mut s = sources.borrow_mut();
        if !s.sealed || !s.active.is_empty() || s.ended {
            return;
        }
        s.ended = true;
    }
    tracing::debug!("merge: all sources ended");
    if let Err(e) = output.end() {
        log::debug!("merge: could not end output: {e}");
    }
}

/// Merge a fixed set of sources; the result is sealed immediately
pub fn merge_readables<R: ReadableSide>(
    event_loop: &EventLoop,
    options: TransformOptions,
    sources: impl IntoIterator<Item = R>,
) -> Merge {
    let merge = Merge::new(event_loop, options);
    for source in sources {
        merge.attach(source.readable_half());
    }
    merge.seal();
    merge
}

impl ReadableSide for Merge {
    fn readable_half(&self) -> &Readable {
        self.output.readable()
    }
}

impl Observable for Merge {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        self.output.subscribe(kind, once, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.output.unsubscribe(id)
    }
}

impl std::fmt::Debug for Merge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.sources.borrow();
        f.debug_struct("Merge")
            .field("sources", &s.active.len())
            .field("sealed", &s.sealed)
            .field("ended", &s.ended)
            .finish()
    }
}
