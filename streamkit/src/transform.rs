//! Transform: a duplex whose halves are coupled by a transform hook
//!
//! Each accepted write is handed to the transform hook, which pushes zero or
//! more chunks into the readable half and completes its `Ack`. The write
//! itself is only acknowledged after that, and while the readable half is at
//! its high-water mark the pending chunk waits for a consumer to pull. After
//! the writable half ends, the flush hook runs; the readable half's
//! end-of-stream follows once it completes.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use streamkit::{Chunk, EventLoop, Observable, Transform, TransformOptions};
//!
//! let event_loop = EventLoop::new();
//! let upper = Transform::map(&event_loop, TransformOptions::default(), |chunk| {
//!     Ok(Chunk::from(chunk.to_text_lossy().to_uppercase()))
//! });
//!
//! let out = Rc::new(RefCell::new(String::new()));
//! let o = out.clone();
//! upper.on_data(move |chunk| o.borrow_mut().push_str(&chunk.to_text_lossy()));
//! upper.write("hello, ").unwrap();
//! upper.write("world!").unwrap();
//! upper.end().unwrap();
//! event_loop.run_until_idle();
//! assert_eq!(*out.borrow(), "HELLO, WORLD!");
//! ```

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::Deserialize;

use crate::ack::Ack;
use crate::chunk::Chunk;
use crate::duplex::{route_subscribe, route_unsubscribe, Halves};
use crate::encoding::Encoding;
use crate::error::{Result, StreamError};
use crate::idgen::ListenerId;
use crate::notification::{Callback, EventKind, Observable};
use crate::readable::{Readable, ReadableOptions};
use crate::scheduler::EventLoop;
use crate::writable::{Writable, WritableOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
}

impl TransformOptions {
    /// Object mode on both halves
    #[must_use]
    pub fn objects() -> Self {
        Self {
            readable: ReadableOptions::objects(),
            writable: WritableOptions::objects(),
        }
    }

    #[must_use]
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.readable.high_water_mark = Some(high_water_mark);
        self.writable.high_water_mark = Some(high_water_mark);
        self
    }
}

type TransformHook = Box<dyn FnMut(&Transform, Chunk, Option<Encoding>, Ack)>;
type FlushHook = Box<dyn FnMut(&Transform, Ack)>;

/// The written chunk waiting for the transform hook, with its write ack
struct Pending {
    chunk: Chunk,
    encoding: Option<Encoding>,
    ack: Ack,
}

#[derive(Default)]
struct Coupling {
    pending: Option<Pending>,
    transforming: bool,
    need_transform: bool,
    pumping: bool,
}

struct Shared {
    halves: Halves,
    coupling: RefCell<Coupling>,
    transform: RefCell<Option<TransformHook>>,
    flush: RefCell<Option<FlushHook>>,
}

impl Shared {
    fn handle(self: &Rc<Self>) -> Option<Transform> {
        let (readable, writable) = self.halves.get()?;
        Some(Transform {
            readable,
            writable,
            shared: self.clone(),
        })
    }

    fn readable(&self) -> Option<Readable> {
        self.halves.get().map(|(readable, _)| readable)
    }

    /// Write hook of the writable half
    fn write(self: &Rc<Self>, chunk: Chunk, encoding: Option<Encoding>, ack: Ack) {
        let (transforming, need_transform) = {
            let mut c = self.coupling.borrow_mut();
            c.pending = Some(Pending {
                chunk,
                encoding,
                ack,
            });
            (c.transforming, c.need_transform)
        };
        if transforming {
            return;
        }
        if need_transform || self.readable().is_some_and(|r| r.wants_data()) {
            self.read();
        }
    }

    /// Fill hook of the readable half: run the pending chunk, if any
    fn read(self: &Rc<Self>) {
        {
            let mut c = self.coupling.borrow_mut();
            c.need_transform = true;
            if c.pumping {
                return;
            }
            c.pumping = true;
        }

        loop {
            let job = {
                let mut c = self.coupling.borrow_mut();
                if c.transforming || !c.need_transform {
                    None
                } else {
                    let job = c.pending.take();
                    if job.is_some() {
                        c.transforming = true;
                        c.need_transform = false;
                    }
                    job
                }
            };
            let Some(job) = job else {
                break;
            };
            self.run_transform(job);
        }

        self.coupling.borrow_mut().pumping = false;
    }

    fn run_transform(self: &Rc<Self>, job: Pending) {
        let Pending {
            chunk,
            encoding,
            ack: write_ack,
        } = job;

        let weak: Weak<Self> = Rc::downgrade(self);
        let ack = Ack::new("transform hook", move |result| match weak.upgrade() {
            Some(shared) => shared.after_transform(result, write_ack),
            None => write_ack.done(result),
        });

        let Some(transform) = self.handle() else {
            ack.err(StreamError::Destroyed);
            return;
        };
        let hook = self.transform.borrow_mut().take();
        match hook {
            Some(mut hook) => {
                hook(&transform, chunk, encoding, ack);
                let mut slot = self.transform.borrow_mut();
                if slot.is_none() {
                    *slot = Some(hook);
                }
            }
            None => ack.err(StreamError::Destroyed),
        }
    }

    fn after_transform(self: &Rc<Self>, result: Result<()>, write_ack: Ack) {
        self.coupling.borrow_mut().transforming = false;
        write_ack.done(result);
        if let Some(readable) = self.readable() {
            readable.clear_reading();
            if readable.wants_data() {
                self.read();
            }
        }
    }

    /// Final hook of the writable half
    fn finalize(self: &Rc<Self>, final_ack: Ack) {
        let Some(transform) = self.handle() else {
            final_ack.err(StreamError::Destroyed);
            return;
        };
        let hook = self.flush.borrow_mut().take();
        let Some(mut hook) = hook else {
            end_readable(&transform.readable);
            final_ack.ok();
            return;
        };

        let weak: Weak<Self> = Rc::downgrade(self);
        let ack = Ack::new("flush hook", move |result| {
            if result.is_ok() {
                if let Some(readable) = weak.upgrade().and_then(|shared| shared.readable()) {
                    end_readable(&readable);
                }
            }
            final_ack.done(result);
        });
        hook(&transform, ack);
    }
}

fn end_readable(readable: &Readable) {
    if let Err(e) = readable.push_end() {
        log::debug!("transform: could not end readable half: {e}");
    }
}

#[derive(Clone)]
pub struct Transform {
    readable: Readable,
    writable: Writable,
    shared: Rc<Shared>,
}

impl Transform {
    pub fn new(
        event_loop: &EventLoop,
        options: TransformOptions,
        transform: impl FnMut(&Transform, Chunk, Option<Encoding>, Ack) + 'static,
    ) -> Self {
        Self::build(event_loop, options, Box::new(transform), None)
    }

    /// Transform whose `flush` hook runs after the writable half ends, before
    /// the readable half ends; it may push chunks of its own
    pub fn with_flush(
        event_loop: &EventLoop,
        options: TransformOptions,
        transform: impl FnMut(&Transform, Chunk, Option<Encoding>, Ack) + 'static,
        flush: impl FnMut(&Transform, Ack) + 'static,
    ) -> Self {
        Self::build(
            event_loop,
            options,
            Box::new(transform),
            Some(Box::new(flush)),
        )
    }

    /// Identity transform
    #[must_use]
    pub fn pass_through(event_loop: &EventLoop, options: TransformOptions) -> Self {
        Self::new(event_loop, options, |t, chunk, _, ack| match t.push(chunk) {
            Ok(_) => ack.ok(),
            Err(e) => ack.err(e),
        })
    }

    /// One output chunk per input chunk
    pub fn map(
        event_loop: &EventLoop,
        options: TransformOptions,
        mut f: impl FnMut(Chunk) -> Result<Chunk> + 'static,
    ) -> Self {
        Self::new(event_loop, options, move |t, chunk, _, ack| {
            match f(chunk).and_then(|out| t.push(out)) {
                Ok(_) => ack.ok(),
                Err(e) => ack.err(e),
            }
        })
    }

    fn build(
        event_loop: &EventLoop,
        options: TransformOptions,
        transform: TransformHook,
        flush: Option<FlushHook>,
    ) -> Self {
        let shared = Rc::new(Shared {
            halves: Halves::default(),
            coupling: RefCell::new(Coupling::default()),
            transform: RefCell::new(Some(transform)),
            flush: RefCell::new(flush),
        });

        let s = shared.clone();
        let readable = Readable::with_fill(event_loop, options.readable, move |_, _| {
            s.read();
            Ok(())
        });
        readable.prime();

        let (s, f) = (shared.clone(), shared.clone());
        let writable = Writable::with_final(
            event_loop,
            options.writable,
            move |_, chunk, encoding, ack| s.write(chunk, encoding, ack),
            move |_, ack| f.finalize(ack),
        );

        shared.halves.bind(&readable, &writable);
        Self {
            readable,
            writable,
            shared,
        }
    }

    #[must_use]
    pub fn readable(&self) -> &Readable {
        &self.readable
    }

    #[must_use]
    pub fn writable(&self) -> &Writable {
        &self.writable
    }

    /// Emit an output chunk (from the transform or flush hook)
    ///
    /// # Errors
    /// See `Readable::push`.
    pub fn push(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.readable.push(chunk)
    }

    /// # Errors
    /// See `Writable::write`.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.writable.write(chunk)
    }

    /// # Errors
    /// See `Writable::write_encoded`.
    pub fn write_encoded(&self, text: &str, encoding: Encoding) -> Result<bool> {
        self.writable.write_encoded(text, encoding)
    }

    /// # Errors
    /// See `Writable::end`.
    pub fn end(&self) -> Result<()> {
        self.writable.end()
    }

    /// # Errors
    /// See `Writable::end_with`.
    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<()> {
        self.writable.end_with(chunk)
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        self.readable.read(n)
    }

    pub fn pause(&self) {
        self.readable.pause();
    }

    pub fn resume(&self) {
        self.readable.resume();
    }

    pub fn set_encoding(&self, encoding: Encoding) {
        self.readable.set_encoding(encoding);
    }

    /// Destroy both halves; the error is reported once, by the writable half
    pub fn destroy(&self, error: Option<StreamError>) {
        self.writable.destroy(error);
        self.readable.destroy(None);
        let pending = self.shared.coupling.borrow_mut().pending.take();
        drop(pending);
    }

    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        self.readable.event_loop()
    }
}

impl Observable for Transform {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        route_subscribe(&self.readable, &self.writable, kind, once, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        route_unsubscribe(&self.readable, &self.writable, id)
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
