//! Readable engine
//!
//! A pull/push hybrid source. The producer feeds chunks with `push` (from
//! the fill hook or from anywhere else); consumers either attach a `data`
//! listener (flowing mode) or call `read` after a `readable` notification
//! (paused mode).
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use streamkit::{EventLoop, Observable, Readable, ReadableOptions};
//!
//! let event_loop = EventLoop::new();
//! let mut source = vec!["a", "b", "c"].into_iter();
//! let readable = Readable::with_fill(&event_loop, ReadableOptions::default(), move |r, _| {
//!     match source.next() {
//!         Some(s) => r.push(s)?,
//!         None => r.push_end()?,
//!     };
//!     Ok(())
//! });
//!
//! let out = Rc::new(RefCell::new(String::new()));
//! let o = out.clone();
//! readable.on_data(move |chunk| o.borrow_mut().push_str(&chunk.to_text_lossy()));
//! event_loop.run_until_idle();
//! assert_eq!(*out.borrow(), "abc");
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Deserialize;

use crate::chunk::Chunk;
use crate::encoding::{Encoding, TextDecoder};
use crate::error::{ProtocolViolation, Result, StreamError};
use crate::idgen::ListenerId;
use crate::notification::{attach, Callback, Event, EventKind, Observable, Registry};
use crate::pipe::PipeLink;
use crate::queue::Queue;
use crate::scheduler::EventLoop;

/// Default threshold for byte streams
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;
/// Default threshold for object streams, in chunks
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

const MAX_HIGH_WATER_MARK: usize = 0x0080_0000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadableOptions {
    pub object_mode: bool,
    pub high_water_mark: Option<usize>,
    /// Ignored in object mode
    pub encoding: Option<Encoding>,
}

impl ReadableOptions {
    #[must_use]
    pub fn objects() -> Self {
        Self {
            object_mode: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    #[must_use]
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(if self.object_mode {
            DEFAULT_OBJECT_HIGH_WATER_MARK
        } else {
            DEFAULT_HIGH_WATER_MARK
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableMode {
    /// No consumer has attached yet
    Initial,
    Paused,
    Flowing,
    /// `end` was emitted
    Ended,
}

type FillHook = Box<dyn FnMut(&Readable, usize) -> Result<()>>;

struct State {
    buffer: Queue<Chunk>,
    high_water_mark: usize,
    decoder: Option<TextDecoder>,
    flowing: Option<bool>,
    detached_pause: bool,
    end_emitted: bool,
    reading: bool,
    sync: bool,
    need_readable: bool,
    emitted_readable: bool,
    readable_listening: bool,
    resume_scheduled: bool,
    read_more_scheduled: bool,
    delivering: bool,
    destroyed: bool,
    close_emitted: bool,
    error: Option<StreamError>,
}

impl State {
    fn ended(&self) -> bool {
        self.buffer.is_terminated()
    }

    fn how_much_to_read(&mut self, n: Option<usize>) -> usize {
        let size = self.buffer.size();
        if n == Some(0) || (size == 0 && self.ended()) {
            return 0;
        }
        if self.buffer.object_mode() {
            return 1;
        }
        let Some(n) = n else {
            return match (self.flowing, self.buffer.front()) {
                (Some(true), Some(first)) => first.len(),
                _ => size,
            };
        };
        if n > self.high_water_mark {
            self.high_water_mark = compute_high_water_mark(n);
        }
        if n <= size {
            return n;
        }
        if !self.ended() {
            self.need_readable = true;
            return 0;
        }
        size
    }
}

fn compute_high_water_mark(n: usize) -> usize {
    if n >= MAX_HIGH_WATER_MARK {
        MAX_HIGH_WATER_MARK
    } else {
        n.next_power_of_two()
    }
}

struct Inner {
    event_loop: EventLoop,
    registry: Registry,
    object_mode: bool,
    has_fill: bool,
    state: RefCell<State>,
    fill: RefCell<Option<FillHook>>,
    pipes: RefCell<Vec<PipeLink>>,
}

/// Handle to a readable stream; clones share the same stream
#[derive(Clone)]
pub struct Readable {
    inner: Rc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakReadable {
    inner: Weak<Inner>,
}

impl WeakReadable {
    pub(crate) fn upgrade(&self) -> Option<Readable> {
        self.inner.upgrade().map(|inner| Readable { inner })
    }
}

enum Admit {
    Add(Chunk),
    ReadMore,
    Ignore,
    Reject(ProtocolViolation),
}

impl Readable {
    /// Push-only readable: data arrives only through explicit `push` calls
    #[must_use]
    pub fn new(event_loop: &EventLoop, options: ReadableOptions) -> Self {
        Self::build(event_loop, &options, None)
    }

    /// Readable whose `fill` hook is asked for more data (with the current
    /// high-water mark as a size hint) whenever the buffer runs low
    pub fn with_fill(
        event_loop: &EventLoop,
        options: ReadableOptions,
        fill: impl FnMut(&Readable, usize) -> Result<()> + 'static,
    ) -> Self {
        Self::build(event_loop, &options, Some(Box::new(fill)))
    }

    fn build(event_loop: &EventLoop, options: &ReadableOptions, fill: Option<FillHook>) -> Self {
        let decoder = match options.encoding {
            Some(encoding) if !options.object_mode => Some(TextDecoder::new(encoding)),
            _ => None,
        };
        let state = State {
            buffer: Queue::new(options.object_mode),
            high_water_mark: options.effective_high_water_mark(),
            decoder,
            flowing: None,
            detached_pause: false,
            end_emitted: false,
            reading: false,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            read_more_scheduled: false,
            delivering: false,
            destroyed: false,
            close_emitted: false,
            error: None,
        };
        Self {
            inner: Rc::new(Inner {
                event_loop: event_loop.clone(),
                registry: Registry::new(),
                object_mode: options.object_mode,
                has_fill: fill.is_some(),
                state: RefCell::new(state),
                fill: RefCell::new(fill),
                pipes: RefCell::new(Vec::new()),
            }),
        }
    }

    //
    // Producer side
    //

    /// Buffer a chunk
    ///
    /// Returns `Ok(true)` while the buffer is below the high-water mark.
    ///
    /// # Errors
    /// Pushing after `push_end` is a protocol violation; the stream is
    /// failed and the chunk is discarded.
    pub fn push(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.add(chunk.into(), false)
    }

    /// Push text expressed in `encoding` (for example base64)
    ///
    /// # Errors
    /// As `push`, plus `StreamError::Encoding` for malformed text.
    pub fn push_encoded(&self, text: &str, encoding: Encoding) -> Result<bool> {
        if self.inner.object_mode {
            return self.push(text);
        }
        match encoding.encode(text) {
            Ok(bytes) => self.push(bytes),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Push the end-of-stream sentinel; a repeated call is a no-op
    ///
    /// # Errors
    /// Never fails today; kept fallible so producers can use `?` uniformly.
    pub fn push_end(&self) -> Result<bool> {
        let sync = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed || st.ended() {
                return Ok(false);
            }
            st.reading = false;
            if let Some(decoder) = st.decoder.as_mut() {
                let tail = decoder.end();
                if !tail.is_empty() {
                    st.buffer.enqueue(Chunk::Text(tail))?;
                }
            }
            st.buffer.terminate();
            st.sync
        };
        log::debug!("readable: end of stream pushed");
        if sync {
            self.emit_readable();
        } else {
            let emit = {
                let mut st = self.inner.state.borrow_mut();
                st.need_readable = false;
                !std::mem::replace(&mut st.emitted_readable, true)
            };
            if emit {
                self.emit_readable_now();
            }
        }
        Ok(false)
    }

    /// Put a chunk back at the head of the buffer
    ///
    /// # Errors
    /// Fails after `end` was emitted.
    pub fn unshift(&self, chunk: impl Into<Chunk>) -> Result<()> {
        self.add(chunk.into(), true).map(|_| ())
    }

    fn add(&self, chunk: Chunk, front: bool) -> Result<bool> {
        let chunk = match self.normalize(chunk) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };

        let admit = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return Ok(false);
            }
            if chunk.is_empty() && !self.inner.object_mode {
                if front {
                    Admit::Ignore
                } else {
                    st.reading = false;
                    Admit::ReadMore
                }
            } else if front {
                if st.end_emitted {
                    Admit::Reject(ProtocolViolation::UnshiftAfterEnd)
                } else {
                    let chunk = match (&st.decoder, chunk) {
                        (Some(decoder), Chunk::Bytes(bytes)) => {
                            Chunk::Text(decoder.encoding().decode(&bytes))
                        }
                        (_, chunk) => chunk,
                    };
                    Admit::Add(chunk)
                }
            } else if st.ended() {
                Admit::Reject(ProtocolViolation::PushAfterEnd)
            } else {
                st.reading = false;
                match (st.decoder.as_mut(), chunk) {
                    (Some(decoder), Chunk::Bytes(bytes)) => {
                        let text = decoder.write(&bytes);
                        if text.is_empty() {
                            Admit::ReadMore
                        } else {
                            Admit::Add(Chunk::Text(text))
                        }
                    }
                    (_, chunk) => Admit::Add(chunk),
                }
            }
        };

        let added = match admit {
            Admit::Add(chunk) => self.add_chunk(chunk, front),
            Admit::ReadMore => {
                self.maybe_read_more();
                Ok(())
            }
            Admit::Ignore => Ok(()),
            Admit::Reject(violation) => Err(StreamError::from(violation)),
        };
        if let Err(e) = added {
            log::warn!("readable: {e}");
            self.fail(e.clone());
            return Err(e);
        }

        let st = self.inner.state.borrow();
        Ok(!st.ended() && st.buffer.size() < st.high_water_mark)
    }

    /// Byte mode stores bytes; text is converted as utf8
    fn normalize(&self, chunk: Chunk) -> Result<Chunk> {
        if self.inner.object_mode {
            return Ok(chunk);
        }
        match chunk {
            Chunk::Text(text) => Ok(Chunk::Bytes(text.into_bytes())),
            bytes @ Chunk::Bytes(_) => Ok(bytes),
            Chunk::Object(_) => Err(StreamError::InvalidChunk(
                "objects can only be pushed in object mode".to_string(),
            )),
        }
    }

    fn add_chunk(&self, chunk: Chunk, front: bool) -> Result<()> {
        let direct = {
            let st = self.inner.state.borrow();
            !front
                && st.flowing == Some(true)
                && st.buffer.is_empty()
                && !st.sync
                && !st.delivering
                && self.inner.registry.count(EventKind::Data) > 0
        };

        if direct {
            self.deliver(chunk);
            self.read(Some(0));
        } else {
            let need_readable = {
                let mut st = self.inner.state.borrow_mut();
                if front {
                    st.buffer.push_front(chunk);
                } else {
                    st.buffer.enqueue(chunk)?;
                }
                st.need_readable
            };
            if need_readable {
                self.emit_readable();
            }
        }
        self.maybe_read_more();
        Ok(())
    }

    //
    // Consumer side
    //

    /// Pull data from the buffer
    ///
    /// Without a hint, a flowing stream returns the first buffered chunk and
    /// a paused one returns everything buffered. In byte mode `Some(n)`
    /// returns exactly `n` bytes, or `None` until that much is buffered (the
    /// remainder once the stream has ended). Object mode returns one chunk.
    /// `Some(0)` only asks the producer for more data.
    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        let early = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return None;
            }
            if let Some(n) = n {
                if n > st.high_water_mark {
                    st.high_water_mark = compute_high_water_mark(n);
                }
            }
            if n != Some(0) {
                st.emitted_readable = false;
            }
            if n == Some(0)
                && st.need_readable
                && (st.buffer.size() >= st.high_water_mark || st.ended())
            {
                Some(st.buffer.is_empty() && st.ended())
            } else {
                None
            }
        };
        match early {
            Some(true) => {
                self.end_readable();
                return None;
            }
            Some(false) => {
                self.emit_readable();
                return None;
            }
            None => {}
        }

        let (mut amount, do_read) = {
            let mut st = self.inner.state.borrow_mut();
            let amount = st.how_much_to_read(n);
            if amount == 0 && st.ended() {
                let end = st.buffer.is_empty();
                drop(st);
                if end {
                    self.end_readable();
                }
                return None;
            }

            let size = st.buffer.size();
            let mut do_read = st.need_readable;
            if size == 0 || size.saturating_sub(amount) < st.high_water_mark {
                do_read = true;
            }
            if st.ended() || st.reading {
                do_read = false;
            }
            if do_read {
                st.reading = self.inner.has_fill;
                st.sync = true;
                if size == 0 {
                    st.need_readable = true;
                }
            }
            (amount, do_read)
        };

        if do_read {
            self.call_fill();
            let mut st = self.inner.state.borrow_mut();
            st.sync = false;
            if !st.reading {
                amount = st.how_much_to_read(n);
            }
        }

        let (chunk, end) = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return None;
            }
            let chunk = if amount > 0 {
                st.buffer.dequeue(Some(amount))
            } else {
                None
            };
            if chunk.is_none() {
                st.need_readable = true;
            }
            let mut end = false;
            if st.buffer.is_empty() {
                if !st.ended() {
                    st.need_readable = true;
                }
                let taken = chunk.as_ref().map_or(0, Chunk::len);
                end = st.ended() && n != Some(taken);
            }
            (chunk, end)
        };

        if end {
            self.end_readable();
        }
        if let Some(chunk) = &chunk {
            self.deliver(chunk.clone());
        }
        chunk
    }

    /// Stop flowing; data stays buffered until `resume` or `read`
    pub fn pause(&self) {
        let mut st = self.inner.state.borrow_mut();
        st.detached_pause = false;
        if st.flowing != Some(false) {
            log::debug!("readable: pause");
            st.flowing = Some(false);
        }
    }

    /// Switch to flowing mode (unless `readable` listeners hold it paused)
    pub fn resume(&self) {
        let schedule = {
            let mut st = self.inner.state.borrow_mut();
            st.detached_pause = false;
            if st.destroyed || st.flowing == Some(true) {
                return;
            }
            log::debug!("readable: resume");
            st.flowing = Some(!st.readable_listening);
            !std::mem::replace(&mut st.resume_scheduled, true)
        };
        if schedule {
            let weak = self.downgrade();
            self.inner.event_loop.defer(move || {
                if let Some(readable) = weak.upgrade() {
                    readable.resume_now();
                }
            });
        }
    }

    fn resume_now(&self) {
        if !self.inner.state.borrow().reading {
            self.read(Some(0));
        }
        self.inner.state.borrow_mut().resume_scheduled = false;
        self.flow();
        let again = {
            let st = self.inner.state.borrow();
            st.flowing == Some(true) && !st.reading
        };
        if again {
            self.read(Some(0));
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.state.borrow().flowing == Some(false)
    }

    /// Decode buffered and future byte chunks as text; ignored in object mode
    pub fn set_encoding(&self, encoding: Encoding) {
        if self.inner.object_mode {
            log::debug!("readable: set_encoding({encoding}) ignored in object mode");
            return;
        }
        let mut st = self.inner.state.borrow_mut();
        let mut decoder = TextDecoder::new(encoding);
        let mut text = String::new();
        for chunk in st.buffer.clear() {
            match chunk {
                Chunk::Bytes(bytes) => text.push_str(&decoder.write(&bytes)),
                Chunk::Text(s) => text.push_str(&s),
                Chunk::Object(value) => text.push_str(&value.to_string()),
            }
        }
        if !text.is_empty() {
            st.buffer.push_front(Chunk::Text(text));
        }
        st.decoder = Some(decoder);
    }

    /// Release buffered data and terminate the stream
    ///
    /// `error` (if any) is emitted, then `close`, on a later turn.
    pub fn destroy(&self, error: Option<StreamError>) {
        let released = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.error = error.clone();
            st.buffer.clear()
        };
        drop(released);
        let hook = self.inner.fill.borrow_mut().take();
        drop(hook);
        match &error {
            Some(e) => log::debug!("readable: destroyed with error: {e}"),
            None => log::debug!("readable: destroyed"),
        }

        let weak = self.downgrade();
        self.inner.event_loop.defer(move || {
            if let Some(readable) = weak.upgrade() {
                if let Some(e) = error {
                    readable.emit(&Event::Error(e));
                }
                readable.emit_close();
            }
        });
    }

    pub(crate) fn fail(&self, error: StreamError) {
        self.destroy(Some(error));
    }

    //
    // Introspection
    //

    #[must_use]
    pub fn mode(&self) -> ReadableMode {
        mode_of(&self.inner.state.borrow())
    }

    /// Size of the buffered data (bytes, or chunks in object mode)
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner.state.borrow().buffer.size()
    }

    /// `end` was emitted
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.state.borrow().end_emitted
    }

    /// The end-of-stream sentinel was pushed (data may still be buffered)
    #[must_use]
    pub fn received_end(&self) -> bool {
        self.inner.state.borrow().ended()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    /// Error the stream was terminated with
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.inner.state.borrow().error.clone()
    }

    #[must_use]
    pub fn object_mode(&self) -> bool {
        self.inner.object_mode
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().high_water_mark
    }

    #[must_use]
    pub fn encoding(&self) -> Option<Encoding> {
        self.inner
            .state
            .borrow()
            .decoder
            .as_ref()
            .map(TextDecoder::encoding)
    }

    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.registry.count(kind)
    }

    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    //
    // Engine internals
    //

    pub(crate) fn downgrade(&self) -> WeakReadable {
        WeakReadable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn pipes(&self) -> &RefCell<Vec<PipeLink>> {
        &self.inner.pipes
    }

    pub(crate) fn emit(&self, event: &Event) -> bool {
        self.inner.registry.emit(event)
    }

    /// Register under an id allocated by a facade spanning several streams
    pub(crate) fn listen_as(&self, id: ListenerId, kind: EventKind, once: bool, callback: Callback) {
        self.inner.registry.add(id, kind, once, callback);
    }

    /// The consumer wants more data than is buffered
    pub(crate) fn wants_data(&self) -> bool {
        let st = self.inner.state.borrow();
        st.need_readable || st.buffer.size() < st.high_water_mark
    }

    /// Mark the outstanding fill request as answered
    pub(crate) fn clear_reading(&self) {
        self.inner.state.borrow_mut().reading = false;
    }

    /// Readable half of a transform: the first push must signal `readable`
    pub(crate) fn prime(&self) {
        let mut st = self.inner.state.borrow_mut();
        st.need_readable = true;
        st.sync = false;
    }

    fn is_flowing(&self) -> bool {
        self.inner.state.borrow().flowing == Some(true)
    }

    fn call_fill(&self) {
        let hook = self.inner.fill.borrow_mut().take();
        let Some(mut hook) = hook else {
            return;
        };
        let high_water_mark = self.inner.state.borrow().high_water_mark;
        let result = hook(self, high_water_mark);
        if !self.is_destroyed() {
            let mut slot = self.inner.fill.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
        if let Err(e) = result {
            log::debug!("readable: fill hook failed: {e}");
            self.fail(e);
        }
    }

    /// Emit `data`; chunks pushed by listeners meanwhile stay buffered and
    /// are flowed afterwards
    fn deliver(&self, chunk: Chunk) {
        let outer = std::mem::replace(&mut self.inner.state.borrow_mut().delivering, true);
        self.emit(&Event::Data(chunk));
        self.inner.state.borrow_mut().delivering = outer;
        if !outer {
            let pending = {
                let st = self.inner.state.borrow();
                st.flowing == Some(true) && !st.buffer.is_empty()
            };
            if pending {
                self.flow();
            }
        }
    }

    fn flow(&self) {
        if std::mem::replace(&mut self.inner.state.borrow_mut().delivering, true) {
            return;
        }
        while self.is_flowing() && self.read(None).is_some() {}
        self.inner.state.borrow_mut().delivering = false;
    }

    fn emit_readable(&self) {
        let defer = {
            let mut st = self.inner.state.borrow_mut();
            st.need_readable = false;
            if st.emitted_readable {
                return;
            }
            st.emitted_readable = true;
            st.sync
        };
        if defer {
            let weak = self.downgrade();
            self.inner.event_loop.defer(move || {
                if let Some(readable) = weak.upgrade() {
                    readable.emit_readable_now();
                }
            });
        } else {
            self.emit_readable_now();
        }
    }

    fn emit_readable_now(&self) {
        let emit = {
            let st = self.inner.state.borrow();
            !st.destroyed && (!st.buffer.is_empty() || st.ended())
        };
        if emit {
            self.emit(&Event::Readable);
            self.inner.state.borrow_mut().emitted_readable = false;
        }
        {
            let mut st = self.inner.state.borrow_mut();
            st.need_readable = st.flowing != Some(true)
                && !st.ended()
                && st.buffer.size() <= st.high_water_mark;
        }
        self.flow();
    }

    fn maybe_read_more(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.read_more_scheduled || st.destroyed {
                return;
            }
            st.read_more_scheduled = true;
        }
        let weak = self.downgrade();
        self.inner.event_loop.defer(move || {
            if let Some(readable) = weak.upgrade() {
                readable.read_more_now();
            }
        });
    }

    fn read_more_now(&self) {
        loop {
            let before = {
                let st = self.inner.state.borrow();
                let size = st.buffer.size();
                let wanted = size < st.high_water_mark || (st.flowing == Some(true) && size == 0);
                if st.reading || st.ended() || st.destroyed || !wanted {
                    break;
                }
                size
            };
            self.read(Some(0));
            if self.inner.state.borrow().buffer.size() == before {
                break;
            }
        }
        self.inner.state.borrow_mut().read_more_scheduled = false;
    }

    fn end_readable(&self) {
        let weak = self.downgrade();
        self.inner.event_loop.defer(move || {
            if let Some(readable) = weak.upgrade() {
                readable.end_readable_now();
            }
        });
    }

    fn end_readable_now(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.end_emitted || st.destroyed || !st.buffer.is_empty() {
                return;
            }
            st.end_emitted = true;
        }
        log::debug!("readable: end");
        self.emit(&Event::End);
        self.emit_close();
    }

    fn emit_close(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.close_emitted {
                return;
            }
            st.close_emitted = true;
        }
        self.emit(&Event::Close);
    }

    fn on_readable_listener(&self) {
        let next = {
            let mut st = self.inner.state.borrow_mut();
            if st.end_emitted || st.readable_listening {
                return;
            }
            st.readable_listening = true;
            st.need_readable = true;
            st.flowing = Some(false);
            st.emitted_readable = false;
            if !st.buffer.is_empty() {
                Some(true)
            } else if !st.reading {
                Some(false)
            } else {
                None
            }
        };
        match next {
            Some(true) => self.emit_readable(),
            Some(false) => {
                let weak = self.downgrade();
                self.inner.event_loop.defer(move || {
                    if let Some(readable) = weak.upgrade() {
                        readable.read(Some(0));
                    }
                });
            }
            None => {}
        }
    }
}

impl Observable for Readable {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        let id = attach(&self.inner.registry, kind, once, callback);
        match kind {
            EventKind::Data => {
                let resume = {
                    let st = self.inner.state.borrow();
                    st.flowing != Some(false) || st.detached_pause
                };
                if resume {
                    self.resume();
                }
            }
            EventKind::Readable => self.on_readable_listener(),
            _ => {}
        }
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.inner.registry.remove(id) {
            Some(EventKind::Data) => {
                if self.inner.registry.count(EventKind::Data) == 0 && self.is_flowing() {
                    let mut st = self.inner.state.borrow_mut();
                    st.flowing = Some(false);
                    st.detached_pause = true;
                }
                true
            }
            Some(EventKind::Readable) => {
                if self.inner.registry.count(EventKind::Readable) == 0 {
                    self.inner.state.borrow_mut().readable_listening = false;
                    if self.inner.registry.count(EventKind::Data) > 0 {
                        self.resume();
                    }
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        write!(
            f,
            "Readable(mode={:?}, buffered={}, ended={}, destroyed={})",
            mode_of(&st),
            st.buffer.size(),
            st.ended(),
            st.destroyed
        )
    }
}

fn mode_of(st: &State) -> ReadableMode {
    if st.end_emitted {
        return ReadableMode::Ended;
    }
    match st.flowing {
        None => ReadableMode::Initial,
        Some(true) => ReadableMode::Flowing,
        Some(false) => ReadableMode::Paused,
    }
}
