//! Writable engine
//!
//! Chunks are handed to the write hook one at a time; the next chunk is only
//! released after the hook completes the `Ack` it was given. `write` returns
//! false once the unacknowledged data reaches the high-water mark, and
//! `drain` fires when it is all acknowledged again.
//!
//! After `end`, the engine waits for the last acknowledgement, emits
//! `prefinish`, runs the final hook (if any) on a later turn and emits
//! `finish` once it completes, then `close`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Deserialize;

use crate::ack::Ack;
use crate::chunk::Chunk;
use crate::encoding::Encoding;
use crate::error::{ProtocolViolation, Result, StreamError};
use crate::idgen::ListenerId;
use crate::notification::{attach, Callback, Event, EventKind, Observable, Registry};
use crate::queue::{Queue, Weighted};
use crate::readable::{DEFAULT_HIGH_WATER_MARK, DEFAULT_OBJECT_HIGH_WATER_MARK};
use crate::scheduler::EventLoop;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WritableOptions {
    pub object_mode: bool,
    pub high_water_mark: Option<usize>,
    /// Convert text to bytes before the write hook sees it (byte mode only)
    pub decode_strings: bool,
    /// Encoding of text written without an explicit one
    pub default_encoding: Encoding,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            object_mode: false,
            high_water_mark: None,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
        }
    }
}

impl WritableOptions {
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
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(if self.object_mode {
            DEFAULT_OBJECT_HIGH_WATER_MARK
        } else {
            DEFAULT_HIGH_WATER_MARK
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableMode {
    Initial,
    Writing,
    /// `end` was called; acknowledgements may still be pending
    Ended,
    Finished,
}

type WriteHook = Box<dyn FnMut(&Writable, Chunk, Option<Encoding>, Ack)>;
type FinalHook = Box<dyn FnMut(&Writable, Ack)>;
type WriteCallback = Box<dyn FnOnce(Result<()>)>;

struct WriteRequest {
    chunk: Chunk,
    encoding: Option<Encoding>,
    callback: Option<WriteCallback>,
}

impl Weighted for WriteRequest {
    fn weight(&self, object_mode: bool) -> usize {
        self.chunk.weight(object_mode)
    }
}

struct InFlight {
    seq: u64,
    len: usize,
    callback: Option<WriteCallback>,
}

struct State {
    buffer: Queue<WriteRequest>,
    high_water_mark: usize,
    /// Weight of everything written but not yet acknowledged
    length: usize,
    in_flight: Option<InFlight>,
    next_seq: u64,
    pending_callbacks: usize,
    sync: bool,
    buffer_processing: bool,
    corked: usize,
    need_drain: bool,
    started: bool,
    prefinished: bool,
    finished: bool,
    destroyed: bool,
    close_emitted: bool,
    error: Option<StreamError>,
}

impl State {
    fn ending(&self) -> bool {
        self.buffer.is_terminated()
    }

    fn need_finish(&self) -> bool {
        self.ending()
            && self.length == 0
            && self.buffer.is_empty()
            && self.in_flight.is_none()
            && !self.finished
            && !self.destroyed
    }
}

struct Inner {
    event_loop: EventLoop,
    registry: Registry,
    options: WritableOptions,
    has_final: bool,
    state: RefCell<State>,
    write: RefCell<Option<WriteHook>>,
    finalize: RefCell<Option<FinalHook>>,
}

/// Handle to a writable stream; clones share the same stream
#[derive(Clone)]
pub struct Writable {
    inner: Rc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakWritable {
    inner: Weak<Inner>,
}

impl WeakWritable {
    pub(crate) fn upgrade(&self) -> Option<Writable> {
        self.inner.upgrade().map(|inner| Writable { inner })
    }
}

impl Writable {
    pub fn new(
        event_loop: &EventLoop,
        options: WritableOptions,
        write: impl FnMut(&Writable, Chunk, Option<Encoding>, Ack) + 'static,
    ) -> Self {
        Self::build(event_loop, options, Box::new(write), None)
    }

    /// Writable with a final hook, run once after the last acknowledgement
    pub fn with_final(
        event_loop: &EventLoop,
        options: WritableOptions,
        write: impl FnMut(&Writable, Chunk, Option<Encoding>, Ack) + 'static,
        finalize: impl FnMut(&Writable, Ack) + 'static,
    ) -> Self {
        Self::build(
            event_loop,
            options,
            Box::new(write),
            Some(Box::new(finalize)),
        )
    }

    fn build(
        event_loop: &EventLoop,
        options: WritableOptions,
        write: WriteHook,
        finalize: Option<FinalHook>,
    ) -> Self {
        let state = State {
            buffer: Queue::new(options.object_mode),
            high_water_mark: options.effective_high_water_mark(),
            length: 0,
            in_flight: None,
            next_seq: 0,
            pending_callbacks: 0,
            sync: false,
            buffer_processing: false,
            corked: 0,
            need_drain: false,
            started: false,
            prefinished: false,
            finished: false,
            destroyed: false,
            close_emitted: false,
            error: None,
        };
        Self {
            inner: Rc::new(Inner {
                event_loop: event_loop.clone(),
                registry: Registry::new(),
                has_final: finalize.is_some(),
                options,
                state: RefCell::new(state),
                write: RefCell::new(Some(write)),
                finalize: RefCell::new(finalize),
            }),
        }
    }

    /// Submit a chunk
    ///
    /// Returns `Ok(false)` once the caller should wait for `drain`.
    ///
    /// # Errors
    /// Writing after `end` is a protocol violation and fails the stream.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.submit(chunk.into(), None, None)
    }

    /// Submit text expressed in `encoding`
    ///
    /// # Errors
    /// As `write`, plus `StreamError::Encoding` for malformed text.
    pub fn write_encoded(&self, text: &str, encoding: Encoding) -> Result<bool> {
        self.submit(Chunk::Text(text.to_string()), Some(encoding), None)
    }

    /// Submit a chunk; `callback` runs once it is acknowledged (or rejected)
    ///
    /// # Errors
    /// As `write`; the callback also receives the error.
    pub fn write_with_callback(
        &self,
        chunk: impl Into<Chunk>,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Result<bool> {
        self.submit(chunk.into(), None, Some(Box::new(callback)))
    }

    fn submit(
        &self,
        chunk: Chunk,
        encoding: Option<Encoding>,
        callback: Option<WriteCallback>,
    ) -> Result<bool> {
        let rejected = {
            let st = self.inner.state.borrow();
            if st.destroyed {
                Some(StreamError::Destroyed)
            } else if st.ending() {
                Some(ProtocolViolation::WriteAfterEnd.into())
            } else {
                None
            }
        };
        let prepared = match rejected {
            Some(e) => Err(e),
            None => self.prepare(chunk, encoding),
        };
        let (chunk, encoding) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                log::warn!("writable: rejected write: {e}");
                if e != StreamError::Destroyed {
                    self.fail(e.clone());
                }
                if let Some(callback) = callback {
                    let err = e.clone();
                    self.inner.event_loop.defer(move || callback(Err(err)));
                }
                return Err(e);
            }
        };

        let below = {
            let mut st = self.inner.state.borrow_mut();
            let request = WriteRequest {
                chunk,
                encoding,
                callback,
            };
            let weight = request.weight(self.inner.options.object_mode);
            st.buffer
                .enqueue(request)
                .map_err(|_| ProtocolViolation::WriteAfterEnd)?;
            st.length += weight;
            st.pending_callbacks += 1;
            st.started = true;
            let below = st.length < st.high_water_mark;
            if !below {
                st.need_drain = true;
            }
            below
        };
        self.clear_buffer();
        Ok(below)
    }

    fn prepare(&self, chunk: Chunk, encoding: Option<Encoding>) -> Result<(Chunk, Option<Encoding>)> {
        let options = &self.inner.options;
        match chunk {
            Chunk::Text(text) => {
                let encoding = encoding.unwrap_or(options.default_encoding);
                if options.decode_strings && !options.object_mode {
                    Ok((Chunk::Bytes(encoding.encode(&text)?), None))
                } else {
                    Ok((Chunk::Text(text), Some(encoding)))
                }
            }
            Chunk::Object(_) if !options.object_mode => Err(StreamError::InvalidChunk(
                "objects can only be written in object mode".to_string(),
            )),
            other => Ok((other, None)),
        }
    }

    /// Release buffered requests to the write hook, one at a time
    fn clear_buffer(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.buffer_processing {
                return;
            }
            st.buffer_processing = true;
        }
        loop {
            let next = {
                let mut st = self.inner.state.borrow_mut();
                if st.in_flight.is_some() || st.corked > 0 || st.destroyed {
                    None
                } else {
                    st.buffer.pop_front()
                }
            };
            let Some(request) = next else {
                break;
            };
            self.do_write(request);
        }
        self.inner.state.borrow_mut().buffer_processing = false;
    }

    fn do_write(&self, request: WriteRequest) {
        let seq = {
            let mut st = self.inner.state.borrow_mut();
            let seq = st.next_seq;
            st.next_seq += 1;
            st.in_flight = Some(InFlight {
                seq,
                len: request.weight(self.inner.options.object_mode),
                callback: request.callback,
            });
            st.sync = true;
            seq
        };

        let weak = self.downgrade();
        let ack = Ack::new("write hook", move |result| {
            if let Some(writable) = weak.upgrade() {
                writable.on_write(seq, result);
            }
        });

        let hook = self.inner.write.borrow_mut().take();
        match hook {
            Some(mut hook) => {
                hook(self, request.chunk, request.encoding, ack);
                if !self.is_destroyed() {
                    let mut slot = self.inner.write.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(hook);
                    }
                }
            }
            None => ack.err(StreamError::Destroyed),
        }
        self.inner.state.borrow_mut().sync = false;
    }

    fn on_write(&self, seq: u64, result: Result<()>) {
        let (sync, callback) = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            match st.in_flight.take() {
                Some(flight) if flight.seq == seq => {
                    st.length = st.length.saturating_sub(flight.len);
                    (st.sync, flight.callback)
                }
                other => {
                    st.in_flight = other;
                    drop(st);
                    self.fail(ProtocolViolation::DoubleAck.into());
                    return;
                }
            }
        };

        match result {
            Err(e) => {
                log::debug!("writable: write hook failed: {e}");
                {
                    let mut st = self.inner.state.borrow_mut();
                    st.pending_callbacks = st.pending_callbacks.saturating_sub(1);
                }
                if let Some(callback) = callback {
                    let err = e.clone();
                    self.inner.event_loop.defer(move || callback(Err(err)));
                }
                self.fail(e);
            }
            Ok(()) => {
                let more = {
                    let st = self.inner.state.borrow();
                    st.corked == 0 && !st.buffer_processing && !st.buffer.is_empty()
                };
                if more {
                    self.clear_buffer();
                }
                if sync {
                    let weak = self.downgrade();
                    self.inner.event_loop.defer(move || {
                        if let Some(writable) = weak.upgrade() {
                            writable.after_write(callback);
                        }
                    });
                } else {
                    self.after_write(callback);
                }
            }
        }
    }

    fn after_write(&self, callback: Option<WriteCallback>) {
        let drain = {
            let mut st = self.inner.state.borrow_mut();
            st.pending_callbacks = st.pending_callbacks.saturating_sub(1);
            let drain = !st.destroyed && !st.ending() && st.length == 0 && st.need_drain;
            if drain {
                st.need_drain = false;
            }
            drain
        };
        if drain {
            self.emit(&Event::Drain);
        }
        if let Some(callback) = callback {
            callback(Ok(()));
        }
        self.finish_maybe(false);
    }

    /// No more writes; `finish` follows once everything is acknowledged
    ///
    /// # Errors
    /// Fails if the stream was destroyed.
    pub fn end(&self) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return Err(StreamError::Destroyed);
            }
            if st.ending() {
                return Ok(());
            }
            st.corked = 0;
            st.buffer.terminate();
        }
        log::debug!("writable: end");
        self.clear_buffer();
        self.finish_maybe(true);
        Ok(())
    }

    /// Write one last chunk, then `end`
    ///
    /// # Errors
    /// As `write`.
    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<()> {
        self.write(chunk)?;
        self.end()
    }

    /// Hold writes in the queue until a matching `uncork`
    pub fn cork(&self) {
        self.inner.state.borrow_mut().corked += 1;
    }

    pub fn uncork(&self) {
        let release = {
            let mut st = self.inner.state.borrow_mut();
            st.corked = st.corked.saturating_sub(1);
            st.corked == 0 && !st.buffer.is_empty()
        };
        if release {
            self.clear_buffer();
        }
    }

    fn finish_maybe(&self, sync: bool) {
        if !self.inner.state.borrow().need_finish() {
            return;
        }
        self.prefinish();
        let ready = {
            let st = self.inner.state.borrow();
            st.need_finish() && st.pending_callbacks == 0
        };
        if !ready {
            return;
        }
        if sync {
            let weak = self.downgrade();
            self.inner.event_loop.defer(move || {
                if let Some(writable) = weak.upgrade() {
                    writable.finish_now();
                }
            });
        } else {
            self.finish_now();
        }
    }

    fn prefinish(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.prefinished {
                return;
            }
            st.prefinished = true;
            if self.inner.has_final {
                st.pending_callbacks += 1;
            }
        }
        self.emit(&Event::Prefinish);
        if self.inner.has_final {
            let weak = self.downgrade();
            self.inner.event_loop.defer(move || {
                if let Some(writable) = weak.upgrade() {
                    writable.call_final();
                }
            });
        }
    }

    fn call_final(&self) {
        if self.is_destroyed() {
            return;
        }
        let weak = self.downgrade();
        let ack = Ack::new("final hook", move |result| {
            if let Some(writable) = weak.upgrade() {
                writable.after_final(result);
            }
        });
        let hook = self.inner.finalize.borrow_mut().take();
        match hook {
            Some(mut hook) => hook(self, ack),
            None => ack.ok(),
        }
    }

    fn after_final(&self, result: Result<()>) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            st.pending_callbacks = st.pending_callbacks.saturating_sub(1);
        }
        match result {
            Ok(()) => self.finish_maybe(false),
            Err(e) => {
                log::debug!("writable: final hook failed: {e}");
                self.fail(e);
            }
        }
    }

    fn finish_now(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.finished || !st.need_finish() || st.pending_callbacks > 0 {
                return;
            }
            st.finished = true;
        }
        log::debug!("writable: finish");
        self.emit(&Event::Finish);
        self.emit_close();
    }

    /// Terminate the stream, rejecting everything not yet acknowledged
    ///
    /// Callbacks of pending writes receive `StreamError::Destroyed`; `error`
    /// (if any) and `close` are emitted on a later turn.
    pub fn destroy(&self, error: Option<StreamError>) {
        let callbacks: Vec<WriteCallback> = {
            let mut st = self.inner.state.borrow_mut();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.error = error.clone();
            st.length = 0;
            let in_flight = st.in_flight.take().and_then(|flight| flight.callback);
            in_flight
                .into_iter()
                .chain(st.buffer.clear().into_iter().filter_map(|r| r.callback))
                .collect()
        };
        let hooks = (
            self.inner.write.borrow_mut().take(),
            self.inner.finalize.borrow_mut().take(),
        );
        drop(hooks);
        match &error {
            Some(e) => log::debug!("writable: destroyed with error: {e}"),
            None => log::debug!("writable: destroyed"),
        }

        let weak = self.downgrade();
        self.inner.event_loop.defer(move || {
            for callback in callbacks {
                callback(Err(StreamError::Destroyed));
            }
            if let Some(writable) = weak.upgrade() {
                if let Some(e) = error {
                    writable.emit(&Event::Error(e));
                }
                writable.emit_close();
            }
        });
    }

    pub(crate) fn fail(&self, error: StreamError) {
        self.destroy(Some(error));
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

    pub(crate) fn emit(&self, event: &Event) -> bool {
        self.inner.registry.emit(event)
    }

    /// Register under an id allocated by a facade spanning several streams
    pub(crate) fn listen_as(&self, id: ListenerId, kind: EventKind, once: bool, callback: Callback) {
        self.inner.registry.add(id, kind, once, callback);
    }

    pub(crate) fn downgrade(&self) -> WeakWritable {
        WeakWritable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn mode(&self) -> WritableMode {
        let st = self.inner.state.borrow();
        if st.finished {
            WritableMode::Finished
        } else if st.ending() {
            WritableMode::Ended
        } else if st.started {
            WritableMode::Writing
        } else {
            WritableMode::Initial
        }
    }

    /// Weight of written but unacknowledged data
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner.state.borrow().length
    }

    /// Number of writes not yet acknowledged (in flight plus queued)
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        let st = self.inner.state.borrow();
        st.buffer.len() + usize::from(st.in_flight.is_some())
    }

    #[must_use]
    pub fn needs_drain(&self) -> bool {
        self.inner.state.borrow().need_drain
    }

    #[must_use]
    pub fn is_corked(&self) -> bool {
        self.inner.state.borrow().corked > 0
    }

    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.inner.state.borrow().ending()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.borrow().finished
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.inner.state.borrow().error.clone()
    }

    #[must_use]
    pub fn object_mode(&self) -> bool {
        self.inner.options.object_mode
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().high_water_mark
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
}

impl Observable for Writable {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        attach(&self.inner.registry, kind, once, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.registry.remove(id).is_some()
    }
}

impl fmt::Debug for Writable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Writable(mode={:?}, pending={}, buffered={})",
            self.mode(),
            self.pending_acks(),
            self.buffered_len()
        )
    }
}
