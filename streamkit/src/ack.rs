//! Acknowledgement token handed to consumer hooks
//!
//! An `Ack` completes exactly once: `ok`, `err` and `done` consume it, so a
//! second acknowledgement does not compile. Dropping a token without
//! completing it reports `ProtocolViolation::AckDropped` through the same
//! completion path instead of stalling the stream.

use std::fmt;

use crate::error::{ProtocolViolation, Result, StreamError};

type Completion = Box<dyn FnOnce(Result<()>)>;

#[must_use = "an Ack must be completed with ok(), err() or done()"]
pub struct Ack {
    complete: Option<Completion>,
    hook: &'static str,
}

impl Ack {
    pub(crate) fn new(hook: &'static str, complete: impl FnOnce(Result<()>) + 'static) -> Self {
        Self {
            complete: Some(Box::new(complete)),
            hook,
        }
    }

    /// The chunk (or finalization) was processed
    pub fn ok(self) {
        self.done(Ok(()));
    }

    /// Processing failed; the owning stream is terminated with `error`
    pub fn err(self, error: StreamError) {
        self.done(Err(error));
    }

    pub fn done(mut self, result: Result<()>) {
        if let Some(complete) = self.complete.take() {
            complete(result);
        }
    }

    /// Name of the hook this token was issued to
    #[must_use]
    pub fn hook(&self) -> &'static str {
        self.hook
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            log::warn!("{} dropped its acknowledgement", self.hook);
            complete(Err(ProtocolViolation::AckDropped { hook: self.hook }.into()));
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ack(hook={}, pending={})",
            self.hook,
            self.complete.is_some()
        )
    }
}
