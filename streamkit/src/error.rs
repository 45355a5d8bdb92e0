//! Error taxonomy for the stream engine
//!
//! Every fault is surfaced once: the failing operation returns it and the
//! stream emits it as an `error` notification before entering its terminal
//! state. Errors are `Clone` because one fault may reach several listeners.

/// Misuse of the engine's push/write/acknowledge protocol
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("push() after the end-of-stream sentinel")]
    PushAfterEnd,

    #[error("unshift() after the end event")]
    UnshiftAfterEnd,

    #[error("write() after end()")]
    WriteAfterEnd,

    #[error("acknowledgement does not match the chunk in flight")]
    DoubleAck,

    #[error("{hook} dropped its acknowledgement without completing it")]
    AckDropped { hook: &'static str },

    #[error("source added to a sealed merge")]
    AddAfterSeal,
}

/// Error type for all stream operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The fill hook of a Readable failed
    #[error("producer error: {0}")]
    Producer(String),

    /// A write, transform, flush or final hook failed
    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("stream destroyed")]
    Destroyed,
}

impl StreamError {
    #[must_use]
    pub fn producer(message: impl Into<String>) -> Self {
        Self::Producer(message.into())
    }

    #[must_use]
    pub fn consumer(message: impl Into<String>) -> Self {
        Self::Consumer(message.into())
    }

    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
