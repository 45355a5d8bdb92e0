//! Cooperative push/pull streams
//!
//! A single-threaded stream engine: readables with flowing and paused
//! consumption, writables with acknowledged writes, duplex and transform
//! stages, pipes with backpressure, a fan-in merge and a mutable pipeline of
//! labeled stages. Everything runs on an explicit `EventLoop`.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use streamkit::{EventLoop, Observable, Readable, ReadableOptions};
//!
//! let event_loop = EventLoop::new();
//! let source = Readable::new(&event_loop, ReadableOptions::default());
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let s = seen.clone();
//! source.on_data(move |chunk| s.borrow_mut().push(chunk.to_text_lossy()));
//!
//! source.push("one").unwrap();
//! source.push("two").unwrap();
//! source.push_end().unwrap();
//! event_loop.run_until_idle();
//! assert_eq!(*seen.borrow(), vec!["one", "two"]);
//! ```

pub mod ack;
pub mod bridge;
pub mod chunk;
pub mod duplex;
pub mod encoding;
pub mod error;
pub mod idgen;
pub mod merge;
pub mod notification;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod scheduler;
pub mod splicer;
pub mod transform;
pub mod writable;

pub use ack::Ack;
pub use bridge::{Chunks, Completion};
pub use chunk::Chunk;
pub use duplex::{Duplex, DuplexOptions};
pub use encoding::{Encoding, TextDecoder};
pub use error::{ProtocolViolation, Result, StreamError};
pub use idgen::ListenerId;
pub use merge::{merge_readables, Merge};
pub use notification::{Callback, Event, EventKind, Observable, Registry};
pub use pipe::{pipe, unpipe, PipeOptions, ReadableSide, Stage, WritableSide};
pub use queue::Queue;
pub use readable::{
    Readable, ReadableMode, ReadableOptions, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_OBJECT_HIGH_WATER_MARK,
};
pub use scheduler::EventLoop;
pub use splicer::{Pipeline, StageRef};
pub use transform::{Transform, TransformOptions};
pub use writable::{Writable, WritableMode, WritableOptions};
