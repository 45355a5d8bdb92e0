//! Cooperative event loop
//!
//! All suspension in the engine is a deferred callback: `defer` queues a task
//! that runs after the current synchronous work, in FIFO order. Nothing runs
//! until the owner drives the loop with `run_until_idle` (or an async adapter
//! from `crate::bridge` does it on poll).
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use streamkit::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! let l = log.clone();
//! event_loop.defer(move || l.borrow_mut().push("deferred"));
//! log.borrow_mut().push("sync");
//!
//! event_loop.run_until_idle();
//! assert_eq!(*log.borrow(), vec!["sync", "deferred"]);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::task::Waker;

type Task = Box<dyn FnOnce()>;

#[derive(Default)]
struct LoopInner {
    tasks: RefCell<VecDeque<Task>>,
    wakers: RefCell<Vec<Waker>>,
    ticks: Cell<u64>,
}

/// Single-threaded task queue shared by every stream built on it
#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to run after the current synchronous work completes
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
        let wakers = std::mem::take(&mut *self.inner.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Number of queued tasks
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.tasks.borrow().is_empty()
    }

    /// Total number of tasks run so far
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    /// Run the oldest queued task; returns false if there was none
    pub fn run_once(&self) -> bool {
        let task = self.inner.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                self.inner.ticks.set(self.inner.ticks.get() + 1);
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks (including ones queued while running) until none are left
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_once() {
            count += 1;
        }
        if count > 0 {
            log::trace!("event loop: ran {count} task(s)");
        }
        count
    }

    /// Wake `waker` the next time a task is deferred
    pub fn register_waker(&self, waker: &Waker) {
        let mut wakers = self.inner.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventLoop(pending={}, ticks={})",
            self.pending(),
            self.ticks()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            event_loop.defer(move || log.borrow_mut().push(i));
        }
        assert_eq!(event_loop.pending(), 3);
        assert_eq!(event_loop.run_until_idle(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(event_loop.is_idle());
    }

    #[test]
    fn test_nested_defer_runs_after_queued_tasks() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (l1, lp) = (log.clone(), event_loop.clone());
        event_loop.defer(move || {
            l1.borrow_mut().push("first");
            let l3 = l1.clone();
            lp.defer(move || l3.borrow_mut().push("nested"));
        });
        let l2 = log.clone();
        event_loop.defer(move || l2.borrow_mut().push("second"));

        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), vec!["first", "second", "nested"]);
        assert_eq!(event_loop.ticks(), 3);
    }
}
