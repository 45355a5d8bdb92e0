//! Mutable multi-stage pipelines
//!
//! A `Pipeline` is itself a stage: writes go into an input pass-through,
//! flow through the current list of stages and come out of an output
//! pass-through. Stages can be inserted, removed or replaced at any time;
//! only the links next to the edit are re-wired, so stages already flowing
//! keep their state.
//!
//! `Pipeline::labeled` builds a pipeline of named groups. Each group is a
//! nested pipeline retrievable with `get(label)` and editable in place.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::duplex::{route_subscribe, route_unsubscribe};
use crate::error::Result;
use crate::idgen::ListenerId;
use crate::notification::{Callback, EventKind, Observable};
use crate::pipe::{pipe, unpipe, PipeOptions, ReadableSide, Stage, WritableSide};
use crate::readable::Readable;
use crate::scheduler::EventLoop;
use crate::transform::{Transform, TransformOptions};
use crate::writable::Writable;

/// Shared handle to a stage held by a pipeline
pub type StageRef = Rc<dyn Stage>;

struct Entry {
    label: Option<String>,
    stage: StageRef,
    group: Option<Pipeline>,
}

impl Entry {
    fn plain(stage: StageRef) -> Self {
        Self {
            label: None,
            stage,
            group: None,
        }
    }
}

struct Inner {
    event_loop: EventLoop,
    options: TransformOptions,
    input: Transform,
    output: Transform,
    entries: RefCell<Vec<Entry>>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Rc<Inner>,
}

impl Pipeline {
    /// Unlabeled pipeline of `stages`, in order
    #[must_use]
    pub fn new(event_loop: &EventLoop, options: TransformOptions, stages: Vec<StageRef>) -> Self {
        let pipeline = Self::empty(event_loop, options);
        pipeline.splice(0, 0, stages);
        pipeline
    }

    /// Pipeline of named groups, each a nested pipeline
    #[must_use]
    pub fn labeled(
        event_loop: &EventLoop,
        options: TransformOptions,
        groups: Vec<(String, Vec<StageRef>)>,
    ) -> Self {
        let pipeline = Self::empty(event_loop, options);
        for (label, stages) in groups {
            let len = pipeline.len();
            pipeline.insert_group(len, label, stages);
        }
        pipeline
    }

    fn empty(event_loop: &EventLoop, options: TransformOptions) -> Self {
        let input = Transform::pass_through(event_loop, options.clone());
        let output = Transform::pass_through(event_loop, options.clone());
        pipe(input.readable(), output.writable(), PipeOptions::default());
        Self {
            inner: Rc::new(Inner {
                event_loop: event_loop.clone(),
                options,
                input,
                output,
                entries: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Remove `remove` stages at `index` and insert `insert` in their place;
    /// returns the removed stages
    pub fn splice(&self, index: usize, remove: usize, insert: Vec<StageRef>) -> Vec<StageRef> {
        let entries = insert.into_iter().map(Entry::plain).collect();
        self.splice_entries(index, remove, entries)
            .into_iter()
            .map(|e| e.stage)
            .collect()
    }

    fn splice_entries(&self, index: usize, remove: usize, insert: Vec<Entry>) -> Vec<Entry> {
        let inserted: Vec<StageRef> = insert.iter().map(|e| e.stage.clone()).collect();
        let (prev, next, removed) = {
            let mut entries = self.inner.entries.borrow_mut();
            let index = index.min(entries.len());
            let remove = remove.min(entries.len() - index);

            let prev: Readable = match index {
                0 => self.inner.input.readable().clone(),
                i => entries[i - 1].stage.readable_half().clone(),
            };
            let next: Writable = match entries.get(index + remove) {
                Some(entry) => entry.stage.writable_half().clone(),
                None => self.inner.output.writable().clone(),
            };
            let removed: Vec<Entry> = entries.splice(index..index + remove, insert).collect();
            tracing::debug!(
                index,
                removed = removed.len(),
                stages = entries.len(),
                "pipeline: spliced"
            );
            (prev, next, removed)
        };

        // detach the old span
        let mut upstream = prev.clone();
        for entry in &removed {
            unpipe(&upstream, entry.stage.writable_half());
            upstream = entry.stage.readable_half().clone();
        }
        unpipe(&upstream, &next);

        // attach the new one
        let mut upstream = prev;
        for stage in &inserted {
            pipe(&upstream, stage.writable_half(), PipeOptions::default());
            upstream = stage.readable_half().clone();
        }
        pipe(&upstream, &next, PipeOptions::default());

        removed
    }

    /// Append a stage
    pub fn push(&self, stage: StageRef) {
        let len = self.len();
        self.splice(len, 0, vec![stage]);
    }

    /// Prepend a stage
    pub fn unshift(&self, stage: StageRef) {
        self.splice(0, 0, vec![stage]);
    }

    /// Remove the last stage
    pub fn pop(&self) -> Option<StageRef> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.splice(len - 1, 1, Vec::new()).pop()
    }

    /// Remove the first stage
    pub fn shift(&self) -> Option<StageRef> {
        if self.is_empty() {
            return None;
        }
        self.splice(0, 1, Vec::new()).pop()
    }

    /// Insert a labeled group at `index`; returns the group's pipeline
    pub fn insert_group(&self, index: usize, label: impl Into<String>, stages: Vec<StageRef>) -> Pipeline {
        let group = Self::new(&self.inner.event_loop, self.inner.options.clone(), stages);
        let stage: StageRef = Rc::new(group.clone());
        self.splice_entries(
            index,
            0,
            vec![Entry {
                label: Some(label.into()),
                stage,
                group: Some(group.clone()),
            }],
        );
        group
    }

    /// The group labeled `label`
    #[must_use]
    pub fn get(&self, label: &str) -> Option<Pipeline> {
        self.inner
            .entries
            .borrow()
            .iter()
            .find(|e| e.label.as_deref() == Some(label))
            .and_then(|e| e.group.clone())
    }

    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.inner
            .entries
            .borrow()
            .iter()
            .position(|e| e.label.as_deref() == Some(label))
    }

    /// Replace the stages inside the group labeled `label`; returns false if
    /// there is no such group
    pub fn replace(&self, label: &str, stages: Vec<StageRef>) -> bool {
        match self.get(label) {
            Some(group) => {
                let len = group.len();
                group.splice(0, len, stages);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn stage(&self, index: usize) -> Option<StageRef> {
        self.inner.entries.borrow().get(index).map(|e| e.stage.clone())
    }

    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter_map(|e| e.label.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    #[must_use]
    pub fn input(&self) -> &Transform {
        &self.inner.input
    }

    #[must_use]
    pub fn output(&self) -> &Transform {
        &self.inner.output
    }

    /// # Errors
    /// See `Writable::write`.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool> {
        self.inner.input.write(chunk)
    }

    /// # Errors
    /// See `Writable::end`.
    pub fn end(&self) -> Result<()> {
        self.inner.input.end()
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        self.inner.output.read(n)
    }
}

impl ReadableSide for Pipeline {
    fn readable_half(&self) -> &Readable {
        self.inner.output.readable()
    }
}

impl WritableSide for Pipeline {
    fn writable_half(&self) -> &Writable {
        self.inner.input.writable()
    }
}

impl Observable for Pipeline {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        route_subscribe(
            self.inner.output.readable(),
            self.inner.input.writable(),
            kind,
            once,
            callback,
        )
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        route_unsubscribe(self.inner.output.readable(), self.inner.input.writable(), id)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.borrow();
        let stages: Vec<&str> = entries
            .iter()
            .map(|e| e.label.as_deref().unwrap_or("_"))
            .collect();
        write!(f, "Pipeline({stages:?})")
    }
}
