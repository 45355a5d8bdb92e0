//! Notification registry
//!
//! Each stream owns one `Registry`: an ordered list of listeners, each bound
//! to one kind from the fixed vocabulary (`data`, `end`, `error`, `finish`,
//! `drain`, `readable`, `prefinish`, `close`). Within one emission listeners
//! run in registration order. `once` listeners are removed before they run.
//!
//! # Reentrancy
//!
//! The listener list is never borrowed while a callback runs, so listeners
//! may register, remove, or trigger further emissions. A listener that is
//! already running is not re-entered: a nested emission to it is queued and
//! delivered as soon as the running call returns.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::idgen::{next_listener_id, ListenerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    End,
    Error,
    Finish,
    Drain,
    Readable,
    Prefinish,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Data(Chunk),
    End,
    Error(StreamError),
    Finish,
    Drain,
    Readable,
    Prefinish,
    Close,
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::End => EventKind::End,
            Self::Error(_) => EventKind::Error,
            Self::Finish => EventKind::Finish,
            Self::Drain => EventKind::Drain,
            Self::Readable => EventKind::Readable,
            Self::Prefinish => EventKind::Prefinish,
            Self::Close => EventKind::Close,
        }
    }
}

/// Shared listener callback
pub type Callback = Rc<RefCell<dyn FnMut(&Event)>>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    callback: Callback,
}

/// Per-instance observer registry
#[derive(Default)]
pub struct Registry {
    listeners: RefCell<Vec<Listener>>,
    backlog: RefCell<Vec<(Callback, Event)>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ListenerId, kind: EventKind, once: bool, callback: Callback) {
        self.listeners.borrow_mut().push(Listener {
            id,
            kind,
            once,
            callback,
        });
    }

    /// Remove a listener; returns its kind if it was registered here
    pub fn remove(&self, id: ListenerId) -> Option<EventKind> {
        let mut listeners = self.listeners.borrow_mut();
        let pos = listeners.iter().position(|l| l.id == id)?;
        Some(listeners.remove(pos).kind)
    }

    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.kind == kind)
            .count()
    }

    /// Deliver `event` to its listeners; returns false if there were none
    pub fn emit(&self, event: &Event) -> bool {
        let kind = event.kind();
        let targets: Vec<Callback> = {
            let mut listeners = self.listeners.borrow_mut();
            let targets = listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| Rc::clone(&l.callback))
                .collect();
            listeners.retain(|l| !(l.once && l.kind == kind));
            targets
        };

        if targets.is_empty() {
            return false;
        }
        for callback in targets {
            let Ok(mut f) = callback.try_borrow_mut() else {
                log::trace!("registry.emit: listener for {kind:?} is busy, queued");
                self.backlog
                    .borrow_mut()
                    .push((Rc::clone(&callback), event.clone()));
                continue;
            };
            f(event);
            drop(f);
            self.flush_backlog(&callback);
        }
        true
    }

    /// Deliver events that reached `callback` while it was running
    fn flush_backlog(&self, callback: &Callback) {
        loop {
            let next = {
                let mut backlog = self.backlog.borrow_mut();
                match backlog.iter().position(|(c, _)| Rc::ptr_eq(c, callback)) {
                    Some(pos) => backlog.remove(pos),
                    None => return,
                }
            };
            let (callback, event) = next;
            if let Ok(mut f) = callback.try_borrow_mut() {
                f(&event);
            };
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registry(listeners={})", self.listeners.borrow().len())
    }
}

/// Subscription surface shared by every stream type
///
/// Implementors only provide `subscribe`/`unsubscribe`; the typed helpers
/// are built on top.
pub trait Observable {
    fn subscribe(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;

    fn on(&self, kind: EventKind, f: impl FnMut(&Event) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        let callback: Callback = Rc::new(RefCell::new(f));
        self.subscribe(kind, false, callback)
    }

    fn once(&self, kind: EventKind, f: impl FnMut(&Event) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        let callback: Callback = Rc::new(RefCell::new(f));
        self.subscribe(kind, true, callback)
    }

    fn off(&self, id: ListenerId) -> bool
    where
        Self: Sized,
    {
        self.unsubscribe(id)
    }

    fn on_data(&self, mut f: impl FnMut(Chunk) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.on(EventKind::Data, move |event| {
            if let Event::Data(chunk) = event {
                f(chunk.clone());
            }
        })
    }

    fn on_end(&self, mut f: impl FnMut() + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.on(EventKind::End, move |_| f())
    }

    fn on_finish(&self, mut f: impl FnMut() + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.on(EventKind::Finish, move |_| f())
    }

    fn on_error(&self, mut f: impl FnMut(&StreamError) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                f(err);
            }
        })
    }
}

/// Register `callback` under a fresh id
pub(crate) fn attach(registry: &Registry, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
    let id = next_listener_id();
    registry.add(id, kind, once, callback);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &'static str) -> Callback {
        let log = log.clone();
        Rc::new(RefCell::new(move |event: &Event| {
            log.borrow_mut().push(format!("{tag}:{:?}", event.kind()));
        }))
    }

    #[test]
    fn test_emit_in_registration_order() {
        let registry = Registry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        attach(&registry, EventKind::Finish, false, recorder(&log, "a"));
        attach(&registry, EventKind::Finish, false, recorder(&log, "b"));
        attach(&registry, EventKind::Drain, false, recorder(&log, "c"));

        assert!(registry.emit(&Event::Finish));
        assert_eq!(*log.borrow(), vec!["a:Finish", "b:Finish"]);
        assert!(!registry.emit(&Event::End));
    }

    #[test]
    fn test_once_listener_fires_once() {
        let registry = Registry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        attach(&registry, EventKind::Drain, true, recorder(&log, "once"));

        registry.emit(&Event::Drain);
        registry.emit(&Event::Drain);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(registry.count(EventKind::Drain), 0);
    }

    #[test]
    fn test_remove_listener() {
        let registry = Registry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = attach(&registry, EventKind::End, false, recorder(&log, "x"));

        assert_eq!(registry.remove(id), Some(EventKind::End));
        assert_eq!(registry.remove(id), None);
        registry.emit(&Event::End);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let registry = Rc::new(Registry::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, l) = (registry.clone(), log.clone());
        let callback: Callback = Rc::new(RefCell::new(move |_: &Event| {
            attach(&r, EventKind::Close, false, recorder(&l, "late"));
        }));
        attach(&registry, EventKind::Close, true, callback);

        registry.emit(&Event::Close);
        assert!(log.borrow().is_empty());
        registry.emit(&Event::Close);
        assert_eq!(*log.borrow(), vec!["late:Close"]);
    }

    #[test]
    fn test_nested_emit_reaches_running_listener_afterwards() {
        let registry = Rc::new(Registry::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, l) = (registry.clone(), log.clone());
        let callback: Callback = Rc::new(RefCell::new(move |event: &Event| {
            l.borrow_mut().push(format!("start:{:?}", event.kind()));
            if let Event::Data(chunk) = event {
                if chunk.to_text_lossy() == "outer" {
                    r.emit(&Event::Data(Chunk::from("inner")));
                }
            }
            l.borrow_mut().push("done".to_string());
        }));
        attach(&registry, EventKind::Data, false, callback);
        attach(&registry, EventKind::Data, false, recorder(&log, "other"));

        registry.emit(&Event::Data(Chunk::from("outer")));
        assert_eq!(
            *log.borrow(),
            vec![
                "start:Data",
                "other:Data",
                "done",
                "start:Data",
                "done",
                "other:Data",
            ]
        );
    }
}
