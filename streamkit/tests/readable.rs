use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::json;
use streamkit::{
    Chunk, Encoding, EventKind, EventLoop, Observable, ProtocolViolation, Readable,
    ReadableMode, ReadableOptions, StreamError,
};

fn collect_text(readable: &Readable) -> Rc<RefCell<Vec<String>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    readable.on_data(move |chunk| s.borrow_mut().push(chunk.to_text_lossy()));
    seen
}

fn count(readable: &Readable, kind: EventKind) -> Rc<Cell<usize>> {
    let counter = Rc::new(Cell::new(0));
    let c = counter.clone();
    readable.on(kind, move |_| c.set(c.get() + 1));
    counter
}

#[test]
fn test_push_then_end_delivers_in_order() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let seen = collect_text(&readable);
    let ends = count(&readable, EventKind::End);

    for chunk in ["a", "b", "c"] {
        readable.push(chunk).unwrap();
    }
    readable.push_end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["a", "b", "c"]);
    assert_eq!(ends.get(), 1);
    assert!(readable.is_ended());
    assert_eq!(readable.mode(), ReadableMode::Ended);
}

#[test]
fn test_fill_hook_produces_on_demand() {
    let event_loop = EventLoop::new();
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    let readable = Readable::with_fill(&event_loop, ReadableOptions::default(), move |r, _| {
        c.set(c.get() + 1);
        if c.get() > 3 {
            r.push_end()?;
        } else {
            r.push(c.get().to_string())?;
        }
        Ok(())
    });
    let seen = collect_text(&readable);
    let ends = count(&readable, EventKind::End);

    assert_eq!(calls.get(), 0);
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["1", "2", "3"]);
    assert_eq!(calls.get(), 4);
    assert_eq!(ends.get(), 1);
}

#[test]
fn test_fill_hook_may_push_on_a_later_turn() {
    let event_loop = EventLoop::new();
    let produced = Rc::new(Cell::new(0));
    let outstanding = Rc::new(Cell::new(0));
    let max_outstanding = Rc::new(Cell::new(0));
    let (p, o, m, lp) = (
        produced.clone(),
        outstanding.clone(),
        max_outstanding.clone(),
        event_loop.clone(),
    );
    let readable = Readable::with_fill(
        &event_loop,
        ReadableOptions::default().with_high_water_mark(2),
        move |r, _| {
            o.set(o.get() + 1);
            m.set(m.get().max(o.get()));
            let (r, p, o) = (r.clone(), p.clone(), o.clone());
            lp.defer(move || {
                o.set(o.get() - 1);
                p.set(p.get() + 1);
                let pushed = if p.get() > 5 {
                    r.push_end()
                } else {
                    r.push(p.get().to_string())
                };
                assert!(pushed.is_ok());
            });
            Ok(())
        },
    );
    let seen = collect_text(&readable);
    let ends = count(&readable, EventKind::End);

    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(ends.get(), 1);
    assert_eq!(max_outstanding.get(), 1);
    assert_eq!(outstanding.get(), 0);
}

#[test]
fn test_paused_read_returns_whole_buffer() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    readable.push("ab").unwrap();
    readable.push("cd").unwrap();

    assert_eq!(readable.buffered_len(), 4);
    let chunk = readable.read(None).unwrap();
    assert_eq!(chunk.as_bytes(), Some(&b"abcd"[..]));
    assert_eq!(readable.buffered_len(), 0);
    assert_eq!(readable.read(None), None);
}

#[test]
fn test_read_one_byte_at_a_time() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    readable.push("abc").unwrap();
    readable.push_end().unwrap();

    let mut bytes = Vec::new();
    while let Some(chunk) = readable.read(Some(1)) {
        assert_eq!(chunk.len(), 1);
        bytes.extend_from_slice(chunk.as_bytes().unwrap());
    }
    assert_eq!(bytes, b"abc");

    event_loop.run_until_idle();
    assert!(readable.is_ended());
}

#[test]
fn test_read_waits_for_enough_data() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    readable.push("ab").unwrap();

    assert_eq!(readable.read(Some(3)), None);
    readable.push("cd").unwrap();
    let chunk = readable.read(Some(3)).unwrap();
    assert_eq!(chunk.as_bytes(), Some(&b"abc"[..]));

    readable.push_end().unwrap();
    let rest = readable.read(Some(3)).unwrap();
    assert_eq!(rest.as_bytes(), Some(&b"d"[..]));
}

#[test]
fn test_base64_push_into_utf8_readable() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(
        &event_loop,
        ReadableOptions::default().with_encoding(Encoding::Utf8),
    );
    readable
        .push_encoded("aGVsbG8sIHdvcmxk", Encoding::Base64)
        .unwrap();

    let chunk = readable.read(None).unwrap();
    assert_eq!(chunk.as_text(), Some("hello, world"));
}

#[test]
fn test_multibyte_character_split_across_pushes() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(
        &event_loop,
        ReadableOptions::default().with_encoding(Encoding::Utf8),
    );
    let seen = collect_text(&readable);

    readable.push(vec![0xE2, 0x82]).unwrap();
    readable.push(vec![0xAC, b'!']).unwrap();
    readable.push_end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(seen.borrow().concat(), "€!");
}

#[test]
fn test_set_encoding_converts_buffered_bytes() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    readable.push("hi").unwrap();
    readable.set_encoding(Encoding::Hex);

    assert_eq!(readable.encoding(), Some(Encoding::Hex));
    let chunk = readable.read(None).unwrap();
    assert_eq!(chunk.as_text(), Some("6869"));
}

#[test]
fn test_object_mode_ignores_encoding() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(
        &event_loop,
        ReadableOptions::objects().with_encoding(Encoding::Utf8),
    );
    assert_eq!(readable.encoding(), None);

    readable.push(json!({"id": 1})).unwrap();
    readable.push("plain").unwrap();
    readable.set_encoding(Encoding::Base64);

    assert_eq!(readable.buffered_len(), 2);
    let first = readable.read(None).unwrap();
    assert_eq!(first.as_object(), Some(&json!({"id": 1})));
    let second = readable.read(None).unwrap();
    assert_eq!(second, Chunk::from("plain"));
}

#[test]
fn test_push_after_end_is_protocol_violation() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let seen = collect_text(&readable);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = errors.clone();
    readable.on_error(move |err| e.borrow_mut().push(err.clone()));

    readable.push("a").unwrap();
    readable.push_end().unwrap();
    event_loop.run_until_idle();

    let err = readable.push("b").unwrap_err();
    assert_eq!(err, StreamError::Protocol(ProtocolViolation::PushAfterEnd));
    assert!(err.is_protocol_violation());
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["a"]);
    assert_eq!(*errors.borrow(), vec![err]);
}

#[test]
fn test_repeated_push_end_is_ignored() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let ends = count(&readable, EventKind::End);
    readable.resume();

    readable.push_end().unwrap();
    readable.push_end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(ends.get(), 1);
    assert!(readable.error().is_none());
}

#[test]
fn test_object_rejected_in_byte_mode() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());

    let err = readable.push(json!([1, 2])).unwrap_err();
    assert!(matches!(err, StreamError::InvalidChunk(_)));
    assert!(readable.is_destroyed());
}

#[test]
fn test_pause_and_resume() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let seen = collect_text(&readable);

    readable.push("a").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["a"]);
    assert_eq!(readable.mode(), ReadableMode::Flowing);

    readable.pause();
    assert!(readable.is_paused());
    readable.push("b").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["a"]);
    assert_eq!(readable.buffered_len(), 1);

    readable.resume();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["a", "b"]);
}

#[test]
fn test_readable_listener_pulls_in_paused_mode() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let pulled = Rc::new(RefCell::new(String::new()));

    let (r, p) = (readable.clone(), pulled.clone());
    readable.on(EventKind::Readable, move |_| {
        while let Some(chunk) = r.read(None) {
            p.borrow_mut().push_str(&chunk.to_text_lossy());
        }
    });
    let ends = count(&readable, EventKind::End);
    assert_eq!(readable.mode(), ReadableMode::Paused);

    readable.push("x").unwrap();
    readable.push("y").unwrap();
    readable.push_end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*pulled.borrow(), "xy");
    assert_eq!(ends.get(), 1);
}

#[test]
fn test_unshift_puts_chunk_back() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    readable.push("world").unwrap();
    readable.unshift("hello, ").unwrap();

    let chunk = readable.read(None).unwrap();
    assert_eq!(chunk.to_text_lossy(), "hello, world");
}

#[test]
fn test_fill_error_destroys_stream() {
    let event_loop = EventLoop::new();
    let readable = Readable::with_fill(&event_loop, ReadableOptions::default(), |_, _| {
        Err(StreamError::producer("disk on fire"))
    });
    let seen = collect_text(&readable);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = errors.clone();
    readable.on_error(move |err| e.borrow_mut().push(err.clone()));
    let closes = count(&readable, EventKind::Close);

    event_loop.run_until_idle();

    assert!(seen.borrow().is_empty());
    assert_eq!(
        *errors.borrow(),
        vec![StreamError::Producer("disk on fire".to_string())]
    );
    assert_eq!(closes.get(), 1);
    assert!(readable.is_destroyed());
}

#[test]
fn test_destroy_discards_buffer() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let closes = count(&readable, EventKind::Close);
    let errors = count(&readable, EventKind::Error);
    readable.push("lost").unwrap();

    readable.destroy(None);
    assert_eq!(readable.buffered_len(), 0);
    assert_eq!(readable.read(None), None);
    assert!(readable.push("late").is_ok());

    event_loop.run_until_idle();
    assert_eq!(closes.get(), 1);
    assert_eq!(errors.get(), 0);
}

#[test]
fn test_push_reports_high_water_mark() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(
        &event_loop,
        ReadableOptions::default().with_high_water_mark(4),
    );
    assert_eq!(readable.high_water_mark(), 4);
    assert!(readable.push("ab").unwrap());
    assert!(!readable.push("cd").unwrap());
    assert_eq!(readable.buffered_len(), 4);
}

#[test]
fn test_removing_last_data_listener_pauses() {
    let event_loop = EventLoop::new();
    let readable = Readable::new(&event_loop, ReadableOptions::default());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    let id = readable.on_data(move |chunk| s.borrow_mut().push(chunk.to_text_lossy()));
    event_loop.run_until_idle();
    assert_eq!(readable.mode(), ReadableMode::Flowing);

    assert!(readable.off(id));
    assert_eq!(readable.mode(), ReadableMode::Paused);
    readable.push("kept").unwrap();
    event_loop.run_until_idle();
    assert_eq!(readable.buffered_len(), 4);
    assert!(seen.borrow().is_empty());

    // a new data listener picks up where the old one left off
    let again = collect_text(&readable);
    event_loop.run_until_idle();
    assert_eq!(*again.borrow(), vec!["kept"]);
}
