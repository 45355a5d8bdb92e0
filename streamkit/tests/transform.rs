use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::json;
use streamkit::{
    Chunk, EventKind, EventLoop, Observable, StreamError, Transform, TransformOptions,
};

type Log = Rc<RefCell<Vec<String>>>;

fn record(transform: &Transform) -> Log {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    transform.on_data(move |chunk| l.borrow_mut().push(chunk.to_text_lossy()));
    for (kind, name) in [(EventKind::Finish, "finish"), (EventKind::End, "end")] {
        let l = log.clone();
        transform.on(kind, move |_| l.borrow_mut().push(name.to_string()));
    }
    log
}

fn reverser(event_loop: &EventLoop) -> Transform {
    let held = Rc::new(RefCell::new(Vec::new()));
    let (keep, release) = (held.clone(), held);
    Transform::with_flush(
        event_loop,
        TransformOptions::default(),
        move |_, chunk, _, ack| {
            keep.borrow_mut().push(chunk);
            ack.ok();
        },
        move |t, ack| {
            let chunks = std::mem::take(&mut *release.borrow_mut());
            for chunk in chunks.into_iter().rev() {
                if let Err(e) = t.push(chunk) {
                    ack.err(e);
                    return;
                }
            }
            ack.ok();
        },
    )
}

#[test]
fn test_pass_through_preserves_order() {
    let event_loop = EventLoop::new();
    let transform = Transform::pass_through(&event_loop, TransformOptions::default());
    let log = record(&transform);

    for chunk in ["a", "b", "c"] {
        transform.write(chunk).unwrap();
    }
    transform.end().unwrap();
    event_loop.run_until_idle();

    let log = log.borrow();
    assert_eq!(log[..3], ["a", "b", "c"]);
    assert_eq!(log.len(), 5);
    assert!(log.contains(&"finish".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("end"));
}

#[test]
fn test_reverse_transform_emits_on_flush() {
    let event_loop = EventLoop::new();
    let transform = reverser(&event_loop);
    let log = record(&transform);

    for chunk in ["a", "b", "c"] {
        transform.write(chunk).unwrap();
    }
    event_loop.run_until_idle();
    assert!(log.borrow().is_empty());

    transform.end().unwrap();
    event_loop.run_until_idle();

    let log = log.borrow();
    assert_eq!(log[..3], ["c", "b", "a"]);
    let finish = log.iter().position(|e| e == "finish").unwrap();
    assert!(finish >= 3);
    assert_eq!(log.last().map(String::as_str), Some("end"));
}

#[test]
fn test_write_ack_waits_for_consumer() {
    let event_loop = EventLoop::new();
    let transform = Transform::pass_through(
        &event_loop,
        TransformOptions::default().with_high_water_mark(2),
    );

    for chunk in ["aa", "bb", "cc", "dd"] {
        transform.write(chunk).unwrap();
    }
    event_loop.run_until_idle();

    // "cc" waits for the transform hook, "dd" waits in the write queue
    assert_eq!(transform.readable().buffered_len(), 4);
    assert_eq!(transform.writable().pending_acks(), 2);

    transform.end().unwrap();
    let mut out = String::new();
    for _ in 0..10 {
        event_loop.run_until_idle();
        if let Some(chunk) = transform.read(None) {
            out.push_str(&chunk.to_text_lossy());
        }
        if transform.readable().received_end() && transform.readable().buffered_len() == 0 {
            break;
        }
    }
    event_loop.run_until_idle();

    assert_eq!(out, "aabbccdd");
    assert!(transform.writable().is_finished());
}

#[test]
fn test_transform_hook_may_complete_on_a_later_turn() {
    let event_loop = EventLoop::new();
    let later = event_loop.clone();
    let transform = Transform::new(&event_loop, TransformOptions::default(), move |t, chunk, _, ack| {
        let t = t.clone();
        later.defer(move || match t.push(chunk) {
            Ok(_) => ack.ok(),
            Err(e) => ack.err(e),
        });
    });
    let log = record(&transform);

    for chunk in ["a", "b", "c"] {
        transform.write(chunk).unwrap();
    }
    transform.end().unwrap();
    event_loop.run_until_idle();

    let log = log.borrow();
    assert_eq!(log[..3].concat(), "abc");
    assert_eq!(log.iter().filter(|e| *e == "finish").count(), 1);
    assert_eq!(log.iter().filter(|e| *e == "end").count(), 1);
    assert_eq!(log.last().map(String::as_str), Some("end"));
}

#[test]
fn test_transform_hook_may_push_several_chunks() {
    let event_loop = EventLoop::new();
    let splitter = Transform::new(&event_loop, TransformOptions::default(), |t, chunk, _, ack| {
        for word in chunk.to_text_lossy().split_whitespace() {
            if let Err(e) = t.push(word.to_string()) {
                ack.err(e);
                return;
            }
        }
        ack.ok();
    });
    let log = record(&splitter);

    splitter.write("one two").unwrap();
    splitter.write("").unwrap();
    splitter.end_with("three").unwrap();
    event_loop.run_until_idle();

    assert_eq!(log.borrow()[..3], ["one", "two", "three"]);
}

#[test]
fn test_transform_error_fails_writable_half_only() {
    let event_loop = EventLoop::new();
    let transform = Transform::new(&event_loop, TransformOptions::default(), |_, _, _, ack| {
        ack.err(StreamError::consumer("bad input"));
    });
    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = errors.clone();
    transform.on_error(move |err| e.borrow_mut().push(err.clone()));
    let closes = Rc::new(Cell::new(0));
    let c = closes.clone();
    transform.on(EventKind::Close, move |_| c.set(c.get() + 1));

    transform.write("x").unwrap();
    event_loop.run_until_idle();

    assert_eq!(
        *errors.borrow(),
        vec![StreamError::Consumer("bad input".to_string())]
    );
    assert!(transform.writable().is_destroyed());
    assert!(!transform.readable().is_destroyed());
    // the failed half closes the facade
    assert_eq!(closes.get(), 1);
}

#[test]
fn test_object_mode_map() {
    let event_loop = EventLoop::new();
    let double = Transform::map(&event_loop, TransformOptions::objects(), |chunk| {
        let n = chunk
            .as_object()
            .and_then(|v| v["n"].as_i64())
            .ok_or_else(|| StreamError::InvalidChunk("expected {\"n\": int}".to_string()))?;
        Ok(Chunk::from(json!({ "n": n * 2 })))
    });
    let out = Rc::new(RefCell::new(Vec::new()));
    let o = out.clone();
    double.on_data(move |chunk| o.borrow_mut().push(chunk));

    double.write(json!({"n": 1})).unwrap();
    double.write(json!({"n": 21})).unwrap();
    double.end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(
        *out.borrow(),
        vec![Chunk::from(json!({"n": 2})), Chunk::from(json!({"n": 42}))]
    );
}

#[test]
fn test_destroy_reports_error_once() {
    let event_loop = EventLoop::new();
    let transform = Transform::pass_through(&event_loop, TransformOptions::default());
    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = errors.clone();
    transform.on_error(move |err| e.borrow_mut().push(err.clone()));

    transform.destroy(Some(StreamError::producer("shutdown")));
    event_loop.run_until_idle();

    assert_eq!(errors.borrow().len(), 1);
    assert!(transform.readable().is_destroyed());
    assert!(transform.writable().is_destroyed());
    assert_eq!(transform.write("late"), Err(StreamError::Destroyed));
}
