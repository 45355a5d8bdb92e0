use std::cell::{Cell, RefCell};
use std::rc::Rc;

use streamkit::{
    Chunk, EventLoop, Observable, Pipeline, Readable, ReadableOptions, ReadableSide, StageRef,
    Transform, TransformOptions, Writable, WritableOptions,
};

fn suffix(event_loop: &EventLoop, tail: &'static str) -> Transform {
    Transform::map(event_loop, TransformOptions::objects(), move |chunk| {
        Ok(Chunk::from(format!("{}{tail}", chunk.to_text_lossy())))
    })
}

fn upper(event_loop: &EventLoop) -> Transform {
    Transform::map(event_loop, TransformOptions::objects(), |chunk| {
        Ok(Chunk::from(chunk.to_text_lossy().to_uppercase()))
    })
}

fn stage(transform: Transform) -> StageRef {
    Rc::new(transform)
}

fn collect(pipeline: &Pipeline) -> (Rc<RefCell<Vec<String>>>, Rc<Cell<bool>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    pipeline.on_data(move |chunk| s.borrow_mut().push(chunk.to_text_lossy()));
    let ended = Rc::new(Cell::new(false));
    let e = ended.clone();
    pipeline.on_end(move || e.set(true));
    (seen, ended)
}

#[test]
fn test_empty_pipeline_passes_input_through() {
    let event_loop = EventLoop::new();
    let pipeline = Pipeline::new(&event_loop, TransformOptions::objects(), Vec::new());
    let (seen, ended) = collect(&pipeline);
    assert!(pipeline.is_empty());

    pipeline.write("a").unwrap();
    pipeline.write("b").unwrap();
    pipeline.end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["a", "b"]);
    assert!(ended.get());
}

#[test]
fn test_stages_apply_in_order() {
    let event_loop = EventLoop::new();
    let pipeline = Pipeline::new(
        &event_loop,
        TransformOptions::objects(),
        vec![stage(upper(&event_loop)), stage(suffix(&event_loop, "!"))],
    );
    let (seen, ended) = collect(&pipeline);
    assert_eq!(pipeline.len(), 2);

    pipeline.write("hi").unwrap();
    pipeline.end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["HI!"]);
    assert!(ended.get());
}

#[test]
fn test_splice_into_live_pipeline() {
    let event_loop = EventLoop::new();
    let pipeline = Pipeline::new(
        &event_loop,
        TransformOptions::objects(),
        vec![stage(upper(&event_loop))],
    );
    let (seen, ended) = collect(&pipeline);

    pipeline.write("a").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["A"]);

    pipeline.push(stage(suffix(&event_loop, "!")));
    pipeline.write("b").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["A", "B!"]);

    pipeline.unshift(stage(suffix(&event_loop, "c")));
    pipeline.write("b").unwrap();
    pipeline.end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["A", "B!", "BC!"]);
    assert!(ended.get());
}

#[test]
fn test_pop_and_shift_remove_stages() {
    let event_loop = EventLoop::new();
    let first = suffix(&event_loop, "1");
    let second = suffix(&event_loop, "2");
    let third = suffix(&event_loop, "3");
    let pipeline = Pipeline::new(
        &event_loop,
        TransformOptions::objects(),
        vec![
            stage(first.clone()),
            stage(second.clone()),
            stage(third.clone()),
        ],
    );
    let (seen, _) = collect(&pipeline);

    let popped = pipeline.pop().unwrap();
    assert!(popped.readable_half().ptr_eq(third.readable()));
    let shifted = pipeline.shift().unwrap();
    assert!(shifted.readable_half().ptr_eq(first.readable()));
    assert_eq!(pipeline.len(), 1);
    assert!(pipeline
        .stage(0)
        .is_some_and(|s| s.readable_half().ptr_eq(second.readable())));

    pipeline.write("x").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["x2"]);
}

#[test]
fn test_splice_replaces_a_range() {
    let event_loop = EventLoop::new();
    let pipeline = Pipeline::new(
        &event_loop,
        TransformOptions::objects(),
        vec![
            stage(suffix(&event_loop, "a")),
            stage(suffix(&event_loop, "b")),
            stage(suffix(&event_loop, "c")),
        ],
    );
    let (seen, _) = collect(&pipeline);

    let removed = pipeline.splice(1, 1, vec![stage(suffix(&event_loop, "B"))]);
    assert_eq!(removed.len(), 1);
    assert_eq!(pipeline.len(), 3);

    pipeline.write("-").unwrap();
    event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec!["-aBc"]);
}

#[test]
fn test_labeled_groups_are_editable() {
    let event_loop = EventLoop::new();
    let pipeline = Pipeline::labeled(
        &event_loop,
        TransformOptions::objects(),
        vec![
            ("shout".to_string(), vec![stage(upper(&event_loop))]),
            ("punctuate".to_string(), vec![stage(suffix(&event_loop, "!"))]),
        ],
    );
    let (seen, ended) = collect(&pipeline);

    assert_eq!(pipeline.labels(), vec!["shout", "punctuate"]);
    assert_eq!(pipeline.index_of("punctuate"), Some(1));
    assert_eq!(pipeline.index_of("missing"), None);
    assert!(pipeline.get("missing").is_none());

    pipeline.write("hey").unwrap();
    event_loop.run_until_idle();

    assert!(pipeline.replace("punctuate", vec![stage(suffix(&event_loop, "?"))]));
    assert!(!pipeline.replace("missing", Vec::new()));
    pipeline.write("you").unwrap();
    event_loop.run_until_idle();

    let group = pipeline.get("shout").unwrap();
    group.push(stage(suffix(&event_loop, "~")));
    pipeline.write("there").unwrap();
    pipeline.end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*seen.borrow(), vec!["HEY!", "YOU?", "THERE~?"]);
    assert!(ended.get());
}

#[test]
fn test_pipeline_is_a_stage() {
    let event_loop = EventLoop::new();
    let source = Readable::new(&event_loop, ReadableOptions::objects());
    let pipeline = Pipeline::new(
        &event_loop,
        TransformOptions::objects(),
        vec![stage(upper(&event_loop))],
    );
    let written = Rc::new(RefCell::new(Vec::new()));
    let w = written.clone();
    let dest = Writable::new(&event_loop, WritableOptions::objects(), move |_, chunk, _, ack| {
        w.borrow_mut().push(chunk.to_text_lossy());
        ack.ok();
    });

    source.pipe(&pipeline).pipe(&dest);
    source.push("quiet").unwrap();
    source.push_end().unwrap();
    event_loop.run_until_idle();

    assert_eq!(*written.borrow(), vec!["QUIET"]);
    assert!(dest.is_finished());
}
