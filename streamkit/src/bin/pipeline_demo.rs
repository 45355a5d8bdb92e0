//! Pipeline CLI Demo
//!
//! Reads lines from stdin, rotates their letters (rot-13 unless a shift is
//! given as the first argument) and prints them in reverse order once stdin
//! is closed.
//!
//! `RUST_LOG=debug` shows the engine at work.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use streamkit::{
    Chunk, EventLoop, Readable, ReadableOptions, ReadableSide, Transform, TransformOptions,
    Writable, WritableOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};

fn rotate(text: &str, shift: u8) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (b'a' + (c as u8 - b'a' + shift) % 26) as char,
            'A'..='Z' => (b'A' + (c as u8 - b'A' + shift) % 26) as char,
            _ => c,
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let shift: u8 = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u8>()? % 26,
        None => 13,
    };

    let event_loop = EventLoop::new();
    let options = TransformOptions::objects();

    let lines = Readable::new(&event_loop, ReadableOptions::objects());

    let rot = Transform::map(&event_loop, options.clone(), move |chunk| {
        Ok(Chunk::from(rotate(&chunk.to_text_lossy(), shift)))
    });

    let held = Rc::new(RefCell::new(Vec::new()));
    let (keep, release) = (held.clone(), held);
    let reverse = Transform::with_flush(
        &event_loop,
        options,
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
    );

    let stdout = Writable::new(&event_loop, WritableOptions::objects(), |_, chunk, _, ack| {
        let mut out = std::io::stdout().lock();
        match writeln!(out, "{}", chunk.to_text_lossy()) {
            Ok(()) => ack.ok(),
            Err(e) => ack.err(streamkit::StreamError::consumer(e.to_string())),
        }
    });

    lines.pipe(&rot).pipe(&reverse).pipe(&stdout);
    let finished = stdout.finished();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let reader = tokio::task::spawn_local(async move {
                println!("Enter text (Ctrl-D to finish):");
                let mut input = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    match input.next_line().await {
                        Ok(Some(line)) => {
                            if let Err(e) = lines.push(line) {
                                eprintln!("Push error: {e}");
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            eprintln!("Read error: {e}");
                            break;
                        }
                    }
                }
                if let Err(e) = lines.push_end() {
                    eprintln!("Push error: {e}");
                }
            });

            let result = finished.await;
            let _ = reader.await;
            result
        })
        .await?;

    println!("All lines written");
    Ok(())
}
