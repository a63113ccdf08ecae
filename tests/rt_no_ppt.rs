use std::fs;
use std::path::Path;

fn source(file: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join(file);
    fs::read_to_string(path).expect("failed to read source")
}

/// Text of `src` from `start` up to the next occurrence of `end`.
fn section<'a>(src: &'a str, start: &str, end: &str) -> &'a str {
    let from = src.find(start).expect("section start");
    let to = src[from..].find(end).map_or(src.len(), |i| from + i);
    &src[from..to]
}

const FORBIDDEN: &[&str] = &["assert_invariant(", "info!(", "debug!(", "warn!(", "error!("];

fn assert_rt_clean(name: &str, code: &str) {
    for pattern in FORBIDDEN {
        assert!(
            !code.contains(pattern),
            "{name} must not call {pattern} (locks or allocates); signal through invariant_rt instead"
        );
    }
}

/// Storage copies never log nor touch the invariant log.
#[test]
fn memory_is_rt_clean() {
    assert_rt_clean("memory.rs", &source("memory.rs"));
}

#[test]
fn broker_copy_loops_are_rt_clean() {
    let src = source("broker.rs");
    assert_rt_clean("Broker::read", section(&src, "impl Broker<Reads>", "impl Broker<Writes>"));
    assert_rt_clean("Broker::write", section(&src, "impl Broker<Writes>", "fn bind("));
}

#[test]
fn worker_cycle_is_rt_clean() {
    let src = source("scheduler.rs");
    assert_rt_clean("Worker", section(&src, "impl Worker {", "struct RunningThread"));
}
