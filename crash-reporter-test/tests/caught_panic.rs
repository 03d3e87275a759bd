#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;
use crash_snapshot::Fault as Captured;
use std::os::unix::process::ExitStatusExt;

fn abort_after_caught_panic(use_thread: bool) {
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let status = run_client_with(dir.path(), Fault::Abort, use_thread, &["--recover-from-panic"]);
    assert_eq!(status.signal(), Some(libc::SIGABRT), "{status}");

    let captures = read_captures(dir.path());
    assert_eq!(captures.len(), 2, "expected the panic and the abort");

    let panics = captures
        .iter()
        .filter(|(_, snapshot)| matches!(snapshot.fault, Captured::Panic { .. }))
        .count();
    assert_eq!(panics, 1);

    let (_, aborted) = captures
        .iter()
        .find(|(_, snapshot)| matches!(snapshot.fault, Captured::Signal { .. }))
        .expect("the abort was not captured");
    assert_capture(aborted, Fault::Abort, use_thread);
}

#[test]
fn abort_after_caught_panic_simple() {
    abort_after_caught_panic(false);
}

#[test]
fn abort_after_caught_panic_threaded() {
    abort_after_caught_panic(true);
}
