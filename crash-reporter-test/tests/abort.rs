#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn abort_simple() {
    run_test(Fault::Abort, false);
}

#[test]
fn abort_threaded() {
    run_test(Fault::Abort, true);
}
