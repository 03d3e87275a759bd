#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn segfault_simple() {
    run_test(Fault::Segv, false);
}

#[test]
fn segfault_threaded() {
    run_test(Fault::Segv, true);
}
