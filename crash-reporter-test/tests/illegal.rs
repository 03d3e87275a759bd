#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn illegal_simple() {
    run_test(Fault::Illegal, false);
}

#[test]
fn illegal_threaded() {
    run_test(Fault::Illegal, true);
}
