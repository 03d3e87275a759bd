#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn fpe_simple() {
    run_test(Fault::Fpe, false);
}

#[test]
fn fpe_threaded() {
    run_test(Fault::Fpe, true);
}
