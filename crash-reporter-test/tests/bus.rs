#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn bus_simple() {
    run_test(Fault::Bus, false);
}

#[test]
fn bus_threaded() {
    run_test(Fault::Bus, true);
}
