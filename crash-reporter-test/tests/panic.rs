#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter_test::*;

#[test]
fn panic_simple() {
    let capture = run_test(Fault::Panic, false);

    match capture.snapshot.fault {
        crash_snapshot::Fault::Panic { location, .. } => {
            let location = location.unwrap();
            assert!(location.contains("fault-injector"), "{location}");
        }
        other => panic!("unexpected fault {other:?}"),
    }
}
