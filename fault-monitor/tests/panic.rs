#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_snapshot::{Fault, raw};
use fault_monitor::{FaultMonitor, MonitorOptions};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[test]
fn panics_are_captured_and_chained() {
    let dir = tempfile::tempdir().unwrap();

    let chained = Arc::new(AtomicBool::new(false));
    std::panic::set_hook(Box::new({
        let chained = chained.clone();
        move |_info| chained.store(true, Ordering::SeqCst)
    }));

    FaultMonitor::install(MonitorOptions::new(dir.path())).expect("failed to install monitor");

    let me = fault_injector::gettid();
    let result = std::panic::catch_unwind(fault_injector::raise_panic);
    assert!(result.is_err());
    assert!(chained.load(Ordering::SeqCst), "previous hook was not called");

    let path = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .expect("no capture was published")
        .unwrap()
        .path();
    let snapshot = raw::parse(&std::fs::read(path).unwrap()).unwrap();

    match &snapshot.fault {
        Fault::Panic { message, location } => {
            assert_eq!(message, "we are panicking on purpose");
            assert!(location.as_deref().is_some_and(|loc| loc.contains("lib.rs")));
        }
        other => panic!("unexpected fault {other:?}"),
    }
    assert_eq!(snapshot.crashed_thread, me);
    assert!(snapshot.crashed_thread_state().is_some());
}
