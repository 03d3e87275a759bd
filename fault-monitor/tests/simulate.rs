#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_snapshot::{Fault, raw};
use fault_monitor::{FaultMonitor, MonitorOptions, ProcessMetadata, Signal};

#[test]
fn simulated_fault_captures_every_thread() {
    let dir = tempfile::tempdir().unwrap();

    let mut metadata = ProcessMetadata {
        app_name: "simulate".to_owned(),
        app_version: "1.2.3".to_owned(),
        os_name: "Linux".to_owned(),
        ..Default::default()
    };
    metadata
        .attributes
        .insert("build".to_owned(), "nightly".to_owned());

    let monitor = FaultMonitor::install(MonitorOptions::new(dir.path()).metadata(metadata))
        .expect("failed to install monitor");

    // A second install hands back the same monitor
    assert!(FaultMonitor::install(MonitorOptions::new("/nonexistent/elsewhere")).is_ok());
    assert!(FaultMonitor::is_installed());

    let idle = fault_injector::IdleThread::spawn();
    let me = fault_injector::gettid();

    assert!(monitor.simulate_fault(Signal::Segv));

    let mut published = Vec::new();
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        assert_eq!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("capture"),
            "unexpected file {}",
            path.display()
        );
        published.push(path);
    }
    assert_eq!(published.len(), 1);

    let bytes = std::fs::read(&published[0]).unwrap();
    let snapshot = raw::parse(&bytes).expect("failed to parse capture");

    assert_eq!(
        published[0].file_stem().and_then(|s| s.to_str()),
        Some(snapshot.id.to_string().as_str())
    );
    assert_eq!(snapshot.id.get_version_num(), 4);

    match snapshot.fault {
        Fault::Signal { signo, .. } => assert_eq!(signo, libc::SIGSEGV),
        other => panic!("unexpected fault {other:?}"),
    }

    assert_eq!(snapshot.crashed_thread, me);
    let crashed = snapshot.crashed_thread_state().expect("crashed thread missing");
    assert!(crashed.crashed);
    assert_ne!(crashed.pc, 0);
    assert_ne!(crashed.sp, 0);
    assert!(!crashed.stack.is_empty());

    let other = snapshot
        .threads
        .iter()
        .find(|ts| ts.tid == idle.tid())
        .expect("idle thread was not captured");
    assert!(!other.crashed);
    assert_ne!(other.sp, 0);

    assert_eq!(
        snapshot.threads.iter().filter(|ts| ts.crashed).count(),
        1,
        "exactly one thread is the crashed one"
    );

    assert_eq!(snapshot.metadata.pid, std::process::id());
    assert_eq!(snapshot.metadata.app_name, "simulate");
    assert_eq!(snapshot.metadata.app_version, "1.2.3");
    assert_eq!(snapshot.metadata.attributes["build"], "nightly");

    assert!(
        snapshot
            .images
            .iter()
            .any(|image| image.base <= crashed.pc && crashed.pc < image.end),
        "the crashed pc is not in any image"
    );

    // The process keeps running and can capture again
    assert!(monitor.simulate_fault(Signal::Abort));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}
