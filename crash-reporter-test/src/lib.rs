pub use fault_injector::Fault;

use crash_snapshot::{CrashSnapshot, raw};
use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

/// The exit code of a process that unwound out of `main` because of a panic
pub const PANIC_EXIT_CODE: i32 = 101;

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

fn client_path() -> PathBuf {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");
    if !env::consts::EXE_SUFFIX.is_empty() {
        cmd_path.set_extension(env::consts::EXE_SUFFIX);
    }
    cmd_path
}

/// Runs `crash-client`, which installs the fault monitor with `database` as
/// its database directory and then raises `fault`
pub fn run_client(database: &Path, fault: Fault, use_thread: bool) -> ExitStatus {
    run_client_with(database, fault, use_thread, &[])
}

/// [`run_client`], with additional `crash-client` arguments
pub fn run_client_with(
    database: &Path,
    fault: Fault,
    use_thread: bool,
    extra: &[&str],
) -> ExitStatus {
    let mut cmd = std::process::Command::new(client_path());
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.arg("--database")
        .arg(database)
        .args(["--fault", &fault.to_string()]);
    if use_thread {
        cmd.arg("--use-thread");
    }
    cmd.args(extra);

    let child = cmd.spawn().expect("failed to run crash-client");
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    println!("{stdout}");
    eprintln!("{stderr}");

    output.status
}

/// A capture written by a crashed `crash-client`
pub struct Capture {
    /// The database directory of the client
    pub dir: tempfile::TempDir,
    /// The raw capture, as published by the monitor
    pub bytes: Vec<u8>,
    pub snapshot: CrashSnapshot,
}

/// Crashes a client and retrieves the single capture it published
pub fn generate_capture(fault: Fault, use_thread: bool) -> Capture {
    capture_output();

    let dir = tempfile::tempdir().expect("failed to create database dir");
    let status = run_client(dir.path(), fault, use_thread);

    match fault.signal() {
        Some(signal) => assert_eq!(
            status.signal(),
            Some(signal),
            "crash-client was not terminated by {fault}: {status}"
        ),
        None => assert_eq!(status.code(), Some(PANIC_EXIT_CODE), "{status}"),
    }

    let mut captures = read_captures(dir.path());
    assert_eq!(captures.len(), 1, "expected exactly one capture");
    let (bytes, snapshot) = captures.remove(0);

    Capture {
        dir,
        bytes,
        snapshot,
    }
}

/// Reads and parses every capture a client published into `database`
pub fn read_captures(database: &Path) -> Vec<(Vec<u8>, CrashSnapshot)> {
    std::fs::read_dir(database.join("captures"))
        .expect("no captures directory")
        .map(|entry| {
            let path = entry.expect("failed to read entry").path();
            assert_eq!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("capture"),
                "unexpected file {}",
                path.display()
            );

            let bytes = std::fs::read(&path).expect("failed to read capture");
            match raw::parse(&bytes) {
                Ok(snapshot) => (bytes, snapshot),
                Err(e) => panic!("failed to parse {}: {e}", path.display()),
            }
        })
        .collect()
}

pub fn assert_capture(snapshot: &CrashSnapshot, fault: Fault, use_thread: bool) {
    match (&snapshot.fault, fault.signal()) {
        (crash_snapshot::Fault::Signal { signo, .. }, Some(signal)) => {
            assert_eq!(*signo, signal);
        }
        (crash_snapshot::Fault::Panic { message, location }, None) => {
            assert_eq!(message, "we are panicking on purpose");
            assert!(location.is_some());
        }
        (other, _) => panic!("unexpected fault {other:?} for {fault}"),
    }

    let pid = snapshot.metadata.pid as i32;
    assert_ne!(pid, 0);
    assert_eq!(snapshot.metadata.app_name, "crash-client");

    if use_thread {
        assert_ne!(snapshot.crashed_thread, pid, "faulted on the main thread");
    } else {
        assert_eq!(snapshot.crashed_thread, pid, "faulted off the main thread");
    }

    let crashed = snapshot
        .crashed_thread_state()
        .expect("the crashed thread was not captured");
    assert!(crashed.crashed);
    assert_ne!(crashed.sp, 0);
    assert_ne!(crashed.pc, 0);
    assert!(
        snapshot.threads.iter().filter(|ts| ts.crashed).count() == 1,
        "more than one crashed thread"
    );

    // main, one idle thread, and the raising thread if there is one
    let expected = 2 + usize::from(use_thread);
    let seen = snapshot.threads.len() + snapshot.missing_threads.len();
    assert!(seen >= expected, "only {seen} threads, expected {expected}");
    assert!(snapshot.threads.iter().any(|ts| ts.tid == pid) || snapshot.missing_threads.contains(&pid));

    assert!(
        snapshot
            .images
            .iter()
            .any(|image| image.path.ends_with("crash-client")),
        "the executable is not among the images"
    );
}

pub fn run_test(fault: Fault, use_thread: bool) -> Capture {
    let capture = generate_capture(fault, use_thread);
    assert_capture(&capture.snapshot, fault, use_thread);
    capture
}
