#![allow(dead_code)]

use crash_reporter::{ClientOptions, EndpointConfig, RetryPolicy};
use crash_snapshot::{CrashSnapshot, Fault, ProcessMetadata, ThreadState};
use std::time::Duration;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn snapshot() -> CrashSnapshot {
    CrashSnapshot {
        id: uuid::Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        fault: Fault::Signal {
            signo: 11,
            code: 1,
            address: 0xdead,
        },
        crashed_thread: 100,
        threads: vec![ThreadState {
            tid: 100,
            crashed: true,
            pc: 0x4000_1000,
            sp: 0x7fff_0000,
            registers: vec![0; 4],
            stack_base: 0x7fff_0000,
            stack: vec![0x5a; 128],
        }],
        missing_threads: vec![101],
        images: Vec::new(),
        metadata: ProcessMetadata {
            pid: 1234,
            app_name: "tester".to_owned(),
            ..Default::default()
        },
        degraded: Default::default(),
    }
}

/// Publishes a minimal capture, as the fault monitor would have during a
/// previous run
pub fn write_capture(database_dir: &std::path::Path) -> uuid::Uuid {
    let id = uuid::Uuid::new_v4();
    let mut raw = vec![0u8; 4096];
    let len = {
        let mut w = crash_snapshot::raw::RawWriter::new(&mut raw).unwrap();
        assert!(w.header(&crash_snapshot::raw::RawHeader {
            id: *id.as_bytes(),
            crashed_tid: 7,
            ..Default::default()
        }));
        w.finish()
    };

    let captures = database_dir.join(crash_reporter::store::CAPTURES_DIR);
    std::fs::create_dir_all(&captures).unwrap();
    std::fs::write(captures.join(format!("{id}.capture")), &raw[..len]).unwrap();
    id
}

pub fn endpoint(server: &wiremock::MockServer) -> EndpointConfig {
    EndpointConfig::new(&format!("{}/crash", server.uri()), "sekrit")
        .unwrap()
        .universe("tests")
}

/// Retries are due immediately
pub fn eager_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .max_attempts(max_attempts)
        .base_delay(Duration::ZERO)
        .jitter(false)
}

pub fn client_options() -> ClientOptions {
    ClientOptions {
        timeout: Duration::from_secs(5),
        auth_backoff_floor: Duration::ZERO,
        ..Default::default()
    }
}
