use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The state of a process at the moment it faulted
///
/// Snapshots are immutable once captured, every field is public only so that
/// they can be built by the parsers in this crate and inspected by consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSnapshot {
    /// Generated at capture time
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub fault: Fault,
    /// The thread that faulted, or the watched thread for a [`Fault::Hang`]
    pub crashed_thread: i32,
    pub threads: Vec<ThreadState>,
    /// Threads that were alive but did not answer the capture request in time
    #[serde(default)]
    pub missing_threads: Vec<i32>,
    #[serde(default)]
    pub images: Vec<LoadedImage>,
    pub metadata: ProcessMetadata,
    #[serde(default)]
    pub degraded: Degradation,
}

impl CrashSnapshot {
    /// The state of the crashed thread, if it was captured
    pub fn crashed_thread_state(&self) -> Option<&ThreadState> {
        self.threads.iter().find(|ts| ts.tid == self.crashed_thread)
    }
}

/// What caused the snapshot to be taken
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// A fatal signal, `code` is the `si_code` and `address` the `si_addr`
    Signal { signo: i32, code: i32, address: u64 },
    /// An uncaught panic
    Panic {
        message: String,
        location: Option<String>,
    },
    /// A thread stopped reporting heartbeats to its watchdog
    Hang { unresponsive_ms: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub tid: i32,
    pub crashed: bool,
    pub pc: u64,
    pub sp: u64,
    /// General purpose registers in the architecture's own order, empty if
    /// the registers could not be captured
    #[serde(default)]
    pub registers: Vec<u64>,
    /// The address the first byte of `stack` was read from
    pub stack_base: u64,
    #[serde(with = "hex_bytes", default)]
    pub stack: Vec<u8>,
}

/// A file mapped into the process at the time of the fault
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedImage {
    pub base: u64,
    pub end: u64,
    #[serde(with = "hex_bytes", default)]
    pub build_id: Vec<u8>,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    pub os_name: String,
    pub os_version: String,
    pub arch: String,
    pub app_name: String,
    pub app_version: String,
    pub device_model: Option<String>,
    /// Anything else the host wants attached to every report
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

bitflags::bitflags! {
    /// The ways in which a capture is known to be incomplete
    ///
    /// A degraded snapshot is still a valid snapshot, the flags only tell the
    /// consumer which parts to take with a grain of salt. Unknown bits are
    /// retained so flags written by a newer writer survive a round trip.
    #[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Degradation: u32 {
        /// The registers of at least one thread could not be read
        const MISSING_REGISTERS = 1 << 0;
        /// The stack of at least one thread could not be read in full
        const STACK_UNREADABLE = 1 << 1;
        /// At least one thread did not respond to the capture request
        const THREADS_MISSING = 1 << 2;
        /// The list of loaded images is incomplete
        const IMAGES_TRUNCATED = 1 << 3;
        /// The capture ran out of space, or ended before it was closed
        const TRUNCATED = 1 << 4;
        /// Process metadata could not be collected
        const METADATA_MISSING = 1 << 5;

        const _ = !0;
    }
}

/// Binary blobs are carried as lowercase hex strings in the report body
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}
