//! [`FaultMonitor`] captures the state of the current process when it dies,
//! and writes it to disk before the process goes away so that it can be
//! reported on the next run.
//!
//! # Linux
//!
//! On Linux and Android this is done by handling [signals](https://man7.org/linux/man-pages/man7/signal.7.html),
//! namely the following
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, i.e. to terminate. The signal
//! is usually initiated by the process itself when it calls `std::process::abort`
//! or `libc::abort`, but it can be sent to the process from outside like any
//! other signal.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//! Though it stands for **f**loating **p**oint **e**xception this signal covers
//! integer operations as well.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//! This covers infamous `null` pointer access, out of bounds access, use after
//! free, stack overflows, etc.
//!
//! ## `SIGTRAP`
//!
//! Signal sent to a process when a trap is raised, eg. a breakpoint or debug
//! assertion.
//!
//! Once a fault is caught, everything needed to describe it is written into
//! memory that was allocated by [`FaultMonitor::install`]. The other threads
//! of the process are asked to describe themselves with a dedicated real-time
//! signal, which is why the monitor reserves one of `SIGRTMIN..=SIGRTMAX` for
//! its own use. The finished capture is published as `<uuid>.capture` in the
//! captures directory, after which the previously installed handlers are put
//! back and the signal is raised again so the process terminates the way it
//! would have without the monitor.
//!
//! Panics (when [`MonitorOptions::capture_panics`] is set) and hangs detected
//! by a [`Watchdog`] go through the same capture path.
//!
//! # Other targets
//!
//! [`FaultMonitor::install`] returns [`Error::Unsupported`].

#![allow(unsafe_code)]

mod error;
pub mod metadata;

pub use crash_snapshot::ProcessMetadata;
pub use error::Error;

use std::{path::PathBuf, time::Duration};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    #[cfg(unix)]
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }

    #[cfg(not(unix))]
    {
        use std::io::Write;
        let _ = std::io::stderr().write_all(s.as_bytes());
    }
}

/// Settings for [`FaultMonitor::install`]
///
/// Every size here is allocated up front, a capture can never use more.
#[derive(Clone, Debug)]
pub struct MonitorOptions {
    /// The directory captures are published to, created if it doesn't exist
    pub captures_dir: PathBuf,
    /// Attached to every capture
    pub metadata: ProcessMetadata,
    /// The size of the buffer a single capture is written into
    pub capture_buffer_size: usize,
    /// The maximum number of threads whose state is captured, any more are
    /// recorded as missing
    pub max_threads: usize,
    /// The number of bytes of stack captured for each thread
    pub stack_bytes: usize,
    /// The size of the buffer `/proc/self/maps` is read into
    pub maps_buffer_size: usize,
    /// Installs a panic hook that captures every panic before chaining to
    /// the previous hook
    pub capture_panics: bool,
    /// How long a capture waits for the other threads to describe themselves
    pub thread_capture_timeout: Duration,
    /// The capture signal is `SIGRTMIN() + capture_signal_offset`
    pub capture_signal_offset: i32,
}

impl MonitorOptions {
    pub fn new(captures_dir: impl Into<PathBuf>) -> Self {
        Self {
            captures_dir: captures_dir.into(),
            metadata: metadata::current(&metadata::exe_name(), ""),
            capture_buffer_size: 2 * 1024 * 1024,
            max_threads: 64,
            stack_bytes: 16 * 1024,
            maps_buffer_size: 256 * 1024,
            capture_panics: true,
            thread_capture_timeout: Duration::from_millis(500),
            capture_signal_offset: 4,
        }
    }

    #[inline]
    pub fn metadata(mut self, metadata: ProcessMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[inline]
    pub fn capture_panics(mut self, capture: bool) -> Self {
        self.capture_panics = capture;
        self
    }

    #[inline]
    pub fn max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    #[inline]
    pub fn stack_bytes(mut self, bytes: usize) -> Self {
        self.stack_bytes = bytes;
        self
    }

    #[inline]
    pub fn capture_buffer_size(mut self, bytes: usize) -> Self {
        self.capture_buffer_size = bytes;
        self
    }

    #[inline]
    pub fn thread_capture_timeout(mut self, timeout: Duration) -> Self {
        self.thread_capture_timeout = timeout;
        self
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{FaultMonitor, Signal, Watchdog};
    } else {
        mod unsupported;

        pub use unsupported::{FaultMonitor, Signal, Watchdog};
    }
}
