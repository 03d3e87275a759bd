//! Types describing the state of a process at the moment it faulted, and the
//! two encodings they travel in.
//!
//! A [`CrashSnapshot`] is produced in two steps. While the process is dying the
//! fault monitor fills a pre-allocated buffer using a [`raw::RawWriter`], which
//! never allocates and never panics, and publishes that buffer as a capture
//! file. On the next start the capture is turned into a [`CrashSnapshot`] with
//! [`raw::parse`], and then into a versioned, backend agnostic report with
//! [`encode`]. [`decode`] reverses the latter and exists for diagnostics and
//! tests.

mod encode;
mod error;
pub mod raw;
mod snapshot;

pub use encode::{FORMAT_VERSION, decode, encode};
pub use error::{EncodingError, FormatError};
pub use snapshot::{
    CrashSnapshot, Degradation, Fault, LoadedImage, ProcessMetadata, ThreadState,
};
pub use uuid::Uuid;
