use std::fmt;

/// An error that can occur when installing a [`crate::FaultMonitor`]
#[derive(Debug)]
pub enum Error {
    /// Unable to `mmap` memory
    OutOfMemory,
    /// Fault capture is not implemented for the target
    Unsupported,
    /// The configured capture signal lies outside `SIGRTMIN..=SIGRTMAX`
    InvalidCaptureSignal(i32),
    /// An I/O or other syscall failed
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("unable to allocate memory"),
            Self::Unsupported => f.write_str("fault capture is not supported on this target"),
            Self::InvalidCaptureSignal(sig) => {
                write!(f, "signal {sig} is not a usable real-time signal")
            }
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
