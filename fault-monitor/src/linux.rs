mod capture;
mod context;
mod images;
mod mem;
mod panic;
mod state;
mod threads;
mod watchdog;

pub use watchdog::Watchdog;

use crate::{Error, MonitorOptions};
use std::time::Duration;

/// The signals that we support catching and raising
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

/// A handle to the process wide fault monitor
///
/// Handlers are never uninstalled, dropping the handle does nothing.
#[derive(Copy, Clone, Debug)]
pub struct FaultMonitor {
    _priv: (),
}

impl FaultMonitor {
    /// Installs the monitor.
    ///
    /// This allocates everything a capture will need, saves the currently
    /// installed handler of every [`Signal`] and then installs our own, and
    /// installs the panic hook if [`MonitorOptions::capture_panics`] is set.
    ///
    /// Calling this again after a successful install returns a handle to the
    /// already installed monitor, the new options are ignored.
    pub fn install(options: MonitorOptions) -> Result<Self, Error> {
        state::install(options)?;
        Ok(Self { _priv: () })
    }

    /// Retrieves the installed monitor, if any
    #[inline]
    pub fn installed() -> Option<Self> {
        state::is_installed().then_some(Self { _priv: () })
    }

    #[inline]
    pub fn is_installed() -> bool {
        state::is_installed()
    }

    /// Runs the full capture for the calling thread, as if `signal` had been
    /// raised, but without terminating the process.
    ///
    /// Returns `true` if a capture was published.
    pub fn simulate_fault(&self, signal: Signal) -> bool {
        state::simulate(signal as i32)
    }

    /// Starts watching the calling thread, which must then call
    /// [`Watchdog::heartbeat`] more often than `timeout`
    pub fn watchdog(&self, timeout: Duration) -> Result<Watchdog, Error> {
        Watchdog::spawn(timeout)
    }
}
