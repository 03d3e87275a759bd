use crate::{Error, MonitorOptions};
use std::time::Duration;

/// The signals that would be caught on a supported target
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Abort,
    Bus,
    Fpe,
    Illegal,
    Segv,
    Trap,
}

/// Fault capture is not implemented for this target, so a monitor can never
/// be installed
#[derive(Copy, Clone, Debug)]
pub struct FaultMonitor {
    _priv: (),
}

impl FaultMonitor {
    pub fn install(_options: MonitorOptions) -> Result<Self, Error> {
        Err(Error::Unsupported)
    }

    #[inline]
    pub fn installed() -> Option<Self> {
        None
    }

    #[inline]
    pub fn is_installed() -> bool {
        false
    }

    pub fn simulate_fault(&self, _signal: Signal) -> bool {
        false
    }

    pub fn watchdog(&self, _timeout: Duration) -> Result<Watchdog, Error> {
        Err(Error::Unsupported)
    }
}

pub struct Watchdog {
    _priv: (),
}

impl Watchdog {
    #[inline]
    pub fn heartbeat(&self) {}
}
