/// When the fault monitor is installed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportingPolicy {
    /// Install the monitor even while a debugger is attached, by default the
    /// debugger is left to handle faults itself
    pub allow_debugger: bool,
}

impl ReportingPolicy {
    /// True if the monitor should be installed in the current process
    pub fn should_monitor(&self) -> bool {
        if self.allow_debugger {
            return true;
        }

        let attached = debugger_attached();
        if attached {
            log::info!("a debugger is attached, faults will not be captured");
        }
        !attached
    }
}

/// True if a tracer, usually a debugger, is attached to the current process
pub fn debugger_attached() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            std::fs::read_to_string("/proc/self/status")
                .ok()
                .and_then(|status| tracer_pid(&status))
                .is_some_and(|pid| pid != 0)
        } else {
            false
        }
    }
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|pid| pid.trim().parse().ok())
}
