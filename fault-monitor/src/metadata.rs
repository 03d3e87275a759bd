//! Collection of the process metadata attached to every capture
//!
//! This runs once, at install time, the capture only ever copies the already
//! encoded result.

use crate::ProcessMetadata;

/// Describes the current process
pub fn current(app_name: &str, app_version: &str) -> ProcessMetadata {
    let (os_name, os_version) = os_release();

    ProcessMetadata {
        pid: std::process::id(),
        os_name,
        os_version,
        arch: std::env::consts::ARCH.to_owned(),
        app_name: app_name.to_owned(),
        app_version: app_version.to_owned(),
        device_model: device_model(),
        attributes: Default::default(),
    }
}

/// The file stem of the current executable, or an empty string
pub fn exe_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

#[cfg(unix)]
fn os_release() -> (String, String) {
    fn field(raw: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = raw
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // SAFETY: syscall, utsname is plain old data
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return (std::env::consts::OS.to_owned(), String::new());
        }

        (field(&uts.sysname), field(&uts.release))
    }
}

#[cfg(not(unix))]
fn os_release() -> (String, String) {
    (std::env::consts::OS.to_owned(), String::new())
}

/// Android exposes the model as a system property, everywhere else the host
/// has to provide it
#[cfg(target_os = "android")]
fn device_model() -> Option<String> {
    let mut value = [0 as libc::c_char; libc::PROP_VALUE_MAX as usize];

    // SAFETY: the buffer is PROP_VALUE_MAX bytes as required
    let len = unsafe { libc::__system_property_get(c"ro.product.model".as_ptr(), value.as_mut_ptr()) };
    if len <= 0 {
        return None;
    }

    let bytes: Vec<u8> = value[..len as usize].iter().map(|c| *c as u8).collect();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(not(target_os = "android"))]
fn device_model() -> Option<String> {
    None
}

#[cfg(test)]
mod test {
    #[test]
    fn describes_process() {
        let md = super::current("app", "1.0.0");
        assert_eq!(md.pid, std::process::id());
        assert_eq!(md.arch, std::env::consts::ARCH);
        assert_eq!(md.app_name, "app");
        assert!(!md.os_name.is_empty());

        #[cfg(target_os = "linux")]
        assert_eq!(md.os_name, "Linux");
    }
}
