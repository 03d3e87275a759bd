//! Ways of making the current process sad, on purpose.
//!
//! Every `raise_*` function is expected to never return, if it does the
//! caller should treat that as a failure to raise the fault.

#![allow(unsafe_code)]

use std::{
    fmt,
    str::FromStr,
    sync::mpsc,
    thread::JoinHandle,
    time::Duration,
};

/// The faults that can be raised
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Abort,
    Bus,
    Fpe,
    Illegal,
    Segv,
    Trap,
    Panic,
}

impl Fault {
    pub const ALL: [Self; 7] = [
        Self::Abort,
        Self::Bus,
        Self::Fpe,
        Self::Illegal,
        Self::Segv,
        Self::Trap,
        Self::Panic,
    ];

    /// The signal the fault is delivered as, `None` for a panic, which only
    /// becomes `SIGABRT` if the panic strategy is to abort
    pub fn signal(self) -> Option<i32> {
        Some(match self {
            Self::Abort => libc::SIGABRT,
            Self::Bus => libc::SIGBUS,
            Self::Fpe => libc::SIGFPE,
            Self::Illegal => libc::SIGILL,
            Self::Segv => libc::SIGSEGV,
            Self::Trap => libc::SIGTRAP,
            Self::Panic => return None,
        })
    }

    /// Raises the fault on the calling thread
    pub fn raise(self) {
        match self {
            Self::Abort => raise_abort(),
            Self::Bus => raise_bus(),
            Self::Fpe => raise_floating_point_exception(),
            Self::Illegal => raise_illegal_instruction(),
            Self::Segv => raise_segfault(),
            Self::Trap => raise_trap(),
            Self::Panic => raise_panic(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Bus => "bus",
            Self::Fpe => "fpe",
            Self::Illegal => "illegal",
            Self::Segv => "segv",
            Self::Trap => "trap",
            Self::Panic => "panic",
        })
    }
}

impl FromStr for Fault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|fault| fault.to_string() == s)
            .ok_or_else(|| format!("unknown fault '{s}'"))
    }
}

/// Raises `SIGABRT`
pub fn raise_abort() {
    std::process::abort();
}

/// Raises `SIGSEGV` by reading a null reference
pub fn raise_segfault() {
    let s: &u32 = unsafe {
        // avoid deref_nullptr lint
        fn definitely_not_null() -> *const u32 {
            std::ptr::null()
        }
        &*definitely_not_null()
    };

    println!("we are crashing by accessing a null reference: {s}");
}

/// Raises `SIGFPE`, with an integer division by zero where the architecture
/// traps on one
pub fn raise_floating_point_exception() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let ohno: u32;
            unsafe {
                std::arch::asm!(
                    "mov eax, 1",
                    "cdq",
                    "mov {div:e}, 0",
                    "idiv {div:e}",
                    div = out(reg) ohno,
                    out("eax") _,
                    out("edx") _,
                );
            }
            println!("we are crashing by dividing by zero: {ohno}");
        } else {
            // aarch64 and friends return 0 from an integer division by zero
            unsafe { libc::raise(libc::SIGFPE) };
        }
    }
}

/// Raises `SIGILL`
pub fn raise_illegal_instruction() {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "x86"))] {
            unsafe { std::arch::asm!("ud2") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { std::arch::asm!("udf #0") };
        } else {
            unsafe { libc::raise(libc::SIGILL) };
        }
    }
}

/// Raises `SIGTRAP`
pub fn raise_trap() {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "x86"))] {
            unsafe { std::arch::asm!("int3") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { std::arch::asm!("brk #0") };
        } else {
            unsafe { libc::raise(libc::SIGTRAP) };
        }
    }
}

/// Raises `SIGBUS` by touching a shared mapping of an empty file
pub fn raise_bus() {
    let path = std::env::temp_dir().join(format!("fault-injector-bus-{}", std::process::id()));
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to create {}: {err}", path.display());
            return;
        }
    };

    use std::os::fd::AsRawFd;

    unsafe {
        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        if mapping == libc::MAP_FAILED {
            eprintln!("failed to map {}", path.display());
            return;
        }

        let _ = std::fs::remove_file(&path);
        let byte = std::ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("we are crashing by reading past the end of a file: {byte}");
    }
}

/// Panics
pub fn raise_panic() {
    panic!("we are panicking on purpose");
}

/// A thread that does nothing until it is dropped, so that captures have
/// more than one thread to look at
pub struct IdleThread {
    tid: i32,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IdleThread {
    pub fn spawn() -> Self {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("idle".to_owned())
            .spawn(move || {
                let _ = tid_tx.send(gettid());
                let _ = stop_rx.recv();
            })
            .expect("failed to spawn idle thread");

        let tid = tid_rx.recv().expect("idle thread exited before reporting its id");

        Self {
            tid,
            stop: Some(stop_tx),
            thread: Some(thread),
        }
    }

    /// The kernel thread id of the idle thread
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }
}

impl Drop for IdleThread {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The kernel thread id of the calling thread
#[inline]
pub fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Busy waits the calling thread for `duration` without yielding to anything
/// that could count as progress
pub fn hang(duration: Duration) {
    let start = std::time::Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_names() {
        for fault in Fault::ALL {
            assert_eq!(fault.to_string().parse::<Fault>().unwrap(), fault);
        }
        assert!("oops".parse::<Fault>().is_err());
    }

    #[test]
    fn idle_thread_is_distinct() {
        let idle = IdleThread::spawn();
        assert_ne!(idle.tid(), gettid());
    }
}
