use super::{
    capture::{self, Latch, Trigger},
    threads::{self, ThreadSlot},
};
use crate::{Error, MonitorOptions};
use std::{
    cell::UnsafeCell,
    mem,
    os::fd::IntoRawFd,
    ptr,
    sync::atomic::{AtomicI32, AtomicPtr, Ordering},
    time::Duration,
};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 64 * 1024 {
        libc::SIGSTKSZ
    } else {
        64 * 1024
    }
}

/// The size of the alternate stack that is mapped for the installing thread.
///
/// The capture runs on this stack when the fault is a stack overflow, so it
/// is sized for the capture rather than the minimum the kernel requires. The
/// memory is only committed if it is ever used.
const SIG_STACK_SIZE: usize = get_stack_size();

/// Create an alternative stack to run the signal handlers on. This is done since
/// the signal might have been caused by a stack overflow.
unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, with a guard page
        // below it
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let map = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let stack_ptr = (map as usize + guard_size) as *mut libc::c_void;
        if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(map, alloc_size);
            return Err(err.into());
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(map, alloc_size);
            return Err(err.into());
        }

        Ok(())
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
unsafe fn install_default_handler(sig: i32) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

/// The various signals we attempt to handle
const EXCEPTION_SIGNALS: [i32; 6] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGTRAP,
];

/// The memory a capture is written through
pub(crate) struct Buffers {
    pub(crate) capture: Box<[u8]>,
    pub(crate) maps: Box<[u8]>,
    pub(crate) dirents: Box<[u8]>,
}

/// Everything the signal handlers need, allocated once by [`install`] and
/// never freed
pub(crate) struct MonitorState {
    /// The handlers that were installed before ours, in [`EXCEPTION_SIGNALS`]
    /// order
    old_handlers: [libc::sigaction; 6],
    pub(crate) capture_signal: i32,
    /// Open descriptor of the captures directory
    pub(crate) captures_dir: i32,
    pub(crate) page_size: usize,
    pub(crate) stack_bytes: usize,
    pub(crate) thread_capture_timeout: Duration,
    /// The already encoded metadata section
    pub(crate) metadata: Box<[u8]>,
    pub(crate) buffers: UnsafeCell<Buffers>,
    /// The slot the capturing thread answers into when it captures itself
    pub(crate) own_slot: ThreadSlot,
    pub(crate) slots: Box<[ThreadSlot]>,
}

// SAFETY: the buffers are only accessed by the holder of the capture latch,
// everything else is immutable or atomic
unsafe impl Sync for MonitorState {}
unsafe impl Send for MonitorState {}

static STATE: AtomicPtr<MonitorState> = AtomicPtr::new(ptr::null_mut());
static INSTALL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// The last thread that captured a panic, so that the `SIGABRT` raised when
/// that panic aborts the process doesn't produce a second capture
///
/// Only meaningful while that thread is still panicking, a panic that was
/// caught doesn't hide a later abort.
pub(super) static LAST_PANIC_TID: AtomicI32 = AtomicI32::new(0);

#[inline]
fn state() -> Option<&'static MonitorState> {
    // SAFETY: the state is leaked once installed, so lives forever
    unsafe { STATE.load(Ordering::Acquire).as_ref() }
}

#[inline]
pub(super) fn is_installed() -> bool {
    !STATE.load(Ordering::Acquire).is_null()
}

pub(super) fn install(options: MonitorOptions) -> Result<(), Error> {
    let _lock = INSTALL.lock();

    if is_installed() {
        return Ok(());
    }

    let capture_signal = libc::SIGRTMIN() + options.capture_signal_offset;
    if options.capture_signal_offset < 0 || capture_signal > libc::SIGRTMAX() {
        return Err(Error::InvalidCaptureSignal(capture_signal));
    }

    // SAFETY: syscalls
    unsafe {
        install_sigaltstack()?;
    }

    std::fs::create_dir_all(&options.captures_dir)?;
    let captures_dir = std::fs::File::open(&options.captures_dir)?;

    // Attempt store all of the current handlers so we can restore them later
    // SAFETY: syscalls, sigaction is plain old data
    let old_handlers = unsafe {
        let mut old_handlers: [libc::sigaction; 6] = mem::zeroed();
        for (sig, old) in EXCEPTION_SIGNALS.iter().zip(old_handlers.iter_mut()) {
            if libc::sigaction(*sig, ptr::null(), old) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        old_handlers
    };

    let buffer = |len: usize| vec![0u8; len].into_boxed_slice();

    let state = Box::new(MonitorState {
        old_handlers,
        capture_signal,
        captures_dir: captures_dir.into_raw_fd(),
        // SAFETY: libc call
        page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize,
        stack_bytes: options.stack_bytes,
        thread_capture_timeout: options.thread_capture_timeout,
        metadata: crash_snapshot::raw::encode_metadata(&options.metadata).into_boxed_slice(),
        buffers: UnsafeCell::new(Buffers {
            capture: buffer(
                options
                    .capture_buffer_size
                    .max(crash_snapshot::raw::MIN_BUFFER_LEN),
            ),
            maps: buffer(options.maps_buffer_size),
            dirents: buffer(32 * 1024),
        }),
        own_slot: ThreadSlot::new(options.stack_bytes),
        slots: (0..options.max_threads)
            .map(|_| ThreadSlot::new(options.stack_bytes))
            .collect(),
    });

    STATE.store(Box::into_raw(state), Ordering::Release);

    // SAFETY: syscalls
    unsafe {
        install_capture_handler(capture_signal);
        install_handlers();
    }

    if options.capture_panics {
        super::panic::install();
    }

    Ok(())
}

unsafe fn install_capture_handler(capture_signal: i32) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = capture_signal_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;

        let _ = libc::sigaction(capture_signal, &sa, ptr::null_mut());
    }
}

unsafe fn install_handlers() {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all exception signals when we're handling one of them.
        for sig in EXCEPTION_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        // Use our signal_handler for all of the signals we wish to catch
        for sig in EXCEPTION_SIGNALS {
            // At this point it is impractical to back out changes, and so failure to
            // install a signal is intentionally ignored.
            let _ = libc::sigaction(sig, &sa, ptr::null_mut());
        }
    }
}

/// Restores all of the signal handlers back to their previous values, or the
/// default if the previous value was to ignore the signal or cannot be
/// restored
unsafe fn restore_handlers(state: &MonitorState) {
    unsafe {
        for (sig, action) in EXCEPTION_SIGNALS.into_iter().zip(state.old_handlers.iter()) {
            if action.sa_sigaction == libc::SIG_IGN
                || libc::sigaction(sig, action, ptr::null_mut()) == -1
            {
                install_default_handler(sig);
            }
        }
    }
}

/// Runs a capture outside of a fault
fn run(trigger: &Trigger<'_>) -> bool {
    let Some(state) = state() else {
        return false;
    };

    match capture::latch(capture::gettid()) {
        Latch::Acquired => {
            // SAFETY: we hold the latch
            let published = unsafe { capture::capture(state, trigger) };
            capture::unlatch();
            published
        }
        Latch::Nested | Latch::Busy => false,
    }
}

pub(super) fn simulate(signo: i32) -> bool {
    run(&Trigger::Simulated { signo })
}

pub(super) fn capture_panic(message: &str, location: Option<&str>) -> bool {
    let published = run(&Trigger::Panic { message, location });
    LAST_PANIC_TID.store(capture::gettid(), Ordering::Release);
    published
}

pub(super) fn capture_hang(tid: i32, unresponsive_ms: u64) -> bool {
    run(&Trigger::Hang {
        tid,
        unresponsive_ms,
    })
}

/// Saves errno on creation and puts it back on drop, so that the syscalls
/// made by a handler are invisible to the code it interrupted
struct PreserveErrno(i32);

#[inline]
fn errno_location() -> *mut libc::c_int {
    // SAFETY: libc call, always returns a valid thread local pointer
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                libc::__errno()
            } else {
                libc::__errno_location()
            }
        }
    }
}

impl PreserveErrno {
    #[inline]
    fn new() -> Self {
        // SAFETY: see errno_location
        Self(unsafe { *errno_location() })
    }
}

impl Drop for PreserveErrno {
    fn drop(&mut self) {
        // SAFETY: see errno_location
        unsafe { *errno_location() = self.0 };
    }
}

/// Invoked on every thread that is asked for its state during a capture
unsafe extern "C" fn capture_signal_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let _errno = PreserveErrno::new();

    let Some(state) = state() else {
        return;
    };

    let tid = capture::gettid();
    let slot = if state.own_slot.tid() == tid && state.own_slot.is_pending() {
        Some(&state.own_slot)
    } else {
        threads::slot_for(&state.slots, tid)
    };

    if let Some(slot) = slot {
        // SAFETY: uc is the context of this handler invocation
        unsafe { slot.answer(uc, state.page_size) };
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                // Reset signal handler with the correct flags.
                libc::sigemptyset(&mut cur_handler.sa_mask);
                libc::sigaddset(&mut cur_handler.sa_mask, sig);

                cur_handler.sa_sigaction = signal_handler as usize;
                cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    install_default_handler(sig);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        let info = &*info;
        let tid = capture::gettid();

        let Some(state) = state() else {
            install_default_handler(sig);
            return;
        };

        // A panic that was just captured on this thread is now aborting
        let panicked = sig == libc::SIGABRT
            && LAST_PANIC_TID.load(Ordering::Acquire) == tid
            && std::thread::panicking();

        let nested = if panicked {
            debug_print!("skipping capture of panic abort");
            false
        } else {
            match capture::latch(tid) {
                Latch::Acquired => {
                    debug_print!("capturing");
                    let trigger = Trigger::Signal {
                        signo: sig,
                        code: info.si_code,
                        address: info.si_addr() as usize as u64,
                        context: uc.cast_const(),
                    };
                    capture::capture(state, &trigger);
                    capture::unlatch();
                    false
                }
                Latch::Nested => true,
                Latch::Busy => {
                    debug_print!("gave up waiting on another capture");
                    false
                }
            }
        };

        // Upon returning from this signal handler, sig will become unmasked and
        // then it will be retriggered. A fault inside our own capture goes
        // straight to the default action, anything else goes to whatever
        // handler was installed before us.
        if nested {
            debug_print!("faulted during capture, installing default handler");
            install_default_handler(sig);
        } else {
            debug_print!("restoring handlers");
            restore_handlers(state);
        }

        debug_print!("finishing signal handler");

        if info.si_code <= 0 || sig == libc::SIGABRT || sig == libc::SIGTRAP {
            // This signal was triggered by somebody sending us the signal with kill().
            // In order to retrigger it, we have to queue a new signal by calling
            // kill() ourselves.  The special case (si_pid == 0 && sig == SIGABRT) is
            // due to the kernel sending a SIGABRT from a user request via SysRQ.
            // Breakpoint traps resume after the trapping instruction, so they
            // would not retrigger either.
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                // If we failed to kill ourselves (e.g. because a sandbox disallows us
                // to do so), we instead resort to terminating our process. This will
                // result in an incorrect exit code.
                libc::_exit(1);
            }
        } else {
            // This was a synchronous signal triggered by a hard fault (e.g. SIGSEGV).
            // No need to reissue the signal. It will automatically trigger again,
            // when we return from the signal handler.
        }
    }
}
