//! The capture itself.
//!
//! Everything in here can run inside a signal handler of a thread that just
//! faulted, so it only uses memory allocated by [`super::state::install`],
//! raw syscalls, and bounded waits. No heap allocation, no locks.

use super::{
    context::{self, Registers},
    images, mem,
    state::{Buffers, MonitorState},
    threads::{self, ThreadSlot},
};
use crash_snapshot::{
    Degradation,
    raw::{FaultKind, RawHeader, RawWriter, tag, thread_flags},
};
use std::{
    ffi::c_void,
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

/// What caused a capture
pub(crate) enum Trigger<'a> {
    /// A signal caught by our handler, `context` is the `ucontext_t` of the
    /// faulting thread
    Signal {
        signo: i32,
        code: i32,
        address: u64,
        context: *const c_void,
    },
    /// A capture requested by the process itself
    Simulated { signo: i32 },
    Panic {
        message: &'a str,
        location: Option<&'a str>,
    },
    /// `tid` stopped sending heartbeats to its watchdog
    Hang { tid: i32, unresponsive_ms: u64 },
}

/// `si_code` of a signal sent with `kill`
pub(crate) const SI_USER: i32 = 0;

/// The thread currently running a capture, 0 when there is none
static CAPTURING_TID: AtomicI32 = AtomicI32::new(0);

/// How long a thread waits for a capture running on another thread to finish
const LATCH_WAIT: Duration = Duration::from_secs(5);

pub(crate) enum Latch {
    Acquired,
    /// The calling thread faulted while capturing
    Nested,
    /// Another thread never finished its capture
    Busy,
}

/// Takes the single capture slot
pub(crate) fn latch(tid: i32) -> Latch {
    let mut waited = Duration::ZERO;
    loop {
        match CAPTURING_TID.compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Latch::Acquired,
            Err(current) if current == tid => return Latch::Nested,
            Err(_) if waited >= LATCH_WAIT => return Latch::Busy,
            Err(_) => {
                sleep(Duration::from_millis(1));
                waited += Duration::from_millis(1);
            }
        }
    }
}

#[inline]
pub(crate) fn unlatch() {
    CAPTURING_TID.store(0, Ordering::Release);
}

#[inline]
pub(crate) fn gettid() -> i32 {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[inline]
fn tgkill(tid: i32, sig: i32) -> bool {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) == 0 }
}

fn sleep(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as _,
        tv_nsec: duration.subsec_nanos() as _,
    };
    // SAFETY: syscall, an interrupted sleep is just a shorter one
    unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
}

fn clock(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: syscall
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts
}

fn monotonic() -> Duration {
    let ts = clock(libc::CLOCK_MONOTONIC);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// A v4 uuid from the kernel's random pool, or from whatever entropy is at
/// hand if that fails
fn new_id() -> uuid::Uuid {
    const GRND_NONBLOCK: u32 = 1;

    let mut bytes = [0u8; 16];
    // SAFETY: syscall, bytes is valid for 16 bytes
    let got = unsafe {
        libc::syscall(
            libc::SYS_getrandom,
            bytes.as_mut_ptr(),
            bytes.len(),
            GRND_NONBLOCK,
        )
    };

    if got != bytes.len() as libc::c_long {
        let now = clock(libc::CLOCK_REALTIME);
        let mut seed = (now.tv_sec as u64) ^ ((now.tv_nsec as u64) << 32)
            ^ (u64::from(std::process::id()) << 16)
            ^ gettid() as u64;

        // splitmix64
        for chunk in bytes.chunks_mut(8) {
            seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
        }
    }

    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Where the stack of a thread comes from
enum Stack<'a> {
    /// Read straight from the thread's stack, only valid for the thread that
    /// is doing the capture
    Live,
    /// Copied by the thread itself when it answered the capture signal
    Copied(&'a [u8]),
}

fn write_thread(
    w: &mut RawWriter<'_>,
    tid: i32,
    crashed: bool,
    regs: Option<&Registers>,
    stack_base: u64,
    stack: Stack<'_>,
    state: &MonitorState,
) {
    let mut flags = if crashed { thread_flags::CRASHED } else { 0 };
    if regs.is_none() {
        flags |= thread_flags::REGISTERS_MISSING;
        w.flag(Degradation::MISSING_REGISTERS);
    }

    let (pc, sp) = regs.map_or((0, 0), |r| (r.pc, r.sp));
    let values = regs.map_or(&[][..], |r| r.values());

    if !(w.begin(tag::THREAD) && w.put(tid)) {
        w.commit();
        return;
    }

    let flags_at = w.position();
    let ok = w.put(flags)
        && w.put(pc)
        && w.put(sp)
        && w.put(values.len() as u16)
        && values.iter().all(|v| w.put(*v))
        && w.put(stack_base);
    let len_at = w.position();
    if !(ok && w.put(0u32)) {
        w.commit();
        return;
    }

    let spare = w.spare();
    let max = spare.len().min(state.stack_bytes);
    let (read, wanted) = match stack {
        Stack::Live if regs.is_some() => (
            mem::read(stack_base, &mut spare[..max], state.page_size),
            max,
        ),
        Stack::Live => (0, 0),
        Stack::Copied(bytes) => {
            let n = bytes.len().min(max);
            spare[..n].copy_from_slice(&bytes[..n]);
            (n, bytes.len())
        }
    };
    w.advance(read);

    if read == 0 {
        flags |= thread_flags::STACK_UNREADABLE;
        w.flag(Degradation::STACK_UNREADABLE);
        w.patch_u32(flags_at, flags);
    } else if read < wanted && max < state.stack_bytes {
        // Out of room rather than out of stack
        w.flag(Degradation::TRUNCATED);
    }

    w.patch_u32(len_at, read as u32);
    w.commit();
}

fn write_slot(w: &mut RawWriter<'_>, slot: &ThreadSlot, crashed: bool, state: &MonitorState) -> bool {
    let tid = slot.tid();
    match slot.deposit() {
        Some((deposit, stack)) => {
            write_thread(
                w,
                tid,
                crashed,
                deposit.registers.as_ref(),
                deposit.stack_base,
                Stack::Copied(stack),
                state,
            );
            true
        }
        None => {
            slot.withdraw();
            w.missing_thread(tid);
            false
        }
    }
}

/// Asks every requested slot's thread to answer, and waits for them
fn collect(slots: &[ThreadSlot], capture_signal: i32, timeout: Duration) {
    for slot in slots.iter().filter(|slot| slot.is_claimed()) {
        if !tgkill(slot.tid(), capture_signal) {
            // Most likely exited since it was listed
            slot.withdraw();
        }
    }

    let deadline = monotonic() + timeout;
    while slots.iter().any(ThreadSlot::is_pending) && monotonic() < deadline {
        sleep(Duration::from_millis(1));
    }
}

/// Answers the capture signal on the calling thread, which the kernel does
/// before `tgkill` returns
fn collect_self(state: &MonitorState, tid: i32) -> bool {
    state.own_slot.request(tid)
        && tgkill(tid, state.capture_signal)
        && state.own_slot.is_ready()
}

/// Captures the process and publishes the capture
///
/// Returns `true` if the capture was published.
///
/// # Safety
///
/// The caller must hold the [`latch`], and for [`Trigger::Signal`] the
/// context must be the one passed to the signal handler.
pub(crate) unsafe fn capture(state: &MonitorState, trigger: &Trigger<'_>) -> bool {
    let tid = gettid();

    // SAFETY: the buffers are only ever touched by the latch holder
    let Buffers {
        capture,
        maps,
        dirents,
    } = unsafe { &mut *state.buffers.get() };

    let Some(mut w) = RawWriter::new(capture) else {
        return false;
    };

    let id = new_id();
    let now = clock(libc::CLOCK_REALTIME);

    let mut header = RawHeader {
        id: *id.as_bytes(),
        secs: now.tv_sec as i64,
        nanos: now.tv_nsec as u32,
        pid: std::process::id(),
        crashed_tid: tid,
        ..Default::default()
    };

    match *trigger {
        Trigger::Signal {
            signo,
            code,
            address,
            ..
        } => {
            header.kind = FaultKind::Signal as u8;
            header.signo = signo;
            header.code = code;
            header.address = address;
        }
        Trigger::Simulated { signo } => {
            header.kind = FaultKind::Signal as u8;
            header.signo = signo;
            header.code = SI_USER;
        }
        Trigger::Panic { .. } => header.kind = FaultKind::Panic as u8,
        Trigger::Hang { tid: watched, .. } => {
            header.kind = FaultKind::Hang as u8;
            header.crashed_tid = watched;
        }
    }

    if !w.header(&header) {
        return false;
    }
    debug_print!("wrote header");

    if !w.section(tag::METADATA, &state.metadata) {
        w.flag(Degradation::METADATA_MISSING);
    }

    // The crashed thread goes first, unless it's a hung thread, which has to
    // be asked for its state like every other thread
    match trigger {
        Trigger::Signal { context, .. } => {
            // SAFETY: guaranteed by the caller
            let regs = unsafe { context::registers(*context) };
            let stack_base = regs.as_ref().map_or(0, Registers::stack_start);
            write_thread(&mut w, tid, true, regs.as_ref(), stack_base, Stack::Live, state);
        }
        Trigger::Simulated { .. } | Trigger::Panic { .. } => {
            if collect_self(state, tid) {
                write_slot(&mut w, &state.own_slot, true, state);
            } else {
                state.own_slot.withdraw();
                write_thread(&mut w, tid, true, None, 0, Stack::Live, state);
            }
            state.own_slot.release();
        }
        Trigger::Hang { .. } => {}
    }
    debug_print!("wrote crashed thread");

    let crashed_tid = header.crashed_tid;
    let is_hang = matches!(trigger, Trigger::Hang { .. });
    let mut next = 0;
    let mut missing = false;
    let listed = threads::for_each_task(dirents, |other| {
        if other == tid {
            return;
        }

        while let Some(slot) = state.slots.get(next) {
            next += 1;
            if slot.request(other) {
                return;
            }
        }

        // Out of slots, a hung thread is written as missing once below
        if !(is_hang && other == crashed_tid) {
            w.missing_thread(other);
        }
        missing = true;
    });
    if !listed {
        missing = true;
    }

    let slots = &state.slots[..next];
    collect(slots, state.capture_signal, state.thread_capture_timeout);
    debug_print!("collected threads");

    let requested = || slots.iter().filter(|slot| slot.is_claimed());

    if let Some(hung) = requested().find(|slot| slot.tid() == crashed_tid) {
        missing |= !write_slot(&mut w, hung, true, state);
    } else if is_hang {
        w.missing_thread(crashed_tid);
        missing = true;
    }

    for slot in requested().filter(|slot| slot.tid() != crashed_tid) {
        missing |= !write_slot(&mut w, slot, false, state);
    }
    for slot in slots {
        slot.release();
    }

    if missing {
        w.flag(Degradation::THREADS_MISSING);
    }

    match images::read_maps(maps) {
        Some((len, complete)) => {
            if !complete {
                w.flag(Degradation::IMAGES_TRUNCATED);
            }

            let mut build_id = [0u8; 64];
            images::for_each_image(&maps[..len], |image| {
                let id_len = images::build_id(image.base, &mut build_id, state.page_size);
                if w.image(image.base, image.end, &build_id[..id_len], image.path) {
                    true
                } else {
                    w.flag(Degradation::IMAGES_TRUNCATED);
                    false
                }
            });
        }
        None => w.flag(Degradation::IMAGES_TRUNCATED),
    }
    debug_print!("wrote images");

    match *trigger {
        Trigger::Panic { message, location } => {
            w.message(message, location);
        }
        Trigger::Hang {
            unresponsive_ms, ..
        } => {
            w.hang(unresponsive_ms);
        }
        _ => {}
    }

    let len = w.finish();
    let published = publish(state.captures_dir, &id, &capture[..len]);
    if published {
        debug_print!("published capture");
    } else {
        debug_print!("failed to publish capture");
    }
    published
}

/// Builds a nul terminated `<uuid><suffix>` file name
fn file_name<'n>(buf: &'n mut [u8; 64], id: &str, suffix: &str) -> &'n [u8] {
    let len = id.len() + suffix.len();
    buf[..id.len()].copy_from_slice(id.as_bytes());
    buf[id.len()..len].copy_from_slice(suffix.as_bytes());
    buf[len] = 0;
    &buf[..=len]
}

/// Writes the capture to a temporary file in the captures directory, and
/// renames it to `<uuid>.capture` once it is durable
fn publish(dir: i32, id: &uuid::Uuid, bytes: &[u8]) -> bool {
    let mut encoded = [0u8; uuid::fmt::Hyphenated::LENGTH];
    let id = id.hyphenated().encode_lower(&mut encoded);

    let mut tmp = [0u8; 64];
    let mut fin = [0u8; 64];
    let tmp = file_name(&mut tmp, id, ".tmp");
    let fin = file_name(&mut fin, id, ".capture");

    // SAFETY: syscalls, the names are nul terminated
    unsafe {
        let fd = libc::openat(
            dir,
            tmp.as_ptr().cast(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        );
        if fd < 0 {
            return false;
        }

        let mut written = 0;
        while written < bytes.len() {
            let res = libc::write(
                fd,
                bytes[written..].as_ptr().cast(),
                bytes.len() - written,
            );
            if res < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
            written += res as usize;
        }

        let durable = written == bytes.len() && libc::fsync(fd) == 0;
        libc::close(fd);

        if !durable || libc::renameat(dir, tmp.as_ptr().cast(), dir, fin.as_ptr().cast()) != 0 {
            libc::unlinkat(dir, tmp.as_ptr().cast(), 0);
            return false;
        }

        libc::fsync(dir);
    }

    true
}
