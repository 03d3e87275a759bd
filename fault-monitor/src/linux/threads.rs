//! Capture of threads other than the one doing the capture.
//!
//! Every thread is asked to describe itself by sending it the capture signal.
//! Its handler copies the registers from its own signal context and its stack
//! into a slot that was allocated at install time, then marks the slot ready.
//! The capturing thread only waits a bounded amount of time for this to
//! happen, a thread that is blocked with the signal masked, or that exited in
//! the meantime, is recorded as missing.

use super::{context, mem};
use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
};

const IDLE: u32 = 0;
const REQUESTED: u32 = 1;
const WRITING: u32 = 2;
const READY: u32 = 3;
/// Given up on while its thread was still writing, the thread frees it when
/// it is done
const ABANDONED: u32 = 4;

/// What a thread deposited in its slot
pub(crate) struct Deposit {
    pub(crate) registers: Option<context::Registers>,
    pub(crate) stack_base: u64,
    pub(crate) stack_len: usize,
}

pub(crate) struct ThreadSlot {
    tid: AtomicI32,
    state: AtomicU32,
    /// Requested during the capture that is running
    claimed: AtomicBool,
    deposit: UnsafeCell<Deposit>,
    stack: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the deposit and stack are only written by the thread that moved the
// slot from REQUESTED to WRITING, and only read after it has been moved to
// READY
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    pub(crate) fn new(stack_bytes: usize) -> Self {
        Self {
            tid: AtomicI32::new(0),
            state: AtomicU32::new(IDLE),
            claimed: AtomicBool::new(false),
            deposit: UnsafeCell::new(Deposit {
                registers: None,
                stack_base: 0,
                stack_len: 0,
            }),
            stack: UnsafeCell::new(vec![0u8; stack_bytes].into_boxed_slice()),
        }
    }

    #[inline]
    pub(crate) fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    /// Asks `tid` to fill this slot
    ///
    /// Returns `false` if a thread from an earlier capture is still writing
    /// into it.
    pub(crate) fn request(&self, tid: i32) -> bool {
        if self.state.load(Ordering::Acquire) != IDLE {
            return false;
        }

        self.tid.store(tid, Ordering::Release);
        self.claimed.store(true, Ordering::Release);
        self.state.store(REQUESTED, Ordering::Release);
        true
    }

    #[inline]
    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// The thread has been asked but has not finished answering
    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), REQUESTED | WRITING)
    }

    /// Withdraws the request if the thread never started answering it
    ///
    /// Returns `false` if the thread is in the middle of writing its answer.
    pub(crate) fn withdraw(&self) -> bool {
        match self
            .state
            .compare_exchange(REQUESTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state != WRITING,
        }
    }

    /// Ends the request at the end of a capture
    ///
    /// A thread that is still writing keeps the slot until it is done, the
    /// slot can't be requested again before then.
    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);

        loop {
            let (from, to) = match self.state.load(Ordering::Acquire) {
                REQUESTED => (REQUESTED, IDLE),
                WRITING => (WRITING, ABANDONED),
                READY => (READY, IDLE),
                _ => return,
            };

            if self
                .state
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if to == IDLE {
                    self.tid.store(0, Ordering::Release);
                }
                return;
            }
        }
    }

    /// The answer, only valid once [`Self::is_ready`]
    pub(crate) fn deposit(&self) -> Option<(&Deposit, &[u8])> {
        if !self.is_ready() {
            return None;
        }

        // SAFETY: READY was stored with Release after the last write
        unsafe {
            let deposit = &*self.deposit.get();
            let stack = &*self.stack.get();
            Some((deposit, &stack[..deposit.stack_len.min(stack.len())]))
        }
    }

    /// Called from the capture signal handler of the requested thread
    ///
    /// # Safety
    ///
    /// `uc` must be the context passed to the signal handler
    pub(crate) unsafe fn answer(&self, uc: *const libc::c_void, page_size: usize) {
        if self
            .state
            .compare_exchange(REQUESTED, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // SAFETY: we own the slot while it is WRITING
        unsafe {
            let deposit = &mut *self.deposit.get();
            let stack = &mut *self.stack.get();

            deposit.registers = context::registers(uc);
            match &deposit.registers {
                Some(regs) => {
                    deposit.stack_base = regs.stack_start();
                    deposit.stack_len = mem::read(deposit.stack_base, stack, page_size);
                }
                None => {
                    deposit.stack_base = 0;
                    deposit.stack_len = 0;
                }
            }
        }

        self.finish_answer();
    }

    fn finish_answer(&self) {
        if self
            .state
            .compare_exchange(WRITING, READY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // The capture gave up on us
            self.state.store(IDLE, Ordering::Release);
        }
    }
}

/// Finds the slot requested from `tid`
pub(crate) fn slot_for(slots: &[ThreadSlot], tid: i32) -> Option<&ThreadSlot> {
    slots
        .iter()
        .find(|slot| slot.tid() == tid && slot.state.load(Ordering::Acquire) == REQUESTED)
}

/// Calls `f` with the id of every thread in the process, using `buf` to read
/// directory entries into
///
/// Returns `false` if the task list could not be read.
pub(crate) fn for_each_task(buf: &mut [u8], mut f: impl FnMut(i32)) -> bool {
    // SAFETY: syscalls
    let fd = unsafe {
        libc::open(
            c"/proc/self/task".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return false;
    }

    loop {
        // SAFETY: syscall, buf is valid for its length
        let read = unsafe {
            libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len())
        };
        if read <= 0 {
            break;
        }

        let mut offset = 0;
        let read = read as usize;
        while offset < read {
            let Some(dirent) = parse_dirent(&buf[offset..read]) else {
                break;
            };
            if let Some(tid) = dirent.tid {
                f(tid);
            }
            offset += dirent.reclen;
        }
    }

    // SAFETY: syscall
    unsafe { libc::close(fd) };
    true
}

struct Dirent {
    reclen: usize,
    tid: Option<i32>,
}

/// Parses a `linux_dirent64`, `{ d_ino: u64, d_off: i64, d_reclen: u16,
/// d_type: u8, d_name: [u8] }`
fn parse_dirent(buf: &[u8]) -> Option<Dirent> {
    const NAME_OFFSET: usize = 19;

    let reclen = u16::from_ne_bytes([*buf.get(16)?, *buf.get(17)?]) as usize;
    if reclen < NAME_OFFSET || reclen > buf.len() {
        return None;
    }

    let name = &buf[NAME_OFFSET..reclen];
    let name = &name[..name.iter().position(|b| *b == 0).unwrap_or(name.len())];

    Some(Dirent {
        reclen,
        tid: parse_tid(name),
    })
}

fn parse_tid(name: &[u8]) -> Option<i32> {
    if name.is_empty() || name.len() > 10 {
        return None;
    }

    let mut tid = 0i64;
    for b in name {
        if !b.is_ascii_digit() {
            return None;
        }
        tid = tid * 10 + i64::from(b - b'0');
    }

    i32::try_from(tid).ok().filter(|tid| *tid > 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tids() {
        assert_eq!(parse_tid(b"1234"), Some(1234));
        assert_eq!(parse_tid(b"."), None);
        assert_eq!(parse_tid(b".."), None);
        assert_eq!(parse_tid(b"0"), None);
        assert_eq!(parse_tid(b"99999999999"), None);
    }

    #[test]
    fn enumerates_own_threads() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let jh = std::thread::spawn(move || {
            // SAFETY: syscall
            let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
            tx.send(tid).unwrap();
            let _ = done_rx.recv();
        });

        let other = rx.recv().unwrap();
        // SAFETY: syscall
        let me = unsafe { libc::syscall(libc::SYS_gettid) } as i32;

        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        assert!(for_each_task(&mut buf, |tid| seen.push(tid)));

        assert!(seen.contains(&me));
        assert!(seen.contains(&other));

        done_tx.send(()).unwrap();
        jh.join().unwrap();
    }

    #[test]
    fn slot_handshake() {
        let slot = ThreadSlot::new(64);
        assert!(slot.deposit().is_none());

        assert!(slot.request(42));
        assert!(slot.is_claimed());
        assert!(slot_for(std::slice::from_ref(&slot), 42).is_some());
        assert!(slot_for(std::slice::from_ref(&slot), 43).is_none());

        // A thread that never answers
        assert!(slot.withdraw());
        assert!(slot_for(std::slice::from_ref(&slot), 42).is_none());

        // SAFETY: a null context is allowed
        unsafe { slot.answer(std::ptr::null(), 4096) };
        assert!(!slot.is_ready(), "a withdrawn request must not be answered");

        assert!(slot.request(42));
        // SAFETY: as above
        unsafe { slot.answer(std::ptr::null(), 4096) };
        let (deposit, stack) = slot.deposit().unwrap();
        assert!(deposit.registers.is_none());
        assert!(stack.is_empty());

        slot.release();
        assert_eq!(slot.tid(), 0);
        assert!(!slot.is_claimed());
    }

    #[test]
    fn late_answer_keeps_slot() {
        let slot = ThreadSlot::new(64);
        assert!(slot.request(7));

        // The thread started answering, but the capture has moved on
        slot.state.store(WRITING, Ordering::Release);
        slot.release();
        assert!(!slot.is_claimed());
        assert!(!slot.request(8), "a slot being written must not be handed out");
        assert!(slot_for(std::slice::from_ref(&slot), 7).is_none());

        // The late answer finishes, which frees the slot without publishing
        slot.finish_answer();
        assert!(!slot.is_ready());
        assert!(slot.deposit().is_none());
        assert!(slot.request(8));
        assert_eq!(slot.tid(), 8);
    }
}
