//! Register extraction from the `ucontext_t` the kernel passes to a signal
//! handler.
//!
//! We use our own layouts rather than libc's as libc's differ between glibc,
//! musl, and bionic, even though the context received from a signal only
//! depends on the architecture. Only the prefix up to and including the
//! general purpose registers is described.

#![allow(non_camel_case_types, dead_code)]

use std::ffi::c_void;

/// The most registers recorded for a thread on any supported architecture
pub(crate) const MAX_REGS: usize = 34;

#[derive(Copy, Clone)]
pub(crate) struct Registers {
    pub(crate) pc: u64,
    pub(crate) sp: u64,
    values: [u64; MAX_REGS],
    count: usize,
}

impl Registers {
    #[inline]
    pub(crate) fn values(&self) -> &[u64] {
        &self.values[..self.count]
    }

    /// The lowest address of the stack worth capturing, which includes the
    /// red zone below the stack pointer where one exists
    #[inline]
    pub(crate) fn stack_start(&self) -> u64 {
        self.sp.saturating_sub(RED_ZONE)
    }
}

#[repr(C)]
struct stack_t {
    ss_sp: *mut c_void,
    ss_flags: i32,
    ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const RED_ZONE: u64 = 128;

        #[repr(C)]
        struct ucontext_t {
            uc_flags: u64,
            uc_link: *mut c_void,
            uc_stack: stack_t,
            gregs: [u64; 23],
        }

        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;
        /// r8-r15, rdi, rsi, rbp, rbx, rdx, rax, rcx, rsp, rip, eflags
        const GREGS: usize = 18;

        fn extract(uc: &ucontext_t) -> Option<Registers> {
            let mut values = [0; MAX_REGS];
            values[..GREGS].copy_from_slice(&uc.gregs[..GREGS]);

            Some(Registers {
                pc: uc.gregs[REG_RIP],
                sp: uc.gregs[REG_RSP],
                values,
                count: GREGS,
            })
        }
    } else if #[cfg(target_arch = "aarch64")] {
        const RED_ZONE: u64 = 0;

        #[repr(C, align(16))]
        struct sigcontext {
            fault_address: u64,
            regs: [u64; 31],
            sp: u64,
            pc: u64,
            pstate: u64,
        }

        #[repr(C)]
        struct ucontext_t {
            uc_flags: u64,
            uc_link: *mut c_void,
            uc_stack: stack_t,
            /// The kernel's sigset_t is padded to 1024 bits
            uc_sigmask: [u64; 16],
            uc_mcontext: sigcontext,
        }

        fn extract(uc: &ucontext_t) -> Option<Registers> {
            let mc = &uc.uc_mcontext;
            let mut values = [0; MAX_REGS];
            values[..31].copy_from_slice(&mc.regs);
            values[31] = mc.sp;
            values[32] = mc.pc;
            values[33] = mc.pstate;

            Some(Registers {
                pc: mc.pc,
                sp: mc.sp,
                values,
                count: 34,
            })
        }
    } else if #[cfg(target_arch = "x86")] {
        const RED_ZONE: u64 = 0;

        #[repr(C)]
        struct ucontext_t {
            uc_flags: u32,
            uc_link: *mut c_void,
            uc_stack: stack_t,
            gregs: [u32; 19],
        }

        const REG_ESP: usize = 7;
        const REG_EIP: usize = 14;

        fn extract(uc: &ucontext_t) -> Option<Registers> {
            let mut values = [0; MAX_REGS];
            for (value, reg) in values.iter_mut().zip(uc.gregs.iter()) {
                *value = u64::from(*reg);
            }

            Some(Registers {
                pc: u64::from(uc.gregs[REG_EIP]),
                sp: u64::from(uc.gregs[REG_ESP]),
                values,
                count: 19,
            })
        }
    } else if #[cfg(target_arch = "arm")] {
        const RED_ZONE: u64 = 0;

        #[repr(C)]
        struct ucontext_t {
            uc_flags: u32,
            uc_link: *mut c_void,
            uc_stack: stack_t,
            trap_no: u32,
            error_code: u32,
            oldmask: u32,
            /// r0-r10, fp, ip, sp, lr, pc, cpsr
            regs: [u32; 17],
        }

        fn extract(uc: &ucontext_t) -> Option<Registers> {
            let mut values = [0; MAX_REGS];
            for (value, reg) in values.iter_mut().zip(uc.regs.iter()) {
                *value = u64::from(*reg);
            }

            Some(Registers {
                pc: u64::from(uc.regs[15]),
                sp: u64::from(uc.regs[13]),
                values,
                count: 17,
            })
        }
    } else {
        const RED_ZONE: u64 = 0;

        struct ucontext_t;

        fn extract(_uc: &ucontext_t) -> Option<Registers> {
            None
        }
    }
}

/// Reads the registers from the context passed to a `SA_SIGINFO` handler
///
/// # Safety
///
/// `uc` must be null or point to a valid `ucontext_t`
pub(crate) unsafe fn registers(uc: *const c_void) -> Option<Registers> {
    if uc.is_null() {
        return None;
    }

    // SAFETY: guaranteed by the caller
    unsafe { extract(&*uc.cast::<ucontext_t>()) }
}
