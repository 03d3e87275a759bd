//! Reads of our own memory that can't fault.
//!
//! `process_vm_readv` on our own pid behaves like a `memcpy` that reports
//! `EFAULT` instead of raising `SIGSEGV`, which is exactly what is needed when
//! walking stacks and mapped images of a process that is already in trouble.

/// Reads as much of `[addr, addr + out.len())` as is readable, one page at a
/// time, stopping at the first page that can't be read
///
/// Returns the number of bytes read.
pub(crate) fn read(addr: u64, out: &mut [u8], page_size: usize) -> usize {
    let page_size = page_size.max(1) as u64;
    let mut read = 0;

    while read < out.len() {
        let Some(cur) = addr.checked_add(read as u64) else {
            break;
        };
        let to_page_end = (page_size - (cur % page_size)) as usize;
        let chunk = to_page_end.min(out.len() - read);

        let copied = read_exact(cur, &mut out[read..read + chunk]);
        read += copied;
        if copied < chunk {
            break;
        }
    }

    read
}

/// A single `process_vm_readv`, returns the number of bytes copied
pub(crate) fn read_exact(addr: u64, out: &mut [u8]) -> usize {
    if out.is_empty() || addr == 0 {
        return 0;
    }

    let local = libc::iovec {
        iov_base: out.as_mut_ptr().cast(),
        iov_len: out.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as usize as *mut libc::c_void,
        iov_len: out.len(),
    };

    // SAFETY: syscall, both iovecs describe valid ranges from our point of
    // view and the kernel validates the remote one
    let copied = unsafe {
        libc::syscall(
            libc::SYS_process_vm_readv,
            libc::getpid(),
            &local as *const libc::iovec,
            1usize,
            &remote as *const libc::iovec,
            1usize,
            0usize,
        )
    };

    if copied < 0 { 0 } else { copied as usize }
}

#[cfg(test)]
mod test {
    #[test]
    fn stops_at_unmapped_page() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        // SAFETY: syscalls
        unsafe {
            let map = libc::mmap(
                std::ptr::null_mut(),
                page_size * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(map, libc::MAP_FAILED);
            std::ptr::write_bytes(map.cast::<u8>(), 0xaa, page_size);
            assert_eq!(
                libc::mprotect(
                    map.cast::<u8>().add(page_size).cast(),
                    page_size,
                    libc::PROT_NONE
                ),
                0
            );

            let start = map as u64 + page_size as u64 - 16;
            let mut out = vec![0u8; 64];
            let read = super::read(start, &mut out, page_size);
            assert_eq!(read, 16);
            assert!(out[..16].iter().all(|b| *b == 0xaa));

            assert_eq!(super::read(0, &mut out, page_size), 0);
            assert_eq!(super::read(u64::MAX - 8, &mut out, page_size), 0);

            libc::munmap(map, page_size * 2);
        }
    }
}
