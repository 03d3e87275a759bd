//! Discovery of the files mapped into the process, and their GNU build ids.

use super::mem;
use scroll::{LE, Pread};

/// A file mapped at offset 0, the whole range the file is mapped over
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Image<'maps> {
    pub(crate) base: u64,
    pub(crate) end: u64,
    pub(crate) path: &'maps [u8],
}

/// Reads `/proc/self/maps` into `buf`
///
/// Returns the number of bytes that hold complete lines, and whether the
/// whole file fit.
pub(crate) fn read_maps(buf: &mut [u8]) -> Option<(usize, bool)> {
    // SAFETY: syscalls
    let fd = unsafe { libc::open(c"/proc/self/maps".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }

    let mut len = 0;
    let mut complete = false;
    while len < buf.len() {
        // SAFETY: syscall, the remaining part of buf is valid
        let read = unsafe { libc::read(fd, buf[len..].as_mut_ptr().cast(), buf.len() - len) };
        if read < 0 {
            break;
        }
        if read == 0 {
            complete = true;
            break;
        }
        len += read as usize;
    }

    // SAFETY: syscall
    unsafe { libc::close(fd) };

    if !complete {
        // Drop the partial line at the end
        len = buf[..len].iter().rposition(|b| *b == b'\n').map_or(0, |nl| nl + 1);
    }

    Some((len, complete))
}

/// Calls `f` for every file-backed image in `maps`, a `/proc/self/maps`
/// listing, merging the consecutive mappings of the same file
///
/// `f` returns `false` to stop the iteration.
pub(crate) fn for_each_image<'maps>(maps: &'maps [u8], mut f: impl FnMut(&Image<'maps>) -> bool) {
    let mut current: Option<Image<'maps>> = None;

    for line in maps.split(|b| *b == b'\n') {
        let Some(mapping) = parse_line(line) else {
            continue;
        };

        if let Some(cur) = &mut current {
            if cur.path == mapping.path && mapping.offset != 0 {
                cur.end = cur.end.max(mapping.end);
                continue;
            }
        }

        if let Some(done) = current.take() {
            if !f(&done) {
                return;
            }
        }

        if mapping.offset == 0 && mapping.path.first() == Some(&b'/') {
            current = Some(Image {
                base: mapping.start,
                end: mapping.end,
                path: mapping.path,
            });
        }
    }

    if let Some(done) = current {
        f(&done);
    }
}

struct Mapping<'maps> {
    start: u64,
    end: u64,
    offset: u64,
    path: &'maps [u8],
}

/// `start-end perms offset dev inode path`
fn parse_line(line: &[u8]) -> Option<Mapping<'_>> {
    let mut fields = line.splitn(6, |b| *b == b' ');

    let range = fields.next()?;
    let dash = range.iter().position(|b| *b == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;

    let _perms = fields.next()?;
    let offset = parse_hex(fields.next()?)?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    let path = fields.next().unwrap_or_default();
    let skip = path.iter().position(|b| *b != b' ').unwrap_or(path.len());

    Some(Mapping {
        start,
        end,
        offset,
        path: &path[skip..],
    })
}

fn parse_hex(s: &[u8]) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }

    s.iter().try_fold(0u64, |acc, b| {
        let digit = (*b as char).to_digit(16)?;
        Some((acc << 4) | u64::from(digit))
    })
}

const PT_NOTE: u32 = 4;
const ET_EXEC: u16 = 2;
const NT_GNU_BUILD_ID: u32 = 3;

/// Reads the `NT_GNU_BUILD_ID` note of the ELF image mapped at `base` into
/// `out`, returning its length
///
/// Everything is read through [`mem::read`], so a corrupt or partially
/// mapped image yields no build id rather than a fault.
pub(crate) fn build_id(base: u64, out: &mut [u8], page_size: usize) -> usize {
    let mut ehdr = [0u8; 64];
    if mem::read(base, &mut ehdr, page_size) < 52 || ehdr[..4] != *b"\x7fELF" {
        return 0;
    }

    let is_64 = ehdr[4] == 2;
    let Ok(e_type) = ehdr.pread_with::<u16>(16, LE) else {
        return 0;
    };

    let phdrs = if is_64 {
        (
            ehdr.pread_with::<u64>(0x20, LE).ok(),
            ehdr.pread_with::<u16>(0x36, LE).ok(),
            ehdr.pread_with::<u16>(0x38, LE).ok(),
        )
    } else {
        (
            ehdr.pread_with::<u32>(0x1c, LE).ok().map(u64::from),
            ehdr.pread_with::<u16>(0x2a, LE).ok(),
            ehdr.pread_with::<u16>(0x2c, LE).ok(),
        )
    };
    let (Some(phoff), Some(phentsize), Some(phnum)) = phdrs else {
        return 0;
    };

    // Shared objects and PIE executables have addresses relative to where
    // they are loaded
    let bias = if e_type == ET_EXEC { 0 } else { base };

    let Some(phdrs_at) = base.checked_add(phoff) else {
        return 0;
    };

    for i in 0..u64::from(phnum) {
        let mut phdr = [0u8; 56];
        let Some(at) = i
            .checked_mul(u64::from(phentsize))
            .and_then(|offset| phdrs_at.checked_add(offset))
        else {
            return 0;
        };
        let want = usize::from(phentsize).min(phdr.len());
        if mem::read(at, &mut phdr[..want], page_size) < want {
            return 0;
        }

        let segment = if is_64 {
            (
                phdr.pread_with::<u32>(0, LE).ok(),
                phdr.pread_with::<u64>(16, LE).ok(),
                phdr.pread_with::<u64>(32, LE).ok(),
            )
        } else {
            (
                phdr.pread_with::<u32>(0, LE).ok(),
                phdr.pread_with::<u32>(8, LE).ok().map(u64::from),
                phdr.pread_with::<u32>(16, LE).ok().map(u64::from),
            )
        };
        let (Some(PT_NOTE), Some(vaddr), Some(filesz)) = segment else {
            continue;
        };

        let Some(notes_at) = bias.checked_add(vaddr) else {
            continue;
        };

        let mut notes = [0u8; 512];
        let want = usize::try_from(filesz).map_or(notes.len(), |len| len.min(notes.len()));
        let read = mem::read(notes_at, &mut notes[..want], page_size);

        let len = find_build_id(&notes[..read], out);
        if len > 0 {
            return len;
        }
    }

    0
}

/// Scans a note segment for the GNU build id
fn find_build_id(notes: &[u8], out: &mut [u8]) -> usize {
    fn align4(n: usize) -> Option<usize> {
        Some(n.checked_add(3)? & !3)
    }

    let mut offset = 0;
    while offset + 12 <= notes.len() {
        let (Ok(namesz), Ok(descsz), Ok(kind)) = (
            notes.pread_with::<u32>(offset, LE),
            notes.pread_with::<u32>(offset + 4, LE),
            notes.pread_with::<u32>(offset + 8, LE),
        ) else {
            return 0;
        };

        let name_start = offset + 12;
        let bounds = align4(namesz as usize)
            .and_then(|name_len| name_start.checked_add(name_len))
            .and_then(|desc_start| Some((desc_start, desc_start.checked_add(descsz as usize)?)));
        let Some((desc_start, desc_end)) = bounds.filter(|(_, end)| *end <= notes.len()) else {
            return 0;
        };

        if kind == NT_GNU_BUILD_ID && notes.get(name_start..name_start + 4) == Some(&b"GNU\0"[..]) {
            let len = (descsz as usize).min(out.len());
            out[..len].copy_from_slice(&notes[desc_start..desc_start + len]);
            return len;
        }

        match align4(descsz as usize).and_then(|desc_len| desc_start.checked_add(desc_len)) {
            Some(next) => offset = next,
            None => return 0,
        }
    }

    0
}

#[cfg(test)]
mod test {
    use super::*;

    const MAPS: &[u8] = b"\
55d4c8a00000-55d4c8a02000 r--p 00000000 08:01 1311 /usr/bin/game
55d4c8a02000-55d4c8a08000 r-xp 00002000 08:01 1311 /usr/bin/game
55d4c8a08000-55d4c8a0a000 rw-p 00008000 08:01 1311 /usr/bin/game
55d4c9000000-55d4c9021000 rw-p 00000000 00:00 0    [heap]
7f1e2a000000-7f1e2a028000 r--p 00000000 08:01 2211 /usr/lib/libc.so.6
7f1e2a028000-7f1e2a1bd000 r-xp 00028000 08:01 2211 /usr/lib/libc.so.6
7f1e2a300000-7f1e2a301000 rw-p 00000000 00:00 0
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0    [stack]
";

    #[test]
    fn merges_mappings() {
        let mut images = Vec::new();
        for_each_image(MAPS, |img| {
            images.push((img.base, img.end, img.path.to_vec()));
            true
        });

        assert_eq!(
            images,
            [
                (0x55d4c8a00000, 0x55d4c8a0a000, b"/usr/bin/game".to_vec()),
                (0x7f1e2a000000, 0x7f1e2a1bd000, b"/usr/lib/libc.so.6".to_vec()),
            ]
        );
    }

    #[test]
    fn stops_early() {
        let mut count = 0;
        for_each_image(MAPS, |_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn note_parsing() {
        let mut notes = Vec::new();
        // An unrelated note first
        notes.extend_from_slice(&4u32.to_le_bytes());
        notes.extend_from_slice(&4u32.to_le_bytes());
        notes.extend_from_slice(&1u32.to_le_bytes());
        notes.extend_from_slice(b"GNU\0");
        notes.extend_from_slice(&[0; 4]);
        // The build id
        notes.extend_from_slice(&4u32.to_le_bytes());
        notes.extend_from_slice(&6u32.to_le_bytes());
        notes.extend_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
        notes.extend_from_slice(b"GNU\0");
        notes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 0, 0]);

        let mut out = [0u8; 32];
        let len = find_build_id(&notes, &mut out);
        assert_eq!(&out[..len], &[1, 2, 3, 4, 5, 6]);
    }

    /// An ELF header whose program headers are nowhere near it
    fn corrupt_header(phoff: u64, phentsize: u16, phnum: u16) -> [u8; 64] {
        let mut ehdr = [0u8; 64];
        ehdr[..4].copy_from_slice(b"\x7fELF");
        ehdr[4] = 2;
        ehdr[16..18].copy_from_slice(&3u16.to_le_bytes());
        ehdr[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        ehdr[0x36..0x38].copy_from_slice(&phentsize.to_le_bytes());
        ehdr[0x38..0x3a].copy_from_slice(&phnum.to_le_bytes());
        ehdr
    }

    #[test]
    fn corrupt_headers_have_no_build_id() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut out = [0u8; 64];

        for (phoff, phentsize, phnum) in [
            (u64::MAX, 56, 1),
            (u64::MAX - 8, 56, 4),
            (1 << 62, 56, 2),
        ] {
            let ehdr = corrupt_header(phoff, phentsize, phnum);
            let base = ehdr.as_ptr() as u64;
            assert_eq!(build_id(base, &mut out, page_size), 0, "{phoff:#x}");
        }

        assert_eq!(build_id(u64::MAX - 16, &mut out, page_size), 0);
    }

    #[test]
    fn corrupt_notes() {
        let mut notes = Vec::new();
        notes.extend_from_slice(&u32::MAX.to_le_bytes());
        notes.extend_from_slice(&u32::MAX.to_le_bytes());
        notes.extend_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
        notes.extend_from_slice(b"GNU\0");

        let mut out = [0u8; 32];
        assert_eq!(find_build_id(&notes, &mut out), 0);
    }

    #[test]
    fn own_images_have_build_ids() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut buf = vec![0u8; 1024 * 1024];
        let (len, _complete) = read_maps(&mut buf).unwrap();

        let mut found = 0;
        let mut with_id = 0;
        for_each_image(&buf[..len], |img| {
            found += 1;
            let mut id = [0u8; 64];
            if build_id(img.base, &mut id, page_size) > 0 {
                with_id += 1;
            }
            true
        });

        assert!(found > 0);
        // Distribution libraries are always built with build ids
        assert!(with_id > 0);
    }
}
