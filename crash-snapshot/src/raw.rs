//! The fault-time capture layout
//!
//! A capture is written by the fault monitor while the process is in an
//! undefined state, so the writer here only ever works on a borrowed,
//! pre-allocated buffer, never allocates, and never panics. Every write is
//! bounds checked, and running out of space drops the section being written
//! and marks the capture as [`Degradation::TRUNCATED`].
//!
//! ```text
//! "CRAW" | version: u16 | section* | END
//! section = tag: u16 | len: u32 | payload[len]
//! ```
//!
//! All integers are little endian.

use crate::{
    CrashSnapshot, Degradation, Fault, FormatError, LoadedImage, ProcessMetadata, ThreadState,
};
use scroll::{LE, Pread, Pwrite, SizeWith, ctx::TryIntoCtx};

pub const MAGIC: [u8; 4] = *b"CRAW";
pub const VERSION: u16 = 1;

/// Section tags
pub mod tag {
    pub const HEADER: u16 = 1;
    pub const METADATA: u16 = 2;
    pub const THREAD: u16 = 3;
    pub const MISSING_THREAD: u16 = 4;
    pub const IMAGE: u16 = 5;
    pub const MESSAGE: u16 = 6;
    pub const HANG: u16 = 7;
    pub const END: u16 = 0xffff;
}

/// Flags stored with each thread section
pub mod thread_flags {
    pub const CRASHED: u32 = 1 << 0;
    pub const REGISTERS_MISSING: u32 = 1 << 1;
    pub const STACK_UNREADABLE: u32 = 1 << 2;
}

const PREFIX_LEN: usize = MAGIC.len() + 2;
const SECTION_HEADER_LEN: usize = 2 + 4;
/// Space always held back so that a capture can be closed
const END_LEN: usize = SECTION_HEADER_LEN + 4;

/// The smallest buffer a [`RawWriter`] can be created over
pub const MIN_BUFFER_LEN: usize = PREFIX_LEN + END_LEN;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    Signal = 1,
    Panic = 2,
    Hang = 3,
}

impl FaultKind {
    fn from_u8(kind: u8) -> Result<Self, FormatError> {
        Ok(match kind {
            1 => Self::Signal,
            2 => Self::Panic,
            3 => Self::Hang,
            unknown => return Err(FormatError::UnknownFaultKind(unknown)),
        })
    }
}

/// The payload of the [`tag::HEADER`] section
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct RawHeader {
    pub id: [u8; 16],
    /// `CLOCK_REALTIME` at the time of the capture
    pub secs: i64,
    pub nanos: u32,
    pub pid: u32,
    /// A [`FaultKind`]
    pub kind: u8,
    pub reserved: [u8; 3],
    pub signo: i32,
    pub code: i32,
    pub address: u64,
    pub crashed_tid: i32,
}

/// Writes a capture into a borrowed buffer
pub struct RawWriter<'buf> {
    buf: &'buf mut [u8],
    pos: usize,
    /// Offset of the section currently being written
    open: Option<usize>,
    /// A write in the current section did not fit
    overflowed: bool,
    degraded: Degradation,
}

impl<'buf> RawWriter<'buf> {
    /// Starts a capture, fails only if `buf` is smaller than [`MIN_BUFFER_LEN`]
    pub fn new(buf: &'buf mut [u8]) -> Option<Self> {
        if buf.len() < MIN_BUFFER_LEN {
            return None;
        }

        buf[..MAGIC.len()].copy_from_slice(&MAGIC);
        buf.pwrite_with(VERSION, MAGIC.len(), LE).ok()?;

        Some(Self {
            buf,
            pos: PREFIX_LEN,
            open: None,
            overflowed: false,
            degraded: Degradation::empty(),
        })
    }

    #[inline]
    fn limit(&self) -> usize {
        self.buf.len() - END_LEN
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Marks the capture as incomplete in some way
    #[inline]
    pub fn flag(&mut self, d: Degradation) {
        self.degraded |= d;
    }

    #[inline]
    pub fn degraded(&self) -> Degradation {
        self.degraded
    }

    /// Opens a section, any section still open is committed first
    pub fn begin(&mut self, tag: u16) -> bool {
        if self.open.is_some() {
            self.commit();
        }

        let start = self.pos;
        if self.pos + SECTION_HEADER_LEN > self.limit() {
            self.degraded |= Degradation::TRUNCATED;
            return false;
        }

        self.open = Some(start);
        self.overflowed = false;
        self.put(tag) && self.put(0u32)
    }

    /// Closes the open section, or drops it if any write to it overflowed
    pub fn commit(&mut self) {
        let Some(start) = self.open.take() else {
            return;
        };

        if self.overflowed {
            self.pos = start;
            self.overflowed = false;
            self.degraded |= Degradation::TRUNCATED;
            return;
        }

        let len = (self.pos - start - SECTION_HEADER_LEN) as u32;
        let _ = self.buf.pwrite_with(len, start + 2, LE);
    }

    /// Drops the open section
    pub fn abandon(&mut self) {
        if let Some(start) = self.open.take() {
            self.pos = start;
            self.overflowed = false;
            self.degraded |= Degradation::TRUNCATED;
        }
    }

    /// Writes a little endian integer to the open section
    pub fn put<N>(&mut self, n: N) -> bool
    where
        N: TryIntoCtx<scroll::Endian, Error = scroll::Error>,
    {
        if self.overflowed {
            return false;
        }

        let limit = self.limit();
        match self.buf[..limit].pwrite_with(n, self.pos, LE) {
            Ok(written) => {
                self.pos += written;
                true
            }
            Err(_) => {
                self.overflowed = true;
                false
            }
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.overflowed {
            return false;
        }

        let end = self.pos + bytes.len();
        if end > self.limit() {
            self.overflowed = true;
            return false;
        }

        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        true
    }

    /// Writes a `u16` length prefixed string, clamped to `u16::MAX` bytes
    pub fn put_str16(&mut self, s: &str) -> bool {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }

        self.put(len as u16) && self.put_bytes(&s.as_bytes()[..len])
    }

    /// The unused part of the buffer, for callers that fill it in place
    ///
    /// Anything written here only becomes part of the capture after a
    /// matching [`Self::advance`].
    pub fn spare(&mut self) -> &mut [u8] {
        let limit = self.limit();
        if self.overflowed || self.pos >= limit {
            return &mut [];
        }
        &mut self.buf[self.pos..limit]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.limit());
    }

    /// Overwrites a `u32` previously written at `at`
    pub fn patch_u32(&mut self, at: usize, value: u32) -> bool {
        at + 4 <= self.pos && self.buf.pwrite_with(value, at, LE).is_ok()
    }

    /// Writes a complete section from an already encoded payload
    pub fn section(&mut self, tag: u16, payload: &[u8]) -> bool {
        let ok = self.begin(tag) && self.put_bytes(payload);
        self.commit();
        ok
    }

    pub fn header(&mut self, header: &RawHeader) -> bool {
        let ok = self.begin(tag::HEADER) && self.put(*header);
        self.commit();
        ok
    }

    pub fn missing_thread(&mut self, tid: i32) -> bool {
        let ok = self.begin(tag::MISSING_THREAD) && self.put(tid);
        self.commit();
        ok
    }

    pub fn image(&mut self, base: u64, end: u64, build_id: &[u8], path: &[u8]) -> bool {
        let build_id = &build_id[..build_id.len().min(u8::MAX as usize)];
        let path = &path[..path.len().min(u16::MAX as usize)];

        let ok = self.begin(tag::IMAGE)
            && self.put(base)
            && self.put(end)
            && self.put(build_id.len() as u8)
            && self.put_bytes(build_id)
            && self.put(path.len() as u16)
            && self.put_bytes(path);
        self.commit();
        ok
    }

    pub fn message(&mut self, message: &str, location: Option<&str>) -> bool {
        let ok = self.begin(tag::MESSAGE)
            && self.put_str16(message)
            && self.put_str16(location.unwrap_or_default());
        self.commit();
        ok
    }

    pub fn hang(&mut self, unresponsive_ms: u64) -> bool {
        let ok = self.begin(tag::HANG) && self.put(unresponsive_ms);
        self.commit();
        ok
    }

    /// Closes the capture, returning the number of bytes used
    pub fn finish(mut self) -> usize {
        if self.open.is_some() {
            self.commit();
        }

        // END always fits as its space was reserved up front
        let pos = self.pos;
        let closed = self.buf.pwrite_with(tag::END, pos, LE).is_ok()
            && self.buf.pwrite_with(4u32, pos + 2, LE).is_ok()
            && self.buf.pwrite_with(self.degraded.bits(), pos + 6, LE).is_ok();

        if closed { pos + END_LEN } else { pos }
    }
}

/// Encodes process metadata as a [`tag::METADATA`] payload
///
/// This is done once, ahead of any fault, so that the capture only has to copy
/// the bytes.
pub fn encode_metadata(md: &ProcessMetadata) -> Vec<u8> {
    let mut pairs: Vec<(&str, &str)> = vec![
        ("os.name", &md.os_name),
        ("os.version", &md.os_version),
        ("arch", &md.arch),
        ("app.name", &md.app_name),
        ("app.version", &md.app_version),
    ];
    if let Some(model) = &md.device_model {
        pairs.push(("device.model", model));
    }
    pairs.extend(md.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut out = Vec::new();
    out.extend_from_slice(&(pairs.len().min(u16::MAX as usize) as u16).to_le_bytes());
    for (key, value) in pairs.into_iter().take(u16::MAX as usize) {
        for s in [key, value] {
            let len = s.len().min(u16::MAX as usize);
            out.extend_from_slice(&(len as u16).to_le_bytes());
            out.extend_from_slice(&s.as_bytes()[..len]);
        }
    }
    out
}

fn read_str16(payload: &[u8], offset: &mut usize) -> Result<String, FormatError> {
    let len: u16 = payload.gread_with(offset, LE)?;
    let bytes = read_bytes(payload, offset, len as usize)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_bytes<'a>(
    payload: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8], FormatError> {
    let end = *offset + len;
    let bytes = payload.get(*offset..end).ok_or(FormatError::Truncated {
        needed: end,
        available: payload.len(),
    })?;
    *offset = end;
    Ok(bytes)
}

fn parse_metadata(payload: &[u8], md: &mut ProcessMetadata) -> Result<(), FormatError> {
    let mut offset = 0;
    let count: u16 = payload.gread_with(&mut offset, LE)?;

    for _ in 0..count {
        let key = read_str16(payload, &mut offset)?;
        let value = read_str16(payload, &mut offset)?;

        match key.as_str() {
            "os.name" => md.os_name = value,
            "os.version" => md.os_version = value,
            "arch" => md.arch = value,
            "app.name" => md.app_name = value,
            "app.version" => md.app_version = value,
            "device.model" => md.device_model = Some(value),
            _ => {
                md.attributes.insert(key, value);
            }
        }
    }

    Ok(())
}

fn parse_thread(payload: &[u8], degraded: &mut Degradation) -> Result<ThreadState, FormatError> {
    let mut offset = 0;
    let tid: i32 = payload.gread_with(&mut offset, LE)?;
    let flags: u32 = payload.gread_with(&mut offset, LE)?;
    let pc: u64 = payload.gread_with(&mut offset, LE)?;
    let sp: u64 = payload.gread_with(&mut offset, LE)?;

    let nregs: u16 = payload.gread_with(&mut offset, LE)?;
    let mut registers = Vec::with_capacity(nregs as usize);
    for _ in 0..nregs {
        registers.push(payload.gread_with::<u64>(&mut offset, LE)?);
    }

    let stack_base: u64 = payload.gread_with(&mut offset, LE)?;
    let stack_len: u32 = payload.gread_with(&mut offset, LE)?;
    let stack = read_bytes(payload, &mut offset, stack_len as usize)?.to_vec();

    if flags & thread_flags::REGISTERS_MISSING != 0 {
        degraded.insert(Degradation::MISSING_REGISTERS);
    }
    if flags & thread_flags::STACK_UNREADABLE != 0 {
        degraded.insert(Degradation::STACK_UNREADABLE);
    }

    Ok(ThreadState {
        tid,
        crashed: flags & thread_flags::CRASHED != 0,
        pc,
        sp,
        registers,
        stack_base,
        stack,
    })
}

fn parse_image(payload: &[u8]) -> Result<LoadedImage, FormatError> {
    let mut offset = 0;
    let base: u64 = payload.gread_with(&mut offset, LE)?;
    let end: u64 = payload.gread_with(&mut offset, LE)?;
    let id_len: u8 = payload.gread_with(&mut offset, LE)?;
    let build_id = read_bytes(payload, &mut offset, id_len as usize)?.to_vec();
    let path = read_str16(payload, &mut offset)?;

    Ok(LoadedImage {
        base,
        end,
        build_id,
        path,
    })
}

/// Turns a capture written by a [`RawWriter`] into a snapshot
///
/// A capture whose tail is missing, because the process died before it was
/// closed or because it was cut short on disk, still yields every section that
/// was complete, with [`Degradation::TRUNCATED`] set.
pub fn parse(capture: &[u8]) -> Result<CrashSnapshot, FormatError> {
    if capture.len() < PREFIX_LEN {
        return Err(FormatError::Truncated {
            needed: PREFIX_LEN,
            available: capture.len(),
        });
    }

    let magic: u32 = capture.pread_with(0, LE)?;
    if magic != u32::from_le_bytes(MAGIC) {
        return Err(FormatError::BadMagic(magic));
    }
    let version: u16 = capture.pread_with(MAGIC.len(), LE)?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let mut header = None;
    let mut metadata = ProcessMetadata::default();
    let mut saw_metadata = false;
    let mut threads = Vec::new();
    let mut missing_threads = Vec::new();
    let mut images = Vec::new();
    let mut message = None;
    let mut unresponsive_ms = 0;
    let mut degraded = Degradation::empty();
    let mut closed = false;

    let mut offset = PREFIX_LEN;
    while offset < capture.len() {
        if offset + SECTION_HEADER_LEN > capture.len() {
            break;
        }

        let tag: u16 = capture.pread_with(offset, LE)?;
        let len: u32 = capture.pread_with(offset + 2, LE)?;
        let start = offset + SECTION_HEADER_LEN;
        let Some(payload) = capture.get(start..start + len as usize) else {
            break;
        };
        offset = start + len as usize;

        match tag {
            tag::HEADER => header = Some(payload.pread_with::<RawHeader>(0, LE)?),
            tag::METADATA => {
                parse_metadata(payload, &mut metadata)?;
                saw_metadata = true;
            }
            tag::THREAD => threads.push(parse_thread(payload, &mut degraded)?),
            tag::MISSING_THREAD => missing_threads.push(payload.pread_with::<i32>(0, LE)?),
            tag::IMAGE => images.push(parse_image(payload)?),
            tag::MESSAGE => {
                let mut moff = 0;
                let msg = read_str16(payload, &mut moff)?;
                let loc = read_str16(payload, &mut moff)?;
                message = Some((msg, (!loc.is_empty()).then_some(loc)));
            }
            tag::HANG => unresponsive_ms = payload.pread_with::<u64>(0, LE)?,
            tag::END => {
                degraded |= Degradation::from_bits_retain(payload.pread_with::<u32>(0, LE)?);
                closed = true;
                break;
            }
            // Sections from a newer writer are skipped
            _ => {}
        }
    }

    if !closed {
        degraded |= Degradation::TRUNCATED;
    }
    if !saw_metadata {
        degraded |= Degradation::METADATA_MISSING;
    }
    if !missing_threads.is_empty() {
        degraded |= Degradation::THREADS_MISSING;
    }

    let header = header.ok_or(FormatError::MissingHeader)?;
    metadata.pid = header.pid;

    let timestamp = chrono::DateTime::from_timestamp(header.secs, header.nanos)
        .ok_or(FormatError::InvalidTimestamp(header.secs))?;

    let fault = match FaultKind::from_u8(header.kind)? {
        FaultKind::Signal => Fault::Signal {
            signo: header.signo,
            code: header.code,
            address: header.address,
        },
        FaultKind::Panic => {
            let (message, location) = message.unwrap_or_default();
            Fault::Panic { message, location }
        }
        FaultKind::Hang => Fault::Hang { unresponsive_ms },
    };

    Ok(CrashSnapshot {
        id: uuid::Uuid::from_bytes(header.id),
        timestamp,
        fault,
        crashed_thread: header.crashed_tid,
        threads,
        missing_threads,
        images,
        metadata,
        degraded,
    })
}
