//! Durable storage of crash reports and their delivery state.
//!
//! ```text
//! <dir>/
//!   .lock                  exclusive flock held for the lifetime of the store
//!   captures/              raw captures published by the fault monitor
//!   reports/<id>.snapshot  the encoded snapshot, never rewritten
//!   reports/<id>.state     JSON sidecar with the delivery state
//!   quarantine/            captures and records that could not be read
//!   attachments/           files owned by the store that reports attach
//!   startups.json          startup log of the crash loop detector
//!   breadcrumbs.jsonl      breadcrumb log of the running process
//! ```
//!
//! Reports can also attach files anywhere else, those are only referenced by
//! path and read when the report is uploaded.
//!
//! Every file is published by writing a `.tmp` file, syncing it, and renaming
//! it into place. The state sidecar of a new report is published last, so a
//! report only becomes visible once both of its files are complete.

use crate::Error;
use chrono::{DateTime, Utc};
use crash_snapshot::CrashSnapshot;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write as _,
    path::{Path, PathBuf},
};

pub type ReportId = uuid::Uuid;

pub const CAPTURES_DIR: &str = "captures";
const REPORTS_DIR: &str = "reports";
const QUARANTINE_DIR: &str = "quarantine";
pub const ATTACHMENTS_DIR: &str = "attachments";
const LOCK_FILE: &str = ".lock";

const SNAPSHOT_EXT: &str = "snapshot";
const STATE_EXT: &str = "state";
const TMP_EXT: &str = "tmp";
const CAPTURE_EXT: &str = "capture";

/// Where a report is in its delivery
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    FailedPermanent,
}

impl DeliveryState {
    /// `Pending -> InFlight -> {Delivered, Pending, FailedPermanent}`
    #[inline]
    pub fn can_move_to(self, to: Self) -> bool {
        use DeliveryState as D;
        matches!(
            (self, to),
            (D::Pending, D::InFlight)
                | (D::InFlight, D::Delivered | D::Pending | D::FailedPermanent)
        )
    }
}

/// How much the store keeps, `0` means unlimited
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Retention {
    pub max_reports: usize,
    pub max_bytes: u64,
}

impl Retention {
    #[inline]
    pub fn unlimited() -> Self {
        Self::default()
    }

    #[inline]
    pub fn max_reports(mut self, max: usize) -> Self {
        self.max_reports = max;
        self
    }

    #[inline]
    pub fn max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = max;
        self
    }

    fn exceeded(&self, count: usize, bytes: u64) -> bool {
        (self.max_reports != 0 && count > self.max_reports)
            || (self.max_bytes != 0 && bytes > self.max_bytes)
    }
}

/// The contents of a `.state` sidecar
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    id: ReportId,
    seq: u64,
    state: DeliveryState,
    retry_count: u32,
    format_version: u16,
    payload_len: u64,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PathBuf>,
}

/// A report together with its delivery state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredReport {
    pub id: ReportId,
    /// Insertion order, unique within a store
    pub seq: u64,
    /// The encoded snapshot
    pub bytes: Vec<u8>,
    pub format_version: u16,
    pub state: DeliveryState,
    /// The number of failed delivery attempts
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Files uploaded along with the report, missing ones are skipped
    pub attachments: Vec<PathBuf>,
}

impl StoredReport {
    fn new(record: &Record, bytes: Vec<u8>) -> Self {
        Self {
            id: record.id,
            seq: record.seq,
            bytes,
            format_version: record.format_version,
            state: record.state,
            retry_count: record.retry_count,
            created_at: record.created_at,
            last_attempt_at: record.last_attempt_at,
            next_attempt_at: record.next_attempt_at,
            attachments: record.attachments.clone(),
        }
    }

    /// True if the report can be attempted at `now`
    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Decodes the snapshot
    pub fn snapshot(&self) -> Result<CrashSnapshot, Error> {
        Ok(crash_snapshot::decode(&self.bytes)?)
    }
}

struct WriterState {
    next_seq: u64,
}

/// The crash reports of one database directory
pub struct ReportStore {
    root: PathBuf,
    reports: PathBuf,
    captures: PathBuf,
    quarantine: PathBuf,
    attachments: PathBuf,
    retention: Retention,
    index: RwLock<BTreeMap<ReportId, Record>>,
    writer: Mutex<WriterState>,
    /// Holds the flock
    _lock: File,
}

#[allow(unsafe_code)]
fn lock_exclusive(file: &File, path: &Path) -> Result<(), Error> {
    use std::os::fd::AsRawFd;

    // SAFETY: the fd is owned by `file` for the duration of the call
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Err(Error::StoreLocked(path.to_owned()))
    } else {
        Err(err.into())
    }
}

#[inline]
fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Writes `bytes` to `<dir>/<name>` through a temporary file so that the
/// file is either absent or complete
fn publish(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!("{name}.{TMP_EXT}"));
    let result = (|| {
        let mut file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, dir.join(name))?;
        sync_dir(dir)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    result
}

impl ReportStore {
    /// Opens (creating if needed) the store in `dir`.
    ///
    /// Recovery from a previous process happens here: leftover `.tmp` files
    /// and snapshots without a state sidecar are deleted, unreadable sidecars
    /// are quarantined, and reports that were in flight are pending again.
    pub fn open(dir: impl AsRef<Path>, retention: Retention) -> Result<Self, Error> {
        let root = dir.as_ref().to_owned();
        let reports = root.join(REPORTS_DIR);
        let captures = root.join(CAPTURES_DIR);
        let quarantine = root.join(QUARANTINE_DIR);
        let attachments = root.join(ATTACHMENTS_DIR);

        for dir in [&reports, &captures, &quarantine, &attachments] {
            fs::create_dir_all(dir)?;
        }

        let lock_path = root.join(LOCK_FILE);
        let lock = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_exclusive(&lock, &root)?;

        let store = Self {
            root,
            reports,
            captures,
            quarantine,
            attachments,
            retention,
            index: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(WriterState { next_seq: 1 }),
            _lock: lock,
        };

        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> Result<(), Error> {
        for entry in fs::read_dir(&self.captures)? {
            let path = entry?.path();
            if has_ext(&path, TMP_EXT) {
                log::debug!("removing partial capture '{}'", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        let mut snapshots = Vec::new();
        let mut index = BTreeMap::new();

        for entry in fs::read_dir(&self.reports)? {
            let path = entry?.path();

            if has_ext(&path, TMP_EXT) {
                log::debug!("removing partial write '{}'", path.display());
                let _ = fs::remove_file(&path);
            } else if has_ext(&path, SNAPSHOT_EXT) {
                snapshots.push(path);
            } else if has_ext(&path, STATE_EXT) {
                match self.load_record(&path) {
                    Ok(mut record) => {
                        if record.state == DeliveryState::InFlight {
                            log::info!("report {} was in flight, it is pending again", record.id);
                            record.state = DeliveryState::Pending;
                            self.write_record(&record)?;
                        }
                        index.insert(record.id, record);
                    }
                    Err(err) => {
                        log::warn!("quarantining '{}': {err}", path.display());
                        self.quarantine_file(&path);
                        self.quarantine_file(&path.with_extension(SNAPSHOT_EXT));
                    }
                }
            }
        }

        for path in snapshots {
            let known = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<ReportId>().ok())
                .is_some_and(|id| index.contains_key(&id));

            if !known && path.exists() {
                log::debug!("removing unpublished snapshot '{}'", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        for entry in fs::read_dir(&self.attachments)? {
            let path = entry?.path();
            let referenced = index
                .values()
                .any(|r: &Record| r.attachments.iter().any(|a| *a == path));
            if !referenced {
                log::debug!("removing unreferenced attachment '{}'", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        let next_seq = index.values().map(|r| r.seq).max().unwrap_or(0) + 1;
        self.writer.lock().next_seq = next_seq;
        *self.index.write() = index;

        Ok(())
    }

    fn load_record(&self, path: &Path) -> Result<Record, Error> {
        let record: Record = serde_json::from_slice(&fs::read(path)?)?;

        let snapshot = self.snapshot_path(&record.id);
        let len = fs::metadata(&snapshot)?.len();
        if len != record.payload_len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "snapshot is {len} bytes but {} were recorded",
                    record.payload_len
                ),
            )));
        }

        Ok(record)
    }

    fn write_record(&self, record: &Record) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(record)?;
        publish(&self.reports, &format!("{}.{STATE_EXT}", record.id), &json)?;
        Ok(())
    }

    fn quarantine_file(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        if !path.exists() {
            return;
        }
        if let Err(err) = fs::rename(path, self.quarantine.join(name)) {
            log::error!("failed to quarantine '{}': {err}", path.display());
            let _ = fs::remove_file(path);
        }
    }

    #[inline]
    fn snapshot_path(&self, id: &ReportId) -> PathBuf {
        self.reports.join(format!("{id}.{SNAPSHOT_EXT}"))
    }

    /// The database directory
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory the fault monitor publishes captures to
    #[inline]
    pub fn captures_dir(&self) -> &Path {
        &self.captures
    }

    #[inline]
    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine
    }

    /// Files in here are owned by the store, they are deleted along with the
    /// last report that attaches them
    #[inline]
    pub fn attachments_dir(&self) -> &Path {
        &self.attachments
    }

    /// Takes the single writer, waiting for the current holder if there is
    /// one
    pub fn writer(&self) -> StoreWriter<'_> {
        StoreWriter {
            store: self,
            state: self.writer.lock(),
        }
    }

    /// Takes the single writer, or fails with [`Error::WriterBusy`]
    pub fn try_writer(&self) -> Result<StoreWriter<'_>, Error> {
        let state = self.writer.try_lock().ok_or(Error::WriterBusy)?;
        Ok(StoreWriter { store: self, state })
    }

    /// Parses a raw capture and adds it as a new pending report
    pub fn append(&self, raw_capture: &[u8]) -> Result<ReportId, Error> {
        self.writer().append(raw_capture)
    }

    /// Adds a new pending report
    pub fn append_snapshot(&self, snapshot: &CrashSnapshot) -> Result<ReportId, Error> {
        self.writer().append_snapshot(snapshot)
    }

    /// Appends every capture waiting in [`Self::captures_dir`], oldest first,
    /// and removes it. Captures that can't be parsed, or that are larger
    /// than the store can keep, are quarantined.
    pub fn import_captures(&self) -> Result<Vec<ReportId>, Error> {
        self.import_captures_with_attachments(&[])
    }

    /// [`Self::import_captures`], attaching `attachments` to every imported
    /// report
    pub fn import_captures_with_attachments(
        &self,
        attachments: &[PathBuf],
    ) -> Result<Vec<ReportId>, Error> {
        let mut captures = Vec::new();
        for entry in fs::read_dir(&self.captures)? {
            let entry = entry?;
            let path = entry.path();
            if !has_ext(&path, CAPTURE_EXT) {
                continue;
            }
            let modified = entry.metadata().and_then(|md| md.modified()).ok();
            captures.push((modified, path));
        }
        captures.sort();

        let mut imported = Vec::with_capacity(captures.len());
        let mut writer = self.writer();

        for (_, path) in captures {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!("failed to read capture '{}': {err}", path.display());
                    continue;
                }
            };

            match writer.append_with_attachments(&bytes, attachments) {
                Ok(id) => {
                    imported.push(id);
                    let _ = fs::remove_file(&path);
                }
                Err(Error::DuplicateReport(id)) => {
                    log::debug!("capture {id} was already imported");
                    let _ = fs::remove_file(&path);
                }
                Err(Error::Format(err)) => {
                    log::warn!("quarantining unreadable capture '{}': {err}", path.display());
                    self.quarantine_file(&path);
                }
                Err(Error::Encoding(err)) => {
                    log::warn!("quarantining unencodable capture '{}': {err}", path.display());
                    self.quarantine_file(&path);
                }
                Err(err @ Error::ReportTooLarge { .. }) => {
                    log::warn!("quarantining capture '{}': {err}", path.display());
                    self.quarantine_file(&path);
                }
                Err(err) => {
                    log::error!("failed to import capture '{}': {err}", path.display());
                }
            }
        }

        Ok(imported)
    }

    /// The number of captures waiting to be imported
    pub fn pending_captures(&self) -> Result<usize, Error> {
        let mut count = 0;
        for entry in fs::read_dir(&self.captures)? {
            if has_ext(&entry?.path(), CAPTURE_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every [`DeliveryState::Pending`] report, in insertion order
    pub fn list_pending(&self) -> Result<Vec<StoredReport>, Error> {
        let mut pending: Vec<_> = self
            .index
            .read()
            .values()
            .filter(|r| r.state == DeliveryState::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.seq);

        let mut reports = Vec::with_capacity(pending.len());
        for record in pending {
            match fs::read(self.snapshot_path(&record.id)) {
                Ok(bytes) => reports.push(StoredReport::new(&record, bytes)),
                Err(err) => log::error!("failed to read report {}: {err}", record.id),
            }
        }

        Ok(reports)
    }

    /// Retrieves a single report regardless of its state
    pub fn get(&self, id: &ReportId) -> Result<StoredReport, Error> {
        let record = self
            .index
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::UnknownReport(*id))?;
        let bytes = fs::read(self.snapshot_path(id))?;
        Ok(StoredReport::new(&record, bytes))
    }

    /// The delivery state of a report
    pub fn state(&self, id: &ReportId) -> Option<DeliveryState> {
        self.index.read().get(id).map(|r| r.state)
    }

    /// The number of reports in the store, in any state
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

/// The only way to add reports or change their delivery state
///
/// Holding a writer blocks every other writer of the same store.
pub struct StoreWriter<'s> {
    store: &'s ReportStore,
    state: MutexGuard<'s, WriterState>,
}

impl StoreWriter<'_> {
    /// Parses a raw capture and adds it as a new pending report
    pub fn append(&mut self, raw_capture: &[u8]) -> Result<ReportId, Error> {
        self.append_with_attachments(raw_capture, &[])
    }

    /// [`Self::append`], with files that are uploaded along with the report
    pub fn append_with_attachments(
        &mut self,
        raw_capture: &[u8],
        attachments: &[PathBuf],
    ) -> Result<ReportId, Error> {
        let snapshot = crash_snapshot::raw::parse(raw_capture)?;
        self.append_snapshot_with_attachments(&snapshot, attachments)
    }

    /// Adds a new pending report
    pub fn append_snapshot(&mut self, snapshot: &CrashSnapshot) -> Result<ReportId, Error> {
        self.append_snapshot_with_attachments(snapshot, &[])
    }

    /// [`Self::append_snapshot`], with files that are uploaded along with the
    /// report
    ///
    /// A report larger than [`Retention::max_bytes`] is refused with
    /// [`Error::ReportTooLarge`] before anything is evicted.
    pub fn append_snapshot_with_attachments(
        &mut self,
        snapshot: &CrashSnapshot,
        attachments: &[PathBuf],
    ) -> Result<ReportId, Error> {
        let id = snapshot.id;
        if self.store.index.read().contains_key(&id) {
            return Err(Error::DuplicateReport(id));
        }

        let bytes = crash_snapshot::encode(snapshot)?;
        let len = bytes.len() as u64;

        let max = self.store.retention.max_bytes;
        if max != 0 && len > max {
            return Err(Error::ReportTooLarge { id, len, max });
        }

        if !snapshot.degraded.is_empty() {
            log::warn!("report {id} is degraded: {:?}", snapshot.degraded);
        }

        self.evict_for(len);

        let store = self.store;
        publish(&store.reports, &format!("{id}.{SNAPSHOT_EXT}"), &bytes)?;

        let record = Record {
            id,
            seq: self.state.next_seq,
            state: DeliveryState::Pending,
            retry_count: 0,
            format_version: crash_snapshot::FORMAT_VERSION,
            payload_len: bytes.len() as u64,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            attachments: attachments.to_vec(),
        };

        if let Err(err) = store.write_record(&record) {
            let _ = fs::remove_file(store.snapshot_path(&id));
            return Err(err);
        }

        self.state.next_seq += 1;
        store.index.write().insert(id, record);

        log::info!("stored report {id} ({} bytes)", bytes.len());
        Ok(id)
    }

    /// Removes reports until one more of `incoming` bytes fits
    fn evict_for(&mut self, incoming: u64) {
        let retention = self.store.retention;

        loop {
            let victim = {
                let index = self.store.index.read();
                let count = index.len() + 1;
                let bytes = index.values().map(|r| r.payload_len).sum::<u64>() + incoming;

                if !retention.exceeded(count, bytes) {
                    return;
                }

                [
                    DeliveryState::Delivered,
                    DeliveryState::Pending,
                    DeliveryState::FailedPermanent,
                ]
                .into_iter()
                .find_map(|state| {
                    index
                        .values()
                        .filter(|r| r.state == state)
                        .min_by_key(|r| r.seq)
                        .map(|r| (r.id, r.state))
                })
            };

            let Some((id, state)) = victim else {
                log::warn!("retention exceeded but every report is in flight");
                return;
            };

            log::info!("evicting {state:?} report {id}");
            self.remove(&id);
        }
    }

    fn remove(&mut self, id: &ReportId) {
        let store = self.store;
        // The state file goes first so a partial removal is invisible
        let _ = fs::remove_file(store.reports.join(format!("{id}.{STATE_EXT}")));
        let _ = fs::remove_file(store.snapshot_path(id));

        let mut index = store.index.write();
        let Some(removed) = index.remove(id) else {
            return;
        };

        for attachment in removed.attachments.iter().filter(|a| a.starts_with(&store.attachments)) {
            let shared = index
                .values()
                .any(|r| r.attachments.iter().any(|a| a == attachment));
            if !shared {
                let _ = fs::remove_file(attachment);
            }
        }
    }

    fn transition(
        &mut self,
        id: &ReportId,
        to: DeliveryState,
        update: impl FnOnce(&mut Record),
    ) -> Result<(), Error> {
        let mut record = self
            .store
            .index
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::UnknownReport(*id))?;

        if !record.state.can_move_to(to) {
            return Err(Error::InvalidTransition {
                id: *id,
                from: record.state,
                to,
            });
        }

        record.state = to;
        update(&mut record);

        self.store.write_record(&record)?;
        self.store.index.write().insert(*id, record);
        Ok(())
    }

    /// `Pending -> InFlight`
    pub fn mark_in_flight(&mut self, id: &ReportId) -> Result<(), Error> {
        self.transition(id, DeliveryState::InFlight, |_| {})
    }

    /// `InFlight -> Delivered`
    pub fn mark_delivered(&mut self, id: &ReportId) -> Result<(), Error> {
        self.transition(id, DeliveryState::Delivered, |r| {
            r.last_attempt_at = Some(Utc::now());
            r.next_attempt_at = None;
        })
    }

    /// `InFlight -> Pending`, counting a failed attempt
    pub fn mark_retry(&mut self, id: &ReportId, next_attempt_at: DateTime<Utc>) -> Result<(), Error> {
        self.transition(id, DeliveryState::Pending, |r| {
            r.retry_count += 1;
            r.last_attempt_at = Some(Utc::now());
            r.next_attempt_at = Some(next_attempt_at);
        })
    }

    /// `InFlight -> Pending` without counting an attempt, for submissions
    /// that were cancelled before they completed
    pub fn release(&mut self, id: &ReportId) -> Result<(), Error> {
        self.transition(id, DeliveryState::Pending, |_| {})
    }

    /// `InFlight -> FailedPermanent`, counting a failed attempt
    ///
    /// The report stays on disk until retention evicts it.
    pub fn mark_permanent_failure(&mut self, id: &ReportId) -> Result<(), Error> {
        self.transition(id, DeliveryState::FailedPermanent, |r| {
            r.retry_count += 1;
            r.last_attempt_at = Some(Utc::now());
            r.next_attempt_at = None;
        })
    }
}
