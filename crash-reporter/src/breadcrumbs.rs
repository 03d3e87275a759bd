//! A bounded log of the events leading up to a crash.
//!
//! Breadcrumbs are appended as JSON lines to [`BREADCRUMBS_FILE`] in the
//! database directory. When the next run finds captures waiting, the log of
//! the crashed run is moved into the store and attached to their reports.

use crate::Error;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

pub const BREADCRUMBS_FILE: &str = "breadcrumbs.jsonl";

/// Space kept free in a full log so the next few breadcrumbs don't each
/// force a rewrite
const SLACK_BYTES: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbType {
    Manual,
    Log,
    Navigation,
    Http,
    System,
    User,
    Configuration,
}

impl BreadcrumbType {
    pub const ALL: [Self; 7] = [
        Self::Manual,
        Self::Log,
        Self::Navigation,
        Self::Http,
        Self::System,
        Self::User,
        Self::Configuration,
    ];
}

#[derive(Clone, Debug)]
pub struct BreadcrumbSettings {
    /// Larger breadcrumbs are discarded
    pub max_breadcrumb_bytes: usize,
    /// The oldest breadcrumbs are dropped to keep the log under this size
    pub max_file_bytes: usize,
    /// Less severe breadcrumbs are ignored
    pub min_level: BreadcrumbLevel,
    /// Breadcrumbs of other types are ignored
    pub types: Vec<BreadcrumbType>,
}

impl Default for BreadcrumbSettings {
    fn default() -> Self {
        Self {
            max_breadcrumb_bytes: 4096,
            max_file_bytes: 64000,
            min_level: BreadcrumbLevel::Debug,
            types: BreadcrumbType::ALL.to_vec(),
        }
    }
}

/// One line of the log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub id: u64,
    pub level: BreadcrumbLevel,
    #[serde(rename = "type")]
    pub kind: BreadcrumbType,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

struct Log {
    /// Serialized breadcrumbs, oldest first, without their newlines
    lines: VecDeque<String>,
    bytes: usize,
    next_id: u64,
}

/// The breadcrumb log of the running process
pub struct Breadcrumbs {
    path: PathBuf,
    settings: BreadcrumbSettings,
    log: Mutex<Log>,
}

impl Breadcrumbs {
    /// Opens the log in `dir`, keeping what an earlier run of the process
    /// left in it. Unparseable lines are dropped.
    pub fn open(dir: &Path, settings: BreadcrumbSettings) -> Result<Self, Error> {
        let path = dir.join(BREADCRUMBS_FILE);

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let mut lines = VecDeque::new();
        let mut bytes = 0;
        let mut last_id = None;
        for line in contents.lines() {
            match serde_json::from_str::<Breadcrumb>(line) {
                Ok(crumb) => {
                    last_id = Some(crumb.id);
                    bytes += line.len() + 1;
                    lines.push_back(line.to_owned());
                }
                Err(err) => log::warn!("dropping unreadable breadcrumb: {err}"),
            }
        }

        let next_id = match last_id {
            Some(id) => id + 1,
            None => Utc::now().timestamp_millis().max(0) as u64 + 1,
        };

        Ok(Self {
            path,
            settings,
            log: Mutex::new(Log {
                lines,
                bytes,
                next_id,
            }),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn settings(&self) -> &BreadcrumbSettings {
        &self.settings
    }

    /// Records a breadcrumb, returning false if the settings filtered it out
    /// or it was too large to keep
    pub fn add(
        &self,
        level: BreadcrumbLevel,
        kind: BreadcrumbType,
        message: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<bool, Error> {
        if level < self.settings.min_level || !self.settings.types.contains(&kind) {
            return Ok(false);
        }

        let mut state = self.log.lock();

        let crumb = Breadcrumb {
            timestamp: Utc::now().timestamp_millis(),
            id: state.next_id,
            level,
            kind,
            message: message.into(),
            attributes,
        };
        let line = serde_json::to_string(&crumb)?;
        let len = line.len() + 1;

        if len > self.settings.max_breadcrumb_bytes || len > self.settings.max_file_bytes {
            log::debug!("discarding {len} byte breadcrumb");
            return Ok(false);
        }
        state.next_id += 1;

        let mut rewrite = false;
        if state.bytes + len > self.settings.max_file_bytes {
            let room = self.settings.max_file_bytes.saturating_sub(SLACK_BYTES).max(len);
            while state.bytes + len > room {
                let Some(dropped) = state.lines.pop_front() else {
                    break;
                };
                state.bytes -= dropped.len() + 1;
            }
            rewrite = true;
        }

        state.bytes += len;
        state.lines.push_back(line);

        if rewrite {
            self.rewrite(&state)?;
        } else {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            if let Some(line) = state.lines.back() {
                writeln!(file, "{line}")?;
            }
        }

        Ok(true)
    }

    /// The breadcrumbs currently in the log, oldest first
    pub fn entries(&self) -> Vec<Breadcrumb> {
        self.log
            .lock()
            .lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Empties the log
    pub fn clear(&self) -> Result<(), Error> {
        let mut state = self.log.lock();
        state.lines.clear();
        state.bytes = 0;
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Moves the log left in `dir` by a previous run into `to`, returning
    /// the new path. Nothing is moved if there is no log or it is empty.
    pub fn take_previous(dir: &Path, to: &Path) -> Result<Option<PathBuf>, Error> {
        let path = dir.join(BREADCRUMBS_FILE);
        match fs::metadata(&path) {
            Ok(md) if md.len() > 0 => {}
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            _ => return Ok(None),
        }

        let taken = to.join(format!("breadcrumbs-{}.jsonl", uuid::Uuid::new_v4().simple()));
        fs::rename(&path, &taken)?;
        Ok(Some(taken))
    }

    fn rewrite(&self, log: &Log) -> Result<(), Error> {
        let mut contents = String::with_capacity(log.bytes);
        for line in &log.lines {
            contents.push_str(line);
            contents.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn add(crumbs: &Breadcrumbs, level: BreadcrumbLevel, message: &str) -> bool {
        crumbs
            .add(level, BreadcrumbType::Manual, message, BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let crumbs = Breadcrumbs::open(dir.path(), BreadcrumbSettings::default()).unwrap();

        let attributes = BTreeMap::from([("level".to_owned(), "3".to_owned())]);
        assert!(
            crumbs
                .add(BreadcrumbLevel::Info, BreadcrumbType::Navigation, "loading", attributes)
                .unwrap()
        );
        assert!(add(&crumbs, BreadcrumbLevel::Error, "out of ammo"));

        let contents = fs::read_to_string(crumbs.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "navigation");
        assert_eq!(first["level"], "info");
        assert_eq!(first["message"], "loading");
        assert_eq!(first["attributes"]["level"], "3");

        let entries = crumbs.entries();
        assert_eq!(entries[1].id, entries[0].id + 1);
        assert!(entries[1].attributes.is_empty());
    }

    #[test]
    fn filters_by_level_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BreadcrumbSettings {
            min_level: BreadcrumbLevel::Warning,
            types: vec![BreadcrumbType::Manual],
            ..Default::default()
        };
        let crumbs = Breadcrumbs::open(dir.path(), settings).unwrap();

        assert!(!add(&crumbs, BreadcrumbLevel::Info, "chatter"));
        assert!(add(&crumbs, BreadcrumbLevel::Fatal, "boom"));
        assert!(
            !crumbs
                .add(BreadcrumbLevel::Fatal, BreadcrumbType::Http, "GET /", BTreeMap::new())
                .unwrap()
        );
        assert_eq!(crumbs.entries().len(), 1);
    }

    #[test]
    fn drops_oversized_and_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BreadcrumbSettings {
            max_breadcrumb_bytes: 256,
            max_file_bytes: 2048,
            ..Default::default()
        };
        let crumbs = Breadcrumbs::open(dir.path(), settings).unwrap();

        assert!(!add(&crumbs, BreadcrumbLevel::Info, &"x".repeat(300)));
        assert!(!crumbs.path().exists());

        for i in 0..100 {
            assert!(add(&crumbs, BreadcrumbLevel::Info, &format!("step {i}")));
            assert!(fs::metadata(crumbs.path()).unwrap().len() <= 2048);
        }

        let entries = crumbs.entries();
        assert!(entries.len() < 100);
        assert_eq!(entries.last().unwrap().message, "step 99");

        // The file holds exactly what is in memory
        let reopened = Breadcrumbs::open(dir.path(), BreadcrumbSettings::default()).unwrap();
        assert_eq!(reopened.entries(), entries);
    }

    #[test]
    fn previous_log_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("attachments");
        fs::create_dir(&to).unwrap();

        assert_eq!(Breadcrumbs::take_previous(dir.path(), &to).unwrap(), None);

        let crumbs = Breadcrumbs::open(dir.path(), BreadcrumbSettings::default()).unwrap();
        assert!(add(&crumbs, BreadcrumbLevel::Info, "before the crash"));
        drop(crumbs);

        let taken = Breadcrumbs::take_previous(dir.path(), &to).unwrap().unwrap();
        assert!(taken.starts_with(&to));
        assert!(fs::read_to_string(&taken).unwrap().contains("before the crash"));
        assert!(!dir.path().join(BREADCRUMBS_FILE).exists());

        let crumbs = Breadcrumbs::open(dir.path(), BreadcrumbSettings::default()).unwrap();
        assert!(crumbs.entries().is_empty());
        assert!(add(&crumbs, BreadcrumbLevel::Info, "after"));

        crumbs.clear().unwrap();
        assert!(crumbs.entries().is_empty());
        assert!(!crumbs.path().exists());
    }
}
