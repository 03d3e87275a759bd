use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STARTUPS_FILE: &str = "startups.json";

/// One recorded start of the host process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Startup {
    pub at: DateTime<Utc>,
    /// The total number of crashes seen up to and including this startup
    pub crashes: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct StartupLog {
    startups: Vec<Startup>,
}

/// Detects a process that keeps crashing shortly after it starts
///
/// Every startup records how many crashes had been seen by then. The process
/// is in a crash loop when each of the last `threshold` startups saw more
/// crashes than the one before it, ie. every one of the previous `threshold`
/// runs ended in a crash.
pub struct CrashLoopDetector {
    path: PathBuf,
    threshold: usize,
    startups: Vec<Startup>,
}

impl CrashLoopDetector {
    /// Loads the startup log from `dir`, a missing or unreadable log is
    /// treated as empty
    pub fn load(dir: &Path, threshold: usize) -> Self {
        let path = dir.join(STARTUPS_FILE);
        let startups = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StartupLog>(&bytes) {
                Ok(log) => log.startups,
                Err(err) => {
                    log::warn!("discarding unreadable startup log '{}': {err}", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        Self {
            path,
            threshold: threshold.max(1),
            startups,
        }
    }

    /// Records a startup that found `new_crashes` crashes since the previous
    /// one, and persists the log
    pub fn record_startup(&mut self, new_crashes: u64) -> Result<(), Error> {
        let crashes = self.startups.last().map_or(0, |s| s.crashes) + new_crashes;
        self.startups.push(Startup {
            at: Utc::now(),
            crashes,
        });

        let keep = self.threshold + 1;
        if self.startups.len() > keep {
            self.startups.drain(..self.startups.len() - keep);
        }

        let log = StartupLog {
            startups: self.startups.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&log)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// True if every one of the last `threshold` startups saw a new crash
    pub fn is_crash_loop(&self) -> bool {
        self.startups.len() > self.threshold
            && self
                .startups
                .windows(2)
                .rev()
                .take(self.threshold)
                .all(|pair| pair[1].crashes > pair[0].crashes)
    }

    #[inline]
    pub fn startups(&self) -> &[Startup] {
        &self.startups
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_consecutive_crashes() {
        let dir = tempfile::tempdir().unwrap();

        let mut detector = CrashLoopDetector::load(dir.path(), 3);
        detector.record_startup(0).unwrap();
        assert!(!detector.is_crash_loop());

        for _ in 0..2 {
            detector.record_startup(1).unwrap();
            assert!(!detector.is_crash_loop());
        }

        // Survives a reload
        let mut detector = CrashLoopDetector::load(dir.path(), 3);
        detector.record_startup(2).unwrap();
        assert!(detector.is_crash_loop());
        assert_eq!(detector.startups().len(), 4);

        // A clean run ends the loop
        detector.record_startup(0).unwrap();
        assert!(!detector.is_crash_loop());
        assert_eq!(detector.startups().len(), 4);
        assert_eq!(detector.startups().last().unwrap().crashes, 4);
    }

    #[test]
    fn unreadable_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STARTUPS_FILE), b"[oops").unwrap();

        let mut detector = CrashLoopDetector::load(dir.path(), 1);
        assert!(detector.startups().is_empty());
        detector.record_startup(5).unwrap();
        assert!(!detector.is_crash_loop());
        detector.record_startup(1).unwrap();
        assert!(detector.is_crash_loop());
    }
}
