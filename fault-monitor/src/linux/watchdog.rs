use crate::Error;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

struct Shared {
    /// Milliseconds since `epoch` of the last heartbeat
    last_beat: AtomicU64,
    epoch: Instant,
    stop: AtomicBool,
}

impl Shared {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Detects a thread that stopped making progress.
///
/// The watched thread (the one that created the watchdog) calls
/// [`Self::heartbeat`] regularly. If no heartbeat arrives for longer than
/// the timeout, the state of the process is captured, with the watched thread
/// as the crashed thread. Only one capture is made per hang, the next one
/// requires the thread to have sent a heartbeat in between. The process is
/// never terminated.
///
/// Dropping the watchdog stops it.
pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(super) fn spawn(timeout: Duration) -> Result<Self, Error> {
        let watched = super::capture::gettid();
        let shared = Arc::new(Shared {
            last_beat: AtomicU64::new(0),
            epoch: Instant::now(),
            stop: AtomicBool::new(false),
        });

        let poll = (timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(100));
        let timeout_ms = timeout.as_millis() as u64;

        let thread = std::thread::Builder::new()
            .name("crash-watchdog".to_owned())
            .spawn({
                let shared = shared.clone();
                move || {
                    // The heartbeat the last capture was made for
                    let mut reported = None;

                    while !shared.stop.load(Ordering::Acquire) {
                        std::thread::park_timeout(poll);

                        let last = shared.last_beat.load(Ordering::Acquire);
                        let silent_for = shared.now_ms().saturating_sub(last);

                        if silent_for > timeout_ms
                            && reported != Some(last)
                            && !shared.stop.load(Ordering::Acquire)
                        {
                            reported = Some(last);
                            super::state::capture_hang(watched, silent_for);
                        }
                    }
                }
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Signals that the watched thread is still making progress
    #[inline]
    pub fn heartbeat(&self) {
        self.shared
            .last_beat
            .store(self.shared.now_ms(), Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}
