use crate::{
    BreadcrumbLevel, BreadcrumbSettings, BreadcrumbType, Breadcrumbs, ClientOptions,
    CrashLoopDetector, DeliveryResult, EndpointConfig, Error, RateLimiter,
    ReportStore, ReportingPolicy, Retention, RetryPolicy, StoredReport, SubmissionClient,
};
use fault_monitor::{FaultMonitor, MonitorOptions};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, thread::JoinHandle, time::Duration};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The order pending reports are uploaded in
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RetryOrder {
    /// Oldest first
    #[default]
    Queue,
    /// Newest first
    Stack,
}

/// Configures and starts a [`Coordinator`]
pub struct CoordinatorBuilder {
    database_dir: PathBuf,
    endpoint: EndpointConfig,
    monitor: Option<MonitorOptions>,
    policy: ReportingPolicy,
    retention: Retention,
    retry: RetryPolicy,
    client: ClientOptions,
    reports_per_minute: u32,
    retry_interval: Duration,
    batch_size: usize,
    order: RetryOrder,
    crash_loop_threshold: usize,
    background_uploads: bool,
    attachments: Vec<PathBuf>,
    breadcrumbs: Option<BreadcrumbSettings>,
}

impl CoordinatorBuilder {
    /// Options for the fault monitor, `captures_dir` is always replaced by
    /// the store's captures directory
    #[inline]
    pub fn monitor(mut self, options: MonitorOptions) -> Self {
        self.monitor = Some(options);
        self
    }

    /// Doesn't install the fault monitor, existing reports are still
    /// uploaded
    #[inline]
    pub fn without_monitor(mut self) -> Self {
        self.monitor = None;
        self
    }

    #[inline]
    pub fn policy(mut self, policy: ReportingPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    #[inline]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    /// `0` means unlimited
    #[inline]
    pub fn reports_per_minute(mut self, limit: u32) -> Self {
        self.reports_per_minute = limit;
        self
    }

    #[inline]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// The maximum number of reports uploaded per cycle
    #[inline]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[inline]
    pub fn retry_order(mut self, order: RetryOrder) -> Self {
        self.order = order;
        self
    }

    #[inline]
    pub fn crash_loop_threshold(mut self, threshold: usize) -> Self {
        self.crash_loop_threshold = threshold;
        self
    }

    /// When disabled no uploader thread is spawned, cycles only run when the
    /// host calls [`Uploader::run_cycle`]
    #[inline]
    pub fn background_uploads(mut self, enabled: bool) -> Self {
        self.background_uploads = enabled;
        self
    }

    /// Files uploaded with every report imported by this run, eg. the log
    /// of the host. They are read at upload time, missing ones are skipped.
    #[inline]
    pub fn attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Keeps a breadcrumb log, which is attached to the reports of the run
    /// that wrote it
    #[inline]
    pub fn breadcrumbs(mut self, settings: BreadcrumbSettings) -> Self {
        self.breadcrumbs = Some(settings);
        self
    }

    /// Installs the fault monitor, imports the captures of previous runs and
    /// starts uploading.
    ///
    /// This never waits on the network.
    pub fn start(self) -> Result<Coordinator, Error> {
        let captures_dir = self.database_dir.join(crate::store::CAPTURES_DIR);

        let monitor = match self.monitor {
            Some(mut options) if self.policy.should_monitor() => {
                options.captures_dir = captures_dir;
                match FaultMonitor::install(options) {
                    Ok(monitor) => Some(monitor),
                    Err(fault_monitor::Error::Unsupported) => {
                        log::warn!("fault capture is not supported on this target");
                        None
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            _ => None,
        };

        let store = Arc::new(ReportStore::open(&self.database_dir, self.retention)?);

        let mut detector = CrashLoopDetector::load(&self.database_dir, self.crash_loop_threshold);
        let new_crashes = store.pending_captures().unwrap_or_else(|err| {
            log::error!("failed to count captures: {err}");
            0
        });
        if let Err(err) = detector.record_startup(new_crashes as u64) {
            log::error!("failed to record startup: {err}");
        }
        let crash_loop = detector.is_crash_loop();
        if crash_loop {
            log::warn!("crash loop detected");
        }

        let mut attachments = self.attachments;
        if new_crashes > 0 {
            match Breadcrumbs::take_previous(&self.database_dir, store.attachments_dir()) {
                Ok(Some(taken)) => attachments.push(taken),
                Ok(None) => {}
                Err(err) => log::error!("failed to take the previous breadcrumb log: {err}"),
            }
        }

        match store.import_captures_with_attachments(&attachments) {
            Ok(imported) if !imported.is_empty() => {
                log::info!("imported {} captures", imported.len());
            }
            Ok(_) => {}
            Err(err) => log::error!("failed to import captures: {err}"),
        }

        let breadcrumbs = self.breadcrumbs.and_then(|settings| {
            Breadcrumbs::open(&self.database_dir, settings)
                .map_err(|err| log::error!("failed to open the breadcrumb log: {err}"))
                .ok()
        });

        let shutdown = CancellationToken::new();
        let uploader = Arc::new(Uploader {
            store: store.clone(),
            client: SubmissionClient::new(self.client)?,
            endpoint: RwLock::new(Some(self.endpoint)),
            retry: self.retry,
            limiter: RateLimiter::new(self.reports_per_minute),
            batch_size: self.batch_size,
            order: self.order,
            cancel: Mutex::new(shutdown.child_token()),
        });

        let wake = Arc::new(Notify::new());

        let thread = if self.background_uploads {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            let uploader = uploader.clone();
            let wake = wake.clone();
            let shutdown = shutdown.clone();
            let interval = self.retry_interval;

            Some(
                std::thread::Builder::new()
                    .name("crash-uploader".to_owned())
                    .spawn(move || {
                        runtime.block_on(async move {
                            loop {
                                let stats = uploader.run_cycle().await;
                                log::debug!("upload cycle finished: {stats:?}");

                                tokio::select! {
                                    () = shutdown.cancelled() => break,
                                    () = wake.notified() => {}
                                    () = tokio::time::sleep(interval) => {}
                                }
                            }
                        });
                    })?,
            )
        } else {
            None
        };

        Ok(Coordinator {
            store,
            uploader,
            monitor,
            breadcrumbs,
            crash_loop,
            wake,
            shutdown,
            thread,
        })
    }
}

/// Owns the whole crash reporting lifecycle of a process
///
/// Dropping the coordinator shuts it down. The fault monitor stays installed,
/// signal handlers are never removed.
pub struct Coordinator {
    store: Arc<ReportStore>,
    uploader: Arc<Uploader>,
    monitor: Option<FaultMonitor>,
    breadcrumbs: Option<Breadcrumbs>,
    crash_loop: bool,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn builder(database_dir: impl Into<PathBuf>, endpoint: EndpointConfig) -> CoordinatorBuilder {
        let database_dir = database_dir.into();
        let captures_dir = database_dir.join(crate::store::CAPTURES_DIR);

        CoordinatorBuilder {
            database_dir,
            endpoint,
            monitor: Some(MonitorOptions::new(captures_dir)),
            policy: ReportingPolicy::default(),
            retention: Retention::default().max_reports(64),
            retry: RetryPolicy::default(),
            client: ClientOptions::default(),
            reports_per_minute: 0,
            retry_interval: Duration::from_secs(5 * 60),
            batch_size: 8,
            order: RetryOrder::Queue,
            crash_loop_threshold: 3,
            background_uploads: true,
            attachments: Vec::new(),
            breadcrumbs: None,
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<ReportStore> {
        &self.store
    }

    #[inline]
    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    /// The installed fault monitor, if the policy and target allowed one
    #[inline]
    pub fn monitor(&self) -> Option<FaultMonitor> {
        self.monitor
    }

    /// The breadcrumb log, if one was configured
    #[inline]
    pub fn breadcrumbs(&self) -> Option<&Breadcrumbs> {
        self.breadcrumbs.as_ref()
    }

    /// Records a breadcrumb, returning false if there is no breadcrumb log
    /// or it didn't keep this one
    pub fn add_breadcrumb(
        &self,
        level: BreadcrumbLevel,
        kind: BreadcrumbType,
        message: impl Into<String>,
    ) -> bool {
        let Some(breadcrumbs) = &self.breadcrumbs else {
            return false;
        };

        breadcrumbs
            .add(level, kind, message, BTreeMap::new())
            .unwrap_or_else(|err| {
                log::warn!("failed to record breadcrumb: {err}");
                false
            })
    }

    /// True if each of the last few runs ended in a crash
    #[inline]
    pub fn crash_loop_detected(&self) -> bool {
        self.crash_loop
    }

    /// Runs an upload cycle now, eg. after connectivity came back
    #[inline]
    pub fn network_available(&self) {
        self.wake.notify_one();
    }

    /// Stops all uploads for the rest of the process, eg. after the
    /// credentials were revoked. In-flight uploads are cancelled and their
    /// reports stay pending.
    pub fn invalidate_endpoint(&self) {
        self.uploader.invalidate_endpoint();
    }

    /// Cancels in-flight uploads and stops the uploader thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("the uploader thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What happened during an upload cycle
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Cancelled or rate limited, still pending without a counted attempt
    pub deferred: usize,
}

/// Moves pending reports to the ingestion endpoint
pub struct Uploader {
    store: Arc<ReportStore>,
    client: SubmissionClient,
    endpoint: RwLock<Option<EndpointConfig>>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    batch_size: usize,
    order: RetryOrder,
    cancel: Mutex<CancellationToken>,
}

impl Uploader {
    fn invalidate_endpoint(&self) {
        if self.endpoint.write().take().is_some() {
            log::warn!("the endpoint was invalidated, uploads are stopped");
        }
        self.cancel.lock().cancel();
    }

    /// Uploads the reports that are due, at most one batch.
    ///
    /// Errors for a single report are logged and the cycle moves on.
    pub async fn run_cycle(&self) -> CycleStats {
        let mut stats = CycleStats::default();

        let Some(endpoint) = self.endpoint.read().clone() else {
            return stats;
        };
        let cancel = self.cancel.lock().clone();

        let now = chrono::Utc::now();
        let mut due: Vec<_> = match self.store.list_pending() {
            Ok(pending) => pending.into_iter().filter(|r| r.is_due(now)).collect(),
            Err(err) => {
                log::error!("failed to list pending reports: {err}");
                return stats;
            }
        };

        if self.order == RetryOrder::Stack {
            due.reverse();
        }
        due.truncate(self.batch_size);

        for report in due {
            if cancel.is_cancelled() || !self.limiter.has_capacity() {
                stats.deferred += 1;
                continue;
            }

            if let Err(err) = self.store.writer().mark_in_flight(&report.id) {
                log::error!("failed to start upload of report {}: {err}", report.id);
                continue;
            }

            let result = tokio::select! {
                result = self.client.submit(&report, &endpoint) => result,
                () = cancel.cancelled() => Err(Error::Cancelled),
            };

            self.reconcile(&report, result, &mut stats);
        }

        stats
    }

    fn reconcile(
        &self,
        report: &StoredReport,
        result: Result<DeliveryResult, Error>,
        stats: &mut CycleStats,
    ) {
        let id = &report.id;
        let mut writer = self.store.writer();

        let outcome = match result {
            Ok(DeliveryResult::Delivered) => {
                self.limiter.record();
                stats.delivered += 1;
                log::info!("delivered report {id}");
                writer.mark_delivered(id)
            }
            Ok(DeliveryResult::RetryableFailure {
                reason,
                backoff_floor,
            }) => {
                let attempts = report.retry_count + 1;
                if self.retry.exhausted(attempts) {
                    stats.failed += 1;
                    log::warn!("giving up on report {id} after {attempts} attempts: {reason}");
                    writer.mark_permanent_failure(id)
                } else {
                    let delay = self.retry.backoff(attempts, backoff_floor);
                    let now = chrono::Utc::now();
                    let next = chrono::TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
                    stats.retried += 1;
                    log::info!("upload of report {id} failed ({reason}), retrying in {delay:?}");
                    writer.mark_retry(id, next)
                }
            }
            Ok(DeliveryResult::PermanentFailure { status }) => {
                stats.failed += 1;
                log::warn!("report {id} was rejected with status {status}");
                writer.mark_permanent_failure(id)
            }
            Err(err) => {
                stats.deferred += 1;
                match err {
                    Error::Cancelled => log::info!("upload of report {id} was cancelled"),
                    err => log::error!("upload of report {id} failed: {err}"),
                }
                writer.release(id)
            }
        };

        if let Err(err) = outcome {
            log::error!("failed to update report {id}: {err}");
        }
    }
}
