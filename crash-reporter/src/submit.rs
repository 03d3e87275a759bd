use crate::{EndpointConfig, Error, ReportId, StoredReport, TokenPlacement};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, RETRY_AFTER},
    multipart::{Form, Part},
};
use std::{collections::HashSet, path::Path, time::Duration};

pub const REPORT_ID_HEADER: &str = "X-Report-Id";
pub const FORMAT_VERSION_HEADER: &str = "X-Report-Format-Version";
pub const UNIVERSE_HEADER: &str = "X-Universe";

/// The form field holding the report in a multipart upload
pub const REPORT_FIELD: &str = "upload_file";
/// Prefixed to the file name of each attachment to name its form field
pub const ATTACHMENT_FIELD_PREFIX: &str = "attachment_";

const OCTET_STREAM: &str = "application/octet-stream";

/// The outcome of a single upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The server accepted the report
    Delivered,
    /// The upload can be tried again, but not before `backoff_floor` if the
    /// server asked for one
    RetryableFailure {
        reason: String,
        backoff_floor: Option<Duration>,
    },
    /// The server rejected the report, trying again won't help
    PermanentFailure { status: u16 },
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// The limit for a whole upload, including the response
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// The number of uploads that can be in flight at once
    pub upload_slots: usize,
    /// The minimum backoff after the server refused our credentials, or
    /// throttled us without saying for how long
    pub auth_backoff_floor: Duration,
    /// Larger attachments are left out of the upload
    pub max_attachment_bytes: u64,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            upload_slots: 1,
            auth_backoff_floor: Duration::from_secs(5 * 60),
            max_attachment_bytes: 10 * 1024 * 1024,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// Uploads reports, at most one at a time per report id
pub struct SubmissionClient {
    http: reqwest::Client,
    slots: tokio::sync::Semaphore,
    in_flight: Mutex<HashSet<ReportId>>,
    auth_backoff_floor: Duration,
    max_attachment_bytes: u64,
}

/// Removes the id from the in-flight set when the submission ends, however
/// it ends
struct Claim<'c> {
    in_flight: &'c Mutex<HashSet<ReportId>>,
    id: ReportId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

impl SubmissionClient {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent)
            .build()?;

        Ok(Self {
            http,
            slots: tokio::sync::Semaphore::new(options.upload_slots.max(1)),
            in_flight: Mutex::new(HashSet::new()),
            auth_backoff_floor: options.auth_backoff_floor,
            max_attachment_bytes: options.max_attachment_bytes,
        })
    }

    fn claim(&self, id: ReportId) -> Result<Claim<'_>, Error> {
        if !self.in_flight.lock().insert(id) {
            return Err(Error::AlreadySubmitting(id));
        }

        Ok(Claim {
            in_flight: &self.in_flight,
            id,
        })
    }

    /// Uploads a single report.
    ///
    /// A report without attachments is the request body. One with
    /// attachments is sent as `multipart/form-data`, the report in the
    /// [`REPORT_FIELD`] field followed by every attachment that can be read.
    ///
    /// Failing to reach the server is a [`DeliveryResult::RetryableFailure`],
    /// not an error. A second submission of a report that is still being
    /// submitted fails with [`Error::AlreadySubmitting`] without sending
    /// anything.
    pub async fn submit(
        &self,
        report: &StoredReport,
        endpoint: &EndpointConfig,
    ) -> Result<DeliveryResult, Error> {
        let _claim = self.claim(report.id)?;
        let _permit = self.slots.acquire().await.map_err(|_e| Error::Cancelled)?;

        log::debug!(
            "uploading report {} ({} bytes) to {}",
            report.id,
            report.bytes.len(),
            endpoint.host()
        );

        let mut request = self
            .http
            .post(endpoint.request_url())
            .header(REPORT_ID_HEADER, report.id.to_string())
            .header(FORMAT_VERSION_HEADER, report.format_version.to_string());

        request = if report.attachments.is_empty() {
            request
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(report.bytes.clone())
        } else {
            request.multipart(self.form(report).await?)
        };

        if let Some(universe) = &endpoint.universe {
            request = request.header(UNIVERSE_HEADER, universe);
        }

        if endpoint.token_placement == TokenPlacement::Header {
            request = request.bearer_auth(&endpoint.token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                // The URL can carry the token
                let err = err.without_url();
                log::debug!("upload of report {} failed: {err}", report.id);
                return Ok(DeliveryResult::RetryableFailure {
                    reason: err.to_string(),
                    backoff_floor: None,
                });
            }
        };

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));

        let result = classify(response.status(), retry_after, self.auth_backoff_floor);
        log::debug!("report {} upload result: {result:?}", report.id);
        Ok(result)
    }

    async fn form(&self, report: &StoredReport) -> Result<Form, Error> {
        let mut form = Form::new().part(
            REPORT_FIELD,
            Part::bytes(report.bytes.clone())
                .file_name(REPORT_FIELD)
                .mime_str(OCTET_STREAM)?,
        );

        let mut seen = HashSet::new();
        for path in &report.attachments {
            if !seen.insert(path) {
                continue;
            }

            let Some(bytes) = self.read_attachment(report.id, path).await else {
                continue;
            };

            let file_name = path
                .file_name()
                .map_or_else(|| "attachment".to_owned(), |name| name.to_string_lossy().into_owned());

            form = form.part(
                format!("{ATTACHMENT_FIELD_PREFIX}{file_name}"),
                Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(mime_type(path))?,
            );
        }

        Ok(form)
    }

    async fn read_attachment(&self, id: ReportId, path: &Path) -> Option<Vec<u8>> {
        let len = match tokio::fs::metadata(path).await {
            Ok(md) => md.len(),
            Err(err) => {
                log::warn!("skipping attachment '{}' of report {id}: {err}", path.display());
                return None;
            }
        };

        if len > self.max_attachment_bytes {
            log::warn!(
                "skipping attachment '{}' of report {id}: {len} bytes is over the limit of {}",
                path.display(),
                self.max_attachment_bytes
            );
            return None;
        }

        match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::warn!("skipping attachment '{}' of report {id}: {err}", path.display());
                None
            }
        }
    }
}

/// The content type of an attachment, from its extension
fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("json") => "application/json",
        Some("jsonl") => "application/x-ndjson",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => OCTET_STREAM,
    }
}

/// Maps the status of an upload response to its outcome
pub(crate) fn classify(
    status: StatusCode,
    retry_after: Option<Duration>,
    auth_backoff_floor: Duration,
) -> DeliveryResult {
    if status.is_success() {
        return DeliveryResult::Delivered;
    }

    let retry = |backoff_floor| DeliveryResult::RetryableFailure {
        reason: format!("server answered {status}"),
        backoff_floor,
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => retry(Some(auth_backoff_floor)),
        StatusCode::TOO_MANY_REQUESTS => retry(Some(retry_after.unwrap_or(auth_backoff_floor))),
        StatusCode::REQUEST_TIMEOUT => retry(retry_after),
        s if s.is_client_error() => DeliveryResult::PermanentFailure { status: s.as_u16() },
        // 5xx, and informational or redirect statuses that reqwest didn't resolve
        _ => retry(retry_after),
    }
}

/// `Retry-After` is either a number of seconds or an HTTP date
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
