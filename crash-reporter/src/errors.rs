use crate::store::{DeliveryState, ReportId};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encoding(#[from] crash_snapshot::EncodingError),
    #[error(transparent)]
    Format(#[from] crash_snapshot::FormatError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("the report store at '{0}' is locked by another process")]
    StoreLocked(PathBuf),
    #[error("the store writer is held by another caller")]
    WriterBusy,
    #[error("report {0} is not in the store")]
    UnknownReport(ReportId),
    #[error("report {0} is already in the store")]
    DuplicateReport(ReportId),
    #[error("report {id} is {len} bytes, more than the {max} bytes the store keeps")]
    ReportTooLarge { id: ReportId, len: u64, max: u64 },
    #[error("report {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: ReportId,
        from: DeliveryState,
        to: DeliveryState,
    },
    #[error("report {0} is already being submitted")]
    AlreadySubmitting(ReportId),
    #[error("the submission was cancelled")]
    Cancelled,
    #[error(transparent)]
    Monitor(#[from] fault_monitor::Error),
}
