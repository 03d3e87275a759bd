/// A snapshot that cannot be turned into a report
#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    #[error("snapshot has a nil identifier")]
    NilId,
    #[error("encoded report body of {0} bytes exceeds the format limit")]
    TooLarge(usize),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Bytes that are not a report (or capture) this crate understands
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("unrecognized magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("input truncated, needed {needed} bytes but only {available} are available")]
    Truncated { needed: usize, available: usize },
    #[error("capture is missing its header section")]
    MissingHeader,
    #[error("capture timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("unknown fault kind {0}")]
    UnknownFaultKind(u8),
    #[error("malformed report body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}
