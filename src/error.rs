use thiserror::Error;

/// Convenience result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Error type returned by the ingestion pipeline and the loaders built on top of it.
///
/// Record-level problems (a malformed line, an unparseable timestamp) never surface here;
/// they are logged and the record is dropped or nulled. Every variant of this enum is
/// fatal for the run that produced it.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Underlying I/O error (e.g. file not found, permission denied).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document (e.g. the table config) could not be decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV reader error that could not be recovered by skipping the record.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "excel")]
    /// Excel decoding error (feature-gated behind `excel`).
    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    /// Statement execution against the target store failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound HTTP call (notifications) failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The table config override document is malformed.
    #[error("invalid table config: {message}")]
    InvalidTableConfig { message: String },

    /// The configured time zone is not a known IANA zone.
    #[error("invalid timezone '{zone}'")]
    InvalidTimezone { zone: String },

    /// The input cannot be read by any available source iterator.
    #[error("unsupported input: {message}")]
    UnsupportedFormat { message: String },

    /// A fatal error while reading a source, wrapped with the source identity.
    #[error("failed to process {source_name}: {source}")]
    SourceFailed {
        source_name: String,
        #[source]
        source: Box<IngestionError>,
    },

    /// The event sequence was polled again after it had already failed.
    #[error("ingestion run was aborted by an earlier error")]
    RunAborted,
}

impl IngestionError {
    /// Wrap `err` with the identity of the source that produced it.
    ///
    /// Already-wrapped errors are returned unchanged so the identity is only attached once.
    pub fn in_source(source_name: impl Into<String>, err: IngestionError) -> Self {
        match err {
            wrapped @ IngestionError::SourceFailed { .. } => wrapped,
            other => IngestionError::SourceFailed {
                source_name: source_name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through [`IngestionError::SourceFailed`].
    pub fn root(&self) -> &IngestionError {
        match self {
            IngestionError::SourceFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
