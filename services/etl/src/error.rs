//! Error taxonomy shared by every pipeline stage.
//!
//! Row-level problems (`Normalization(Droppable)`, `DimensionIntegrity`) are
//! recovered by the caller; file-level problems fail one source file; a
//! connectivity `Load` error aborts the whole run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("dimension integrity violation: {0}")]
    DimensionIntegrity(String),

    #[error("load error: {0}")]
    Load(#[from] sqlx::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    /// A single row could not be mapped; the row is dropped and the file goes on.
    #[error("row {row} dropped: {reason}")]
    Droppable { row: usize, reason: String },

    /// The file as a whole has no recognizable structure.
    #[error("unrecognized source format: {0}")]
    Fatal(String),
}

impl EtlError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        EtlError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(reason: impl ToString) -> Self {
        EtlError::Parse(reason.to_string())
    }

    /// True when the destination is unreachable and nothing else in the run
    /// can make progress.
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(
            self,
            EtlError::Load(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }

    /// Short label used in log fields and the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Fetch { .. } => "fetch",
            EtlError::Parse(_) => "parse",
            EtlError::Normalization(NormalizationError::Droppable { .. }) => "normalization",
            EtlError::Normalization(NormalizationError::Fatal(_)) => "format",
            EtlError::DimensionIntegrity(_) => "dimension_integrity",
            EtlError::Load(_) => "load",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
