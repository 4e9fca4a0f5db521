use crate::types::CellId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("nbt error: {0}")]
    Nbt(#[from] fastnbt::error::Error),

    /// Another transaction committed a binding this one read.
    #[error("transaction conflict on binding {0:?}")]
    Conflict(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),

    #[error("unable to convert version {stored} to current version {current}")]
    VersionMismatch { stored: String, current: String },

    #[error("{0} not found")]
    CellNotFound(CellId),

    #[error("{child} already has parent {parent}")]
    MultipleParents { child: CellId, parent: CellId },

    #[error("{child} is an ancestor of {parent}")]
    Cycle { parent: CellId, child: CellId },

    #[error("{child} is not a child of {parent}")]
    NotAChild { parent: CellId, child: CellId },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Whether the scheduler should rerun the task that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
