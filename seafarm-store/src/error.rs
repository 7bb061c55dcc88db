use thiserror::Error;

/// Failure reported by a remote store operation.
///
/// `Connectivity` means the request never reached the store. `Timeout`
/// means the request may or may not have been applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("could not reach remote store: {0}")]
    Connectivity(String),

    #[error("remote store did not respond: {0}")]
    Timeout(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("row {id} not found in {table}")]
    NotFound { table: String, id: String },

    #[error("row {id} already exists in {table}")]
    Conflict { table: String, id: String },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("remote store error {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("subscription closed")]
    Closed,
}

impl StoreError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connectivity(_) | StoreError::Timeout(_) => true,
            StoreError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the failed request could have been applied by the store.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
