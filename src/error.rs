/// Engine-level error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error("local store error: {0}")]
    LocalStore(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the error means "the thing is already gone". Deletes treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_) | SyncError::Database(sqlx::Error::RowNotFound)
        )
    }

    /// Whether the error should abort a whole sync run rather than a single item.
    /// Only a lost connection to a store is fatal; a rejected statement fails its item.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Unauthorized | SyncError::LocalStore(_) | SyncError::Io(_) => true,
            SyncError::Database(e) => matches!(
                e,
                sqlx::Error::Configuration(_)
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
