use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not acquire lock '{key}' within {waited_ms}ms")]
    LockUnavailable { key: String, waited_ms: u64 },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("credential publish failed: {0}")]
    Publish(String),

    #[error("unresolvable audit role '{0}'")]
    AuditGap(String),

    #[error("stream aborted: {0}")]
    StreamAborted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("token expired")]
    TokenExpired,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl Error {
    /// True when the underlying Postgres error is a server-side cancellation
    /// from `statement_timeout` or `idle_in_transaction_session_timeout`.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Postgres(e) => matches!(
                e.code(),
                Some(&SqlState::QUERY_CANCELED)
                    | Some(&SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT)
            ),
            _ => false,
        }
    }

    /// Errors the caller is expected to retry rather than surface.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
