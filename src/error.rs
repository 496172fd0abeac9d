//! Error types for pgdriver.

use thiserror::Error;

/// Result type for pgdriver operations.
pub type Result<T> = core::result::Result<T, Error>;

/// SQLSTATE codes the driver reacts to.
pub mod sqlstate {
    /// `query_canceled`: the server honoured a cancel request.
    pub const QUERY_CANCELED: &str = "57014";
    /// `object_not_in_prerequisite_state`: raised by `PREPARE TRANSACTION`
    /// when two-phase commit is disabled on the server.
    pub const OBJECT_NOT_IN_PREREQUISITE_STATE: &str = "55000";
}

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = self.severity() {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgdriver.
#[derive(Debug, Error)]
pub enum Error {
    /// Error response from the server
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A well-formed value could not be decoded, e.g. text that is not
    /// valid UTF-8. The session stays usable.
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection is broken and cannot be reused
    #[error("Connection is broken")]
    ConnectionBroken,

    /// The connection was closed by the caller
    #[error("the connection is closed")]
    Closed,

    /// Operation invalid in the current transaction or pipeline state
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Feature not supported by the server or by this driver
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The operation was interrupted by the caller
    #[error("operation interrupted")]
    Interrupted,

    /// A previous command in the same pipeline failed
    #[error("pipeline aborted: a previous command in the pipeline failed")]
    PipelineAborted,
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionBroken | Error::Closed => true,
            Error::Server(fields) => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(fields.severity(), Some("FATAL") | Some("PANIC"))
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the server reported that the statement was canceled.
    pub fn is_query_canceled(&self) -> bool {
        self.sqlstate() == Some(sqlstate::QUERY_CANCELED)
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(never: core::convert::Infallible) -> Self {
        match never {}
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::ConnectionBroken
    }
}
