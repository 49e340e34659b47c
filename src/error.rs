use thiserror::Error;

pub use color_eyre::eyre::eyre;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// URL or parameter text that does not match the grammar.
    #[error("{context}: {reason}")]
    Parse { context: String, reason: String },

    /// A cross-field invariant of the connection settings is violated.
    #[error("invalid {parameter}: {reason}")]
    Validation {
        parameter: &'static str,
        reason: String,
    },

    /// OS-level socket, DNS or TLS failure while setting up the transport.
    #[error("{stage}: {message}")]
    Connect {
        stage: &'static str,
        message: String,
    },

    /// The server sent something this client cannot make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Login failed: bad credentials or no mutually supported digest.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Internal signal: the welcome message told us to connect elsewhere.
    /// Only surfaces to callers when the redirect limit is exhausted.
    #[error("redirected to {0}")]
    Redirect(String),

    /// An `!` line in a result: the server rejected the statement.
    #[error("server error{}: {message}", sqlstate.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default())]
    Server {
        sqlstate: Option<String>,
        message: String,
    },

    /// A stream deadline expired during the named action.
    #[error("timeout during {0}")]
    Timeout(&'static str),

    /// Operation on a handle or connection that is no longer connected.
    #[error("connection closed")]
    Closed,

    /// The caller used the API out of order.
    #[error("bad usage: {0}")]
    Usage(&'static str),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("a bug in monetdb-mapi: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    pub(crate) fn parse(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connect(stage: &'static str, err: std::io::Error) -> Self {
        if matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return Error::Timeout(stage);
        }
        Error::Connect {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether the transport must be considered unusable after this error.
    pub fn is_conn_broken(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::Timeout(_) | Error::Protocol(_) | Error::Closed
        )
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}
