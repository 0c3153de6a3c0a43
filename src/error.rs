//! Contains the `Error` and `Result` types that `docwire` uses.

use std::{fmt, sync::Arc};

use serde::Deserialize;

use crate::options::ServerAddress;

/// The result type for all methods that can return an error in the `docwire` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `docwire` crate. The inner [`ErrorKind`] is wrapped in an
/// `Arc` to allow the errors to be cloned.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection_closed(message: impl Into<String>) -> Self {
        ErrorKind::ConnectionClosed {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn timed_out(message: impl Into<String>) -> Self {
        ErrorKind::Timeout {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn topology(message: impl Into<String>) -> Self {
        ErrorKind::Topology {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_exhausted(address: ServerAddress) -> Self {
        ErrorKind::PoolExhausted { address }.into()
    }

    /// Whether this error was caused by the transport itself (socket dial/read/write failure or
    /// a connection closed mid-operation) rather than by the protocol or the caller. Transport
    /// errors are the only kind the retry machinery will re-attempt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionClosed { .. } | ErrorKind::Network { .. }
        )
    }

    /// Whether this error is a reply-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Timeout { .. })
    }

    /// Whether the server reported a non-ok command status.
    pub fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(..))
    }

    /// The server-provided error code, if this error came from the server.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(Arc::new(err))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(Arc::new(err))
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: format!("invalid document in server reply: {}", err),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Wrapper around a [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection was closed (explicitly or by an unrecoverable socket error) while an
    /// operation was using it.
    #[error("connection closed: {message}")]
    ConnectionClosed { message: String },

    /// A transport failure that persisted through its entire retry budget.
    #[error("network error: {message}")]
    Network { message: String },

    /// No correlated reply arrived within the wait window.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// The server responded to a command with a non-ok status.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// The server sent a malformed frame or a reply body that could not be interpreted.
    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    /// No connection could be obtained from the pool within the configured wait time.
    #[error("no available connection to {address} within the wait timeout")]
    PoolExhausted { address: ServerAddress },

    /// The topology cannot serve the request: no primary is known, or the seed list is empty
    /// or fully pruned.
    #[error("topology error: {message}")]
    Topology { message: String },

    /// The pluggable authenticator rejected the connection.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// An invalid argument was provided to a driver operation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Wrapper around a `bson` serialization error.
    #[error("failed to serialize document: {0}")]
    BsonSerialization(Arc<bson::ser::Error>),

    /// Wrapper around a `bson` deserialization error.
    #[error("failed to deserialize document: {0}")]
    BsonDeserialization(Arc<bson::de::Error>),
}

/// An error reported by the server in response to a command.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandError {
    /// The server-provided error code.
    pub code: i32,

    /// The symbolic name of the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}): {}", self.code_name, self.message)
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ErrorKind};

    #[test]
    fn transport_classification() {
        let io: Error = ErrorKind::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
        .into();
        assert!(io.is_transport());
        assert!(Error::connection_closed("closed").is_transport());

        assert!(!Error::timed_out("no reply").is_transport());
        assert!(!Error::invalid_response("garbage").is_transport());
        assert!(!Error::invalid_argument("bad").is_transport());
    }

    #[test]
    fn command_error_code() {
        let err: Error = ErrorKind::Command(super::CommandError {
            code: 26,
            code_name: "NamespaceNotFound".to_string(),
            message: "ns not found".to_string(),
        })
        .into();
        assert_eq!(err.code(), Some(26));
        assert!(err.is_command_error());
        assert!(!err.is_transport());
    }
}
