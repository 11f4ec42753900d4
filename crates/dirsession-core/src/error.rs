//! Error taxonomy for all session operations.
//!
//! Callers never see raw protocol result codes: every failure from the
//! connection is translated by [`Error::from_protocol`] into one of a small
//! set of kinds.

use std::fmt;

use thiserror::Error;

use crate::registry::MappingError;
use crate::result::{ProtocolError, ResultCode};

/// Top-level error type for session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The directory is unavailable. Transient; the caller may retry with
    /// backoff.
    #[error("directory unavailable during {operation}: {message}")]
    Unavailable {
        operation: Operation,
        message: String,
    },

    #[error("no such entry during {operation}: {message}")]
    NotFound {
        operation: Operation,
        message: String,
    },

    /// A server-issued continuation cookie was rejected. Pagination can be
    /// restarted from the beginning.
    #[error("stale continuation cookie: {message}")]
    StaleCursor { message: String },

    #[error("{operation} failed: {code}: {message}")]
    OperationFailed {
        operation: Operation,
        code: ResultCode,
        message: String,
    },

    /// Malformed input detected before any request was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
}

/// The session operation during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Add,
    Read,
    Delete,
    Modify,
    Search,
    WindowFetch,
    /// A paged search. `resumed` is true when the request carried a
    /// server-issued cookie.
    PagedSearch { resumed: bool },
    ChangeStream,
    NegotiateVersion,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Add => "add",
            Operation::Read => "read",
            Operation::Delete => "delete",
            Operation::Modify => "modify",
            Operation::Search => "search",
            Operation::WindowFetch => "window fetch",
            Operation::PagedSearch { .. } => "paged search",
            Operation::ChangeStream => "change stream",
            Operation::NegotiateVersion => "version negotiation",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Translate a connection-level failure into the taxonomy.
    pub fn from_protocol(operation: Operation, err: ProtocolError) -> Self {
        let ProtocolError { code, message } = err;
        match code {
            ResultCode::UNAVAILABLE | ResultCode::SERVER_DOWN | ResultCode::CONNECT_ERROR => {
                Error::Unavailable { operation, message }
            }
            ResultCode::NO_SUCH_OBJECT => Error::NotFound { operation, message },
            ResultCode::UNWILLING_TO_PERFORM
            | ResultCode::PROTOCOL_ERROR
            | ResultCode::OPERATIONS_ERROR
                if operation == (Operation::PagedSearch { resumed: true }) =>
            {
                Error::StaleCursor { message }
            }
            _ => Error::OperationFailed {
                operation,
                code,
                message,
            },
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: ResultCode) -> ProtocolError {
        ProtocolError::new(code, "boom")
    }

    #[test]
    fn test_unavailable_codes() {
        for code in [
            ResultCode::UNAVAILABLE,
            ResultCode::SERVER_DOWN,
            ResultCode::CONNECT_ERROR,
        ] {
            let mapped = Error::from_protocol(Operation::Add, err(code));
            assert!(matches!(mapped, Error::Unavailable { .. }), "{code}");
            assert!(mapped.is_transient());
        }
    }

    #[test]
    fn test_no_such_object_is_not_found_for_every_operation() {
        for op in [
            Operation::Read,
            Operation::Modify,
            Operation::Delete,
            Operation::Search,
        ] {
            let mapped = Error::from_protocol(op, err(ResultCode::NO_SUCH_OBJECT));
            assert!(matches!(mapped, Error::NotFound { .. }), "{op}");
        }
    }

    #[test]
    fn test_stale_cookie_only_on_resumed_paged_search() {
        let mapped = Error::from_protocol(
            Operation::PagedSearch { resumed: true },
            err(ResultCode::UNWILLING_TO_PERFORM),
        );
        assert!(matches!(mapped, Error::StaleCursor { .. }));

        let fresh = Error::from_protocol(
            Operation::PagedSearch { resumed: false },
            err(ResultCode::UNWILLING_TO_PERFORM),
        );
        assert!(matches!(fresh, Error::OperationFailed { .. }));

        let plain = Error::from_protocol(Operation::Search, err(ResultCode::PROTOCOL_ERROR));
        assert!(matches!(plain, Error::OperationFailed { .. }));
    }

    #[test]
    fn test_time_limit_is_operation_failed() {
        let mapped = Error::from_protocol(Operation::Search, err(ResultCode::TIME_LIMIT_EXCEEDED));
        match mapped {
            Error::OperationFailed { code, message, .. } => {
                assert_eq!(code, ResultCode::TIME_LIMIT_EXCEEDED);
                assert_eq!(message, "boom");
            }
            other => panic!("expected OperationFailed, got: {other:?}"),
        }
    }
}
