//! Protocol result codes and the connection-level error.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A directory protocol result code.
///
/// The numeric values follow the LDAP result code registry, including the
/// client-side codes (80 and above) used for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: ResultCode = ResultCode(12);
    pub const NO_SUCH_ATTRIBUTE: ResultCode = ResultCode(16);
    pub const ATTRIBUTE_OR_VALUE_EXISTS: ResultCode = ResultCode(20);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_DN_SYNTAX: ResultCode = ResultCode(34);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const SORT_CONTROL_MISSING: ResultCode = ResultCode(60);
    pub const OFFSET_RANGE_ERROR: ResultCode = ResultCode(61);
    pub const NOT_ALLOWED_ON_NON_LEAF: ResultCode = ResultCode(66);
    pub const ENTRY_ALREADY_EXISTS: ResultCode = ResultCode(68);
    pub const VIRTUAL_LIST_VIEW_ERROR: ResultCode = ResultCode(76);
    pub const OTHER: ResultCode = ResultCode(80);
    pub const SERVER_DOWN: ResultCode = ResultCode(81);
    pub const DECODING_ERROR: ResultCode = ResultCode(84);
    pub const FILTER_ERROR: ResultCode = ResultCode(87);
    pub const CONNECT_ERROR: ResultCode = ResultCode(91);

    pub fn is_success(self) -> bool {
        self == ResultCode::SUCCESS
    }

    /// Symbolic name of a well-known code.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            ResultCode::SUCCESS => "success",
            ResultCode::OPERATIONS_ERROR => "operationsError",
            ResultCode::PROTOCOL_ERROR => "protocolError",
            ResultCode::TIME_LIMIT_EXCEEDED => "timeLimitExceeded",
            ResultCode::SIZE_LIMIT_EXCEEDED => "sizeLimitExceeded",
            ResultCode::UNAVAILABLE_CRITICAL_EXTENSION => "unavailableCriticalExtension",
            ResultCode::NO_SUCH_ATTRIBUTE => "noSuchAttribute",
            ResultCode::ATTRIBUTE_OR_VALUE_EXISTS => "attributeOrValueExists",
            ResultCode::NO_SUCH_OBJECT => "noSuchObject",
            ResultCode::INVALID_DN_SYNTAX => "invalidDNSyntax",
            ResultCode::BUSY => "busy",
            ResultCode::UNAVAILABLE => "unavailable",
            ResultCode::UNWILLING_TO_PERFORM => "unwillingToPerform",
            ResultCode::SORT_CONTROL_MISSING => "sortControlMissing",
            ResultCode::OFFSET_RANGE_ERROR => "offsetRangeError",
            ResultCode::NOT_ALLOWED_ON_NON_LEAF => "notAllowedOnNonLeaf",
            ResultCode::ENTRY_ALREADY_EXISTS => "entryAlreadyExists",
            ResultCode::VIRTUAL_LIST_VIEW_ERROR => "virtualListViewError",
            ResultCode::OTHER => "other",
            ResultCode::SERVER_DOWN => "serverDown",
            ResultCode::DECODING_ERROR => "decodingError",
            ResultCode::FILTER_ERROR => "filterError",
            ResultCode::CONNECT_ERROR => "connectError",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "result code {}", self.0),
        }
    }
}

/// A failure reported by the connection: either a non-success result from
/// the server or a transport failure normalized to a client-side code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ResultCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn server_down(message: impl Into<String>) -> Self {
        Self::new(ResultCode::SERVER_DOWN, message)
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::new(ResultCode::DECODING_ERROR, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_known_and_unknown_codes() {
        assert_eq!(ResultCode::NO_SUCH_OBJECT.to_string(), "noSuchObject (32)");
        assert_eq!(ResultCode(4242).to_string(), "result code 4242");
    }

    #[test]
    fn test_protocol_error_message() {
        let err = ProtocolError::new(ResultCode::UNAVAILABLE, "maintenance");
        assert_eq!(err.to_string(), "unavailable (52): maintenance");
    }

    #[test]
    fn test_result_code_serializes_as_number() {
        let json = serde_json::to_string(&ResultCode::BUSY).unwrap();
        assert_eq!(json, "51");
    }
}
