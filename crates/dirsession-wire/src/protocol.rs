//! Wire protocol: JSON-over-newlines request and response frames.
//!
//! Every request line carries a client-chosen message id. Add, delete,
//! modify and version changes are answered by a single `done` frame. A
//! search is answered by zero or more `entry` frames followed by one `done`
//! frame, except a persistent search which keeps sending entries until it is
//! abandoned. Abandon requests are never answered.

use dirsession_core::{
    AttributeChange, AttributeSet, MessageId, ProtocolError, ProtocolVersion, RawEntry,
    ResponseControl, ResultCode, WireSearch,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: MessageId,
    pub request: Request,
}

/// A request from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SetVersion {
        version: ProtocolVersion,
    },
    Add {
        dn: String,
        attributes: AttributeSet,
    },
    Delete {
        dn: String,
    },
    Modify {
        dn: String,
        changes: Vec<AttributeChange>,
    },
    Search(WireSearch),
    Abandon {
        target: MessageId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: MessageId,
    pub response: Response,
}

/// A response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Entry {
        entry: RawEntry,
    },
    Done {
        result: WireResult,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        controls: Vec<ResponseControl>,
    },
}

/// The final result code of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResult {
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl WireResult {
    pub fn success() -> Self {
        Self {
            code: ResultCode::SUCCESS,
            message: String::new(),
        }
    }

    pub fn into_result(self) -> Result<(), ProtocolError> {
        if self.code.is_success() {
            Ok(())
        } else {
            Err(ProtocolError::new(self.code, self.message))
        }
    }
}

impl From<ProtocolError> for WireResult {
    fn from(err: ProtocolError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

impl ResponseFrame {
    pub fn entry(id: MessageId, entry: RawEntry) -> Self {
        Self {
            id,
            response: Response::Entry { entry },
        }
    }

    pub fn done(id: MessageId, result: WireResult, controls: Vec<ResponseControl>) -> Self {
        Self {
            id,
            response: Response::Done { result, controls },
        }
    }

    pub fn success(id: MessageId) -> Self {
        Self::done(id, WireResult::success(), Vec::new())
    }

    pub fn failure(id: MessageId, err: ProtocolError) -> Self {
        Self::done(id, err.into(), Vec::new())
    }
}
