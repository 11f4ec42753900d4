//! The connection and pool boundaries the session is built on.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeSet;
use crate::control::{EntryChange, ResponseControl};
use crate::modification::AttributeChange;
use crate::result::ProtocolError;
use crate::search::WireSearch;

/// Identifies one outstanding request on a connection.
pub type MessageId = u64;

/// Protocol revision spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProtocolVersion {
    V2,
    V3,
}

impl ProtocolVersion {
    /// Persistent search and every other control need v3.
    pub fn supports_controls(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(v: ProtocolVersion) -> u8 {
        match v {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            other => Err(format!("unsupported protocol version: {other}")),
        }
    }
}

/// A search result entry as it arrives from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    pub dn: String,
    pub attributes: AttributeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<EntryChange>,
}

/// One message of a search's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMessage {
    Entry(RawEntry),
    /// The search finished successfully. A failed search is reported as an
    /// error from [`Connection::next_message`] instead.
    Done(Vec<ResponseControl>),
}

/// A live connection to a directory server.
///
/// Searches are started with [`Connection::search`] and their results read
/// one message at a time with [`Connection::next_message`], so a caller never
/// holds more than one message beyond what it asked for.
pub trait Connection: Send {
    fn protocol_version(&self) -> ProtocolVersion;

    fn set_protocol_version(
        &mut self,
        version: ProtocolVersion,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn add(
        &mut self,
        dn: &str,
        attributes: &AttributeSet,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn delete(&mut self, dn: &str) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Apply all changes to one entry atomically.
    fn modify(
        &mut self,
        dn: &str,
        changes: &[AttributeChange],
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn search(
        &mut self,
        search: &WireSearch,
    ) -> impl Future<Output = Result<MessageId, ProtocolError>> + Send;

    /// Wait for the next message of search `id`. Reading a search that has
    /// been abandoned fails.
    fn next_message(
        &mut self,
        id: MessageId,
    ) -> impl Future<Output = Result<SearchMessage, ProtocolError>> + Send;

    /// Ask the server to stop processing search `id`. There is no reply.
    fn abandon(&mut self, id: MessageId) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Hands out live connections and takes them back.
pub trait ConnectionPool: Send + Sync {
    type Connection: Connection;

    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, ProtocolError>> + Send;

    fn release(&self, connection: Self::Connection);
}
