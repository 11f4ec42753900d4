//! # dirsession
//!
//! A session abstraction over a remote directory store.
//!
//! A [`Session`] owns one connection handed out by a [`ConnectionPool`] and
//! maps typed records to and from directory entries through a [`Registry`].
//! Besides add/read/delete/modify it offers four ways to read results:
//!
//! - [`Cursor`]: a one-shot lazy sequence from a single search.
//! - [`WindowedList`]: index windows over a sorted result set, positioned
//!   server-side with the virtual list view control.
//! - [`PagedIterator`]: fixed-size pages driven by opaque continuation
//!   cookies.
//! - [`ChangeStream`]: a persistent search that yields change events until it
//!   is abandoned.
//!
//! Every protocol failure is translated into the closed [`Error`] taxonomy at
//! the session boundary.
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn run<P: dirsession_core::ConnectionPool>(pool: std::sync::Arc<P>) -> dirsession_core::Result<()> {
//! use std::sync::Arc;
//! use dirsession_core::{AttributeRegistry, AttributeSet, SearchRequest, Session, SessionConfig};
//!
//! let mut session = Session::open(pool, Arc::new(AttributeRegistry), SessionConfig::default()).await?;
//!
//! let mut entry = AttributeSet::new();
//! entry.insert("objectClass", ["person"]);
//! entry.insert("uid", ["alice"]);
//! session.add("uid=alice,ou=users", &entry).await?;
//!
//! let mut cursor = session
//!     .search(SearchRequest::new("ou=users", "(uid=*)").sort_by("uid", Default::default()))
//!     .await?;
//! while let Some(record) = cursor.next().await? {
//!     println!("{:?}", record.first_text("uid"));
//! }
//! drop(cursor);
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod changes;
pub mod config;
pub mod connection;
pub mod control;
pub mod cookie;
pub mod cursor;
pub mod error;
pub mod modification;
pub mod paged;
pub mod registry;
pub mod result;
pub mod search;
pub mod session;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use attribute::{Attribute, AttributeSet, AttributeValue};
pub use changes::{ChangeEvent, ChangeStream};
pub use config::SessionConfig;
pub use connection::{
    Connection, ConnectionPool, MessageId, ProtocolVersion, RawEntry, SearchMessage,
};
pub use control::{
    ChangeKind, ChangeTypes, ControlSet, EntryChange, PagedResultsRequest, PagedResultsResponse,
    PersistentSearchRequest, RequestControl, ResponseControl, VlvRequest, VlvResponse, VlvTarget,
};
pub use cookie::{Cookie, CookieOrigin};
pub use cursor::{AbandonHandle, Cursor};
pub use error::{Error, Operation, Result};
pub use modification::{AttributeChange, ModOp, Modification, ModificationSet};
pub use paged::PagedIterator;
pub use registry::{AttributeRegistry, MappingError, Registry};
pub use result::{ProtocolError, ResultCode};
pub use search::{Scope, SearchRequest, SortDirection, SortField, SortKey, WireSearch};
pub use session::Session;
pub use window::{Window, WindowedList};
