//! Change notification streams backed by a persistent search.

use tracing::debug;

use crate::connection::{ConnectionPool, RawEntry};
use crate::control::ChangeKind;
use crate::cursor::{AbandonHandle, Cursor};
use crate::error::Result;
use crate::registry::Registry;

/// One change reported by a [`ChangeStream`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub kind: ChangeKind,
    pub dn: String,
    /// The entry's former name, for renames.
    pub previous_dn: Option<String>,
    pub change_number: Option<u64>,
    pub record: T,
}

/// A lazy, unbounded sequence of change events.
///
/// The stream only ends when it is abandoned, through
/// [`ChangeStream::abandon`] or an [`AbandonHandle`], or when the server
/// terminates the search.
pub struct ChangeStream<'s, P: ConnectionPool, R: Registry> {
    cursor: Cursor<'s, P, R>,
}

impl<'s, P: ConnectionPool, R: Registry> ChangeStream<'s, P, R> {
    pub(crate) fn new(cursor: Cursor<'s, P, R>) -> Self {
        Self { cursor }
    }

    pub fn abandon_handle(&self) -> AbandonHandle {
        self.cursor.abandon_handle()
    }

    pub fn is_active(&self) -> bool {
        self.cursor.is_active()
    }

    /// Wait for the next change. Returns `None` once abandoned.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent<R::Record>>> {
        let Some(entry) = self.cursor.next_entry().await? else {
            return Ok(None);
        };
        let RawEntry {
            dn,
            attributes,
            change,
        } = entry;
        // A server that omits the entry-change notice reports a plain modify.
        let (kind, previous_dn, change_number) = match change {
            Some(notice) => (notice.kind, notice.previous_dn, notice.change_number),
            None => (ChangeKind::Modify, None, None),
        };
        debug!(%dn, ?kind, "change received");
        let record = self.cursor.decode(attributes)?;
        Ok(Some(ChangeEvent {
            kind,
            dn,
            previous_dn,
            change_number,
            record,
        }))
    }

    /// Stop the persistent search. Idempotent.
    pub async fn abandon(&mut self) {
        self.cursor.abandon().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionConfig;
    use crate::connection::{ProtocolVersion, SearchMessage};
    use crate::control::{ChangeTypes, EntryChange};
    use crate::error::Error;
    use crate::session::Session;
    use crate::testing::{MockPool, User, UserRegistry, entry};

    fn changed(kind: ChangeKind, uid: &str) -> SearchMessage {
        let mut raw = entry(&format!("uid={uid},ou=users"), uid, "Someone");
        raw.change = Some(EntryChange {
            kind,
            previous_dn: None,
            change_number: Some(7),
        });
        SearchMessage::Entry(raw)
    }

    async fn open(pool: &Arc<MockPool>) -> Session<MockPool, UserRegistry> {
        Session::open(pool.clone(), Arc::new(UserRegistry), SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upgrades_v2_before_persistent_search() {
        let pool = MockPool::with_version(ProtocolVersion::V2);
        pool.push_search(Ok(vec![changed(ChangeKind::Add, "a")]));
        let mut session = open(&pool).await;
        let mut stream = session
            .open_change_stream("ou=users", "(objectClass=*)", None)
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Add);
        assert_eq!(event.dn, "uid=a,ou=users");
        assert_eq!(event.change_number, Some(7));
        assert_eq!(event.record, User::new("a", "Someone"));
        stream.abandon().await;
        drop(stream);

        let log = pool.log();
        assert_eq!(log[0], "set_version 3");
        assert!(log[1].starts_with("search"));

        let search = pool.searches().pop().unwrap();
        assert_eq!(search.batch_size, 0);
        assert!(search.controls.sort().is_none());
        let persistent = search.controls.persistent().unwrap();
        assert!(persistent.changes_only);
        assert!(persistent.return_entry_change);
        assert_eq!(persistent.change_types, ChangeTypes::all());
    }

    #[tokio::test]
    async fn test_missing_notice_defaults_to_modify() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Entry(entry("uid=a,ou=users", "a", "A"))]));
        let mut session = open(&pool).await;
        let mut stream = session
            .open_change_stream("ou=users", "(objectClass=*)", None)
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Modify);
        assert_eq!(event.previous_dn, None);
        assert!(!pool.log().iter().any(|l| l.starts_with("set_version")));
    }

    #[tokio::test]
    async fn test_abandon_ends_stream() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![]));
        let mut session = open(&pool).await;
        let mut stream = session
            .open_change_stream("ou=users", "(objectClass=*)", None)
            .await
            .unwrap();
        let handle = stream.abandon_handle();
        handle.abandon();
        assert!(stream.next().await.unwrap().is_none());
        assert!(!stream.is_active());
        stream.abandon().await;
        drop(stream);
        let abandons = pool.log().iter().filter(|l| l.starts_with("abandon")).count();
        assert_eq!(abandons, 1);
    }

    #[tokio::test]
    async fn test_empty_change_types_rejected() {
        let pool = MockPool::new();
        let mut session = open(&pool).await;
        let result = session
            .open_change_stream_with("ou=users", "(uid=*)", None, ChangeTypes::empty())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
