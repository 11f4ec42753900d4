//! The directory session: one pooled connection plus the operations built on
//! it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::attribute::AttributeSet;
use crate::changes::ChangeStream;
use crate::config::SessionConfig;
use crate::connection::{
    Connection, ConnectionPool, MessageId, ProtocolVersion, RawEntry, SearchMessage,
};
use crate::control::{
    ChangeTypes, ControlSet, PersistentSearchRequest, RequestControl, ResponseControl,
};
use crate::cookie::Cookie;
use crate::cursor::Cursor;
use crate::error::{Error, Operation, Result};
use crate::modification::{AttributeChange, ModificationSet};
use crate::paged::PagedIterator;
use crate::registry::{MappingError, Registry};
use crate::search::{Scope, SearchRequest, SortKey, WireSearch};
use crate::window::WindowedList;

const READ_FILTER: &str = "(objectClass=*)";

/// Cleanup left behind by a handle that was dropped mid-search. Flushed
/// before the session's next request.
#[derive(Debug)]
pub(crate) enum PendingRelease {
    Abandon(MessageId),
    /// A zero-size paged search that frees the server's paging state.
    PagedState(WireSearch),
}

/// A session bound to one connection.
///
/// The connection is acquired on [`Session::open`] and handed back exactly
/// once, by [`Session::close`] or on drop. It is only pooled when no dropped
/// handle left a search running on it. A session is not meant for
/// concurrent use; every operation takes `&mut self`, and the cursors and
/// lists it creates borrow it for their whole life.
pub struct Session<P: ConnectionPool, R: Registry> {
    pool: Arc<P>,
    connection: Option<P::Connection>,
    registry: Arc<R>,
    config: SessionConfig,
    pending: Vec<PendingRelease>,
}

impl<P: ConnectionPool, R: Registry> Session<P, R> {
    /// Acquire a connection from `pool` and bind a session to it.
    pub async fn open(pool: Arc<P>, registry: Arc<R>, config: SessionConfig) -> Result<Self> {
        let connection = pool
            .acquire()
            .await
            .map_err(|e| Error::from_protocol(Operation::Open, e))?;
        debug!(version = ?connection.protocol_version(), "session opened");
        Ok(Self {
            pool,
            connection: Some(connection),
            registry,
            config,
            pending: Vec::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.connection.as_ref().map(Connection::protocol_version)
    }

    /// Send any deferred releases, then return the connection to the pool.
    pub async fn close(mut self) {
        self.flush_pending().await;
        self.release_connection();
    }

    /// A connection with unsent releases still carries live server-side
    /// searches, so it is dropped instead of pooled. Closing the socket ends
    /// them on the server.
    fn release_connection(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.pending.is_empty() {
            self.pool.release(connection);
            debug!("session closed, connection returned to pool");
        } else {
            warn!(
                pending = self.pending.len(),
                "session dropped with unsent releases, discarding connection"
            );
            self.pending.clear();
            drop(connection);
        }
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Encode `record` and create it at `dn`.
    pub async fn add(&mut self, dn: &str, record: &R::Record) -> Result<()> {
        info!(dn, "adding entry");
        let attributes = self.registry.encode(record)?;
        for attribute in &attributes {
            debug!(attribute = %attribute.name, values = attribute.values.len(), "add attribute");
        }

        self.flush_pending().await;
        let connection = self.connection(Operation::Add)?;
        connection
            .add(dn, &attributes)
            .await
            .map_err(|e| Error::from_protocol(Operation::Add, e))
    }

    /// Read the entry at `dn`, optionally limited to `attributes`.
    pub async fn read(&mut self, dn: &str, attributes: Option<&[String]>) -> Result<R::Record> {
        info!(dn, "reading entry");
        let attributes = attributes
            .map(|names| self.registry.translate_attribute_names(names))
            .transpose()?;
        let search = WireSearch {
            base: dn.to_string(),
            scope: Scope::Base,
            filter: READ_FILTER.to_string(),
            attributes,
            size_limit: 0,
            time_limit: self.config.time_limit_secs,
            batch_size: self.config.batch_size,
            controls: ControlSet::default(),
        };

        let (entries, _) = self.collect(&search, Operation::Read).await?;
        let entry = entries.into_iter().next().ok_or_else(|| Error::NotFound {
            operation: Operation::Read,
            message: format!("no entry returned for {dn}"),
        })?;
        for attribute in &entry.attributes {
            debug!(attribute = %attribute.name, "read attribute");
        }
        self.decode(entry.attributes)
    }

    pub async fn delete(&mut self, dn: &str) -> Result<()> {
        info!(dn, "deleting entry");
        self.flush_pending().await;
        let connection = self.connection(Operation::Delete)?;
        connection
            .delete(dn)
            .await
            .map_err(|e| Error::from_protocol(Operation::Delete, e))
    }

    /// Translate every modification through the registry and submit them as
    /// one atomic modify request.
    pub async fn modify(&mut self, dn: &str, modifications: &ModificationSet<R::Value>) -> Result<()> {
        info!(dn, count = modifications.len(), "modifying entry");
        if modifications.is_empty() {
            return Err(Error::InvalidArgument(
                "modification set is empty".to_string(),
            ));
        }

        let mut changes = Vec::new();
        for modification in modifications.iter() {
            if modification.name.is_empty() {
                return Err(Error::InvalidArgument(
                    "modification has an empty attribute name".to_string(),
                ));
            }
            let attributes = self
                .registry
                .translate_modification(&modification.name, &modification.value)?;
            for attribute in attributes {
                debug!(op = ?modification.op, attribute = %attribute.name, "modify attribute");
                changes.push(AttributeChange {
                    op: modification.op,
                    attribute,
                });
            }
        }

        self.flush_pending().await;
        let connection = self.connection(Operation::Modify)?;
        connection
            .modify(dn, &changes)
            .await
            .map_err(|e| Error::from_protocol(Operation::Modify, e))
    }

    // -----------------------------------------------------------------------
    // Searches
    // -----------------------------------------------------------------------

    /// Start a one-shot search. Records are read lazily from the returned
    /// cursor, sorted server-side when the request has a sort key.
    pub async fn search(&mut self, request: SearchRequest) -> Result<Cursor<'_, P, R>> {
        let mut controls = Vec::new();
        if let Some(key) = request.sort_key() {
            controls.push(RequestControl::Sort {
                key: self.wire_sort(key)?,
            });
        }
        let search = self.wire_search(&request, controls)?;
        let id = self.start_search(&search, Operation::Search).await?;
        Ok(Cursor::new(self, id, Operation::Search))
    }

    /// A windowed view over a sorted search. Fails with
    /// [`Error::UnsupportedOperation`] when the request has no sort key.
    pub async fn create_windowed_list(
        &mut self,
        request: SearchRequest,
    ) -> Result<WindowedList<'_, P, R>> {
        debug!(base = %request.base, filter = %request.filter, "creating windowed list");
        let sort = self.required_sort(&request, "windowed list")?;
        self.flush_pending().await;
        Ok(WindowedList::new(self, request, sort))
    }

    /// A paged iterator using the session's configured page size.
    pub async fn create_paged_iterator(
        &mut self,
        request: SearchRequest,
    ) -> Result<PagedIterator<'_, P, R>> {
        let page_size = self.config.page_size;
        self.create_paged_iterator_with_size(request, page_size).await
    }

    /// A paged iterator with a fixed page size. Fails with
    /// [`Error::UnsupportedOperation`] when the request has no sort key.
    pub async fn create_paged_iterator_with_size(
        &mut self,
        request: SearchRequest,
        page_size: u32,
    ) -> Result<PagedIterator<'_, P, R>> {
        self.paged_iterator(request, page_size, None).await
    }

    /// Continue a paged iteration from a cookie returned by an earlier
    /// iterator, for example one handed back to a client between requests.
    pub async fn resume_paged_iterator(
        &mut self,
        request: SearchRequest,
        page_size: u32,
        cookie: Cookie,
    ) -> Result<PagedIterator<'_, P, R>> {
        self.paged_iterator(request, page_size, Some(cookie)).await
    }

    async fn paged_iterator(
        &mut self,
        request: SearchRequest,
        page_size: u32,
        cookie: Option<Cookie>,
    ) -> Result<PagedIterator<'_, P, R>> {
        debug!(base = %request.base, filter = %request.filter, page_size, "creating paged iterator");
        if page_size == 0 {
            return Err(Error::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }
        let sort = self.required_sort(&request, "paged iterator")?;
        self.flush_pending().await;
        Ok(PagedIterator::new(self, request, sort, page_size, cookie))
    }

    /// Open a persistent search reporting every kind of change.
    pub async fn open_change_stream(
        &mut self,
        base: &str,
        filter: &str,
        attributes: Option<&[String]>,
    ) -> Result<ChangeStream<'_, P, R>> {
        self.open_change_stream_with(base, filter, attributes, ChangeTypes::all())
            .await
    }

    /// Open a persistent search reporting only `change_types`.
    ///
    /// The connection is upgraded to protocol v3 first if needed. Results are
    /// pushed without server-side batching, and the stream never ends on its
    /// own.
    pub async fn open_change_stream_with(
        &mut self,
        base: &str,
        filter: &str,
        attributes: Option<&[String]>,
        change_types: ChangeTypes,
    ) -> Result<ChangeStream<'_, P, R>> {
        info!(base, filter, "opening change stream");
        if change_types.is_empty() {
            return Err(Error::InvalidArgument(
                "change stream needs at least one change type".to_string(),
            ));
        }

        let mut request = SearchRequest::new(base, filter)
            .size_limit(0)
            .time_limit(0)
            .batch_size(0);
        if let Some(names) = attributes {
            request = request.attributes(names.iter().cloned());
        }
        let controls = vec![RequestControl::PersistentSearch(PersistentSearchRequest {
            change_types,
            changes_only: true,
            return_entry_change: true,
        })];
        let search = self.wire_search(&request, controls)?;
        let id = self.start_search(&search, Operation::ChangeStream).await?;
        Ok(ChangeStream::new(Cursor::new(
            self,
            id,
            Operation::ChangeStream,
        )))
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn connection(&mut self, operation: Operation) -> Result<&mut P::Connection> {
        self.connection.as_mut().ok_or_else(|| Error::Unavailable {
            operation,
            message: "session is closed".to_string(),
        })
    }

    fn required_sort(&self, request: &SearchRequest, what: &str) -> Result<SortKey> {
        let key = request.sort_key().ok_or_else(|| {
            Error::UnsupportedOperation(format!("{what} requires a sort key"))
        })?;
        self.wire_sort(key)
    }

    pub(crate) fn wire_sort(&self, key: &SortKey) -> Result<SortKey> {
        let names: Vec<String> = key.fields().iter().map(|f| f.attribute.clone()).collect();
        let translated = self.registry.translate_attribute_names(&names)?;
        if translated.len() != names.len() {
            return Err(MappingError::new(format!(
                "sort key of {} attributes translated to {}",
                names.len(),
                translated.len()
            ))
            .into());
        }
        Ok(key.with_attributes(translated))
    }

    /// Resolve defaults and translate `request` into wire terms.
    pub(crate) fn wire_search(
        &self,
        request: &SearchRequest,
        controls: Vec<RequestControl>,
    ) -> Result<WireSearch> {
        let filter = self.registry.translate_filter(&request.filter)?;
        let attributes = request
            .attributes
            .as_deref()
            .map(|names| self.registry.translate_attribute_names(names))
            .transpose()?;
        Ok(WireSearch {
            base: request.base.clone(),
            scope: request.scope.unwrap_or(self.config.default_scope),
            filter,
            attributes,
            size_limit: request.size_limit.unwrap_or(self.config.size_limit),
            time_limit: request.time_limit.unwrap_or(self.config.time_limit_secs),
            batch_size: request.batch_size.unwrap_or(self.config.batch_size),
            controls: ControlSet::new(controls)?,
        })
    }

    /// Upgrade the connection once if it speaks a revision without control
    /// support.
    async fn ensure_controls_supported(&mut self, operation: Operation) -> Result<()> {
        let connection = self.connection(operation)?;
        let version = connection.protocol_version();
        if version.supports_controls() {
            return Ok(());
        }
        info!(from = ?version, "upgrading connection to protocol v3");
        connection
            .set_protocol_version(ProtocolVersion::V3)
            .await
            .map_err(|e| Error::from_protocol(Operation::NegotiateVersion, e))
    }

    pub(crate) async fn start_search(
        &mut self,
        search: &WireSearch,
        operation: Operation,
    ) -> Result<MessageId> {
        self.flush_pending().await;
        if !search.controls.is_empty() {
            self.ensure_controls_supported(operation).await?;
        }
        info!(
            base = %search.base,
            filter = %search.filter,
            scope = ?search.scope,
            controls = search.controls.len(),
            "searching"
        );
        let connection = self.connection(operation)?;
        connection
            .search(search)
            .await
            .map_err(|e| Error::from_protocol(operation, e))
    }

    pub(crate) async fn next_message(
        &mut self,
        id: MessageId,
        operation: Operation,
    ) -> Result<SearchMessage> {
        let connection = self.connection(operation)?;
        connection
            .next_message(id)
            .await
            .map_err(|e| Error::from_protocol(operation, e))
    }

    /// Run a search to completion, returning its entries and response
    /// controls.
    pub(crate) async fn collect(
        &mut self,
        search: &WireSearch,
        operation: Operation,
    ) -> Result<(Vec<RawEntry>, Vec<ResponseControl>)> {
        let id = self.start_search(search, operation).await?;
        let mut entries = Vec::new();
        loop {
            match self.next_message(id, operation).await? {
                SearchMessage::Entry(entry) => entries.push(entry),
                SearchMessage::Done(controls) => return Ok((entries, controls)),
            }
        }
    }

    pub(crate) fn decode(&self, attributes: AttributeSet) -> Result<R::Record> {
        Ok(self.registry.decode(attributes)?)
    }

    pub(crate) fn defer(&mut self, release: PendingRelease) {
        self.pending.push(release);
    }

    /// Best-effort abandon; failures are logged, never returned.
    pub(crate) async fn abandon_message(&mut self, id: MessageId) {
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.abandon(id).await {
                warn!(id, error = %e, "abandon failed");
            }
        }
    }

    /// Best-effort release of server-side paging state.
    pub(crate) async fn release_paged(&mut self, search: &WireSearch) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let id = match connection.search(search).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "paged results release failed");
                return;
            }
        };
        loop {
            match connection.next_message(id).await {
                Ok(SearchMessage::Entry(_)) => continue,
                Ok(SearchMessage::Done(_)) => break,
                Err(e) => {
                    warn!(error = %e, "paged results release failed");
                    break;
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        debug!(count = pending.len(), "flushing deferred releases");
        for release in pending {
            match release {
                PendingRelease::Abandon(id) => self.abandon_message(id).await,
                PendingRelease::PagedState(search) => self.release_paged(&search).await,
            }
        }
    }
}

impl<P: ConnectionPool, R: Registry> Drop for Session<P, R> {
    fn drop(&mut self) {
        self.release_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modification::ModOp;
    use crate::result::{ProtocolError, ResultCode};
    use crate::search::SortDirection;
    use crate::testing::{MockPool, User, UserRegistry, entry};

    async fn open(pool: &Arc<MockPool>) -> Session<MockPool, UserRegistry> {
        Session::open(pool.clone(), Arc::new(UserRegistry), SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_close_releases_connection_once() {
        let pool = MockPool::new();
        let session = open(&pool).await;
        session.close().await;
        assert_eq!(pool.released(), 1);

        let session = open(&pool).await;
        drop(session);
        assert_eq!(pool.released(), 2);
    }

    #[tokio::test]
    async fn test_close_abandons_dropped_cursor() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Entry(entry("uid=a,ou=users", "a", "Ay"))]));
        let mut session = open(&pool).await;
        let cursor = session
            .search(SearchRequest::new("ou=users", "(uid=*)"))
            .await
            .unwrap();
        let id = cursor.message_id();
        drop(cursor);

        session.close().await;
        assert!(pool.log().contains(&format!("abandon {id}")));
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_drop_with_unsent_abandon_discards_connection() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Entry(entry("uid=a,ou=users", "a", "Ay"))]));
        let mut session = open(&pool).await;
        let cursor = session
            .search(SearchRequest::new("ou=users", "(uid=*)"))
            .await
            .unwrap();
        drop(cursor);
        drop(session);

        assert!(!pool.log().iter().any(|l| l.starts_with("abandon")));
        assert_eq!(pool.released(), 0);
    }

    #[tokio::test]
    async fn test_connection_released_after_failures() {
        let pool = MockPool::new();
        pool.push_write_result(Err(ProtocolError::new(ResultCode::OTHER, "nope")));
        let mut session = open(&pool).await;
        let user = User::new("alice", "Alice");
        assert!(session.add("uid=alice,ou=users", &user).await.is_err());
        drop(session);
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_open_maps_acquire_failure() {
        let pool = MockPool::new();
        pool.fail_acquire(ProtocolError::new(ResultCode::CONNECT_ERROR, "refused"));
        let result = Session::open(pool.clone(), Arc::new(UserRegistry), SessionConfig::default()).await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert_eq!(pool.released(), 0);
    }

    #[tokio::test]
    async fn test_add_error_mapping() {
        let pool = MockPool::new();
        pool.push_write_result(Err(ProtocolError::new(ResultCode::UNAVAILABLE, "maintenance")));
        pool.push_write_result(Err(ProtocolError::new(
            ResultCode::ENTRY_ALREADY_EXISTS,
            "exists",
        )));
        let mut session = open(&pool).await;
        let user = User::new("alice", "Alice");

        let err = session.add("uid=alice,ou=users", &user).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));

        let err = session.add("uid=alice,ou=users", &user).await.unwrap_err();
        match err {
            Error::OperationFailed { code, .. } => assert_eq!(code, ResultCode::ENTRY_ALREADY_EXISTS),
            other => panic!("expected OperationFailed, got: {other:?}"),
        }
        assert_eq!(pool.log(), vec!["add uid=alice,ou=users", "add uid=alice,ou=users"]);
    }

    #[tokio::test]
    async fn test_read_decodes_single_entry() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![
            SearchMessage::Entry(entry("uid=alice,ou=users", "alice", "Alice")),
            SearchMessage::Done(vec![]),
        ]));
        let mut session = open(&pool).await;
        let user = session
            .read("uid=alice,ou=users", Some(&["name".to_string()]))
            .await
            .unwrap();
        assert_eq!(user, User::new("alice", "Alice"));

        let search = pool.searches().pop().unwrap();
        assert_eq!(search.scope, Scope::Base);
        assert_eq!(search.base, "uid=alice,ou=users");
        // Domain name "name" translated to the wire attribute "cn".
        assert_eq!(search.attributes, Some(vec!["cn".to_string()]));
    }

    #[tokio::test]
    async fn test_read_missing_entry_is_not_found() {
        let pool = MockPool::new();
        pool.push_search(Err(ProtocolError::new(ResultCode::NO_SUCH_OBJECT, "gone")));
        let mut session = open(&pool).await;
        let err = session.read("uid=ghost,ou=users", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_modify_expands_through_registry() {
        let pool = MockPool::new();
        let mut session = open(&pool).await;
        let mut mods = ModificationSet::new();
        // UserRegistry maps "name" onto both cn and displayName.
        mods.add(ModOp::Replace, "name", "Alice Smith".to_string());
        mods.add(ModOp::Add, "uid", "asmith".to_string());
        session.modify("uid=alice,ou=users", &mods).await.unwrap();

        let changes = pool.modifications().pop().unwrap();
        let summary: Vec<(ModOp, &str)> = changes
            .iter()
            .map(|c| (c.op, c.attribute.name.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ModOp::Replace, "cn"),
                (ModOp::Replace, "displayName"),
                (ModOp::Add, "uid"),
            ]
        );
    }

    #[tokio::test]
    async fn test_modify_rejects_bad_input_before_network() {
        let pool = MockPool::new();
        let mut session = open(&pool).await;

        let empty: ModificationSet<String> = ModificationSet::new();
        let err = session.modify("uid=alice,ou=users", &empty).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut unnamed = ModificationSet::new();
        unnamed.add(ModOp::Add, "", "x".to_string());
        let err = session.modify("uid=alice,ou=users", &unnamed).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(pool.log().is_empty());
    }

    #[tokio::test]
    async fn test_modify_not_found() {
        let pool = MockPool::new();
        pool.push_write_result(Err(ProtocolError::new(ResultCode::NO_SUCH_OBJECT, "gone")));
        let mut session = open(&pool).await;
        let mut mods = ModificationSet::new();
        mods.add(ModOp::Replace, "name", "x".to_string());
        let err = session.modify("uid=ghost,ou=users", &mods).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_search_applies_session_defaults() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Done(vec![])]));
        let config = SessionConfig::default()
            .with_size_limit(50)
            .with_default_scope(Scope::Subtree);
        let mut session = Session::open(pool.clone(), Arc::new(UserRegistry), config)
            .await
            .unwrap();

        let request = SearchRequest::new("ou=users", "name=A*")
            .sort_by("name", SortDirection::Descending);
        let mut cursor = session.search(request).await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
        drop(cursor);

        let search = pool.searches().pop().unwrap();
        assert_eq!(search.size_limit, 50);
        assert_eq!(search.scope, Scope::Subtree);
        assert_eq!(search.filter, "(cn=A*)");
        let sort = search.controls.sort().unwrap();
        assert_eq!(sort.fields()[0].attribute, "cn");
        assert_eq!(sort.fields()[0].direction, SortDirection::Descending);
    }

    #[tokio::test]
    async fn test_controls_upgrade_v2_connection_once() {
        let pool = MockPool::with_version(ProtocolVersion::V2);
        pool.push_search(Ok(vec![SearchMessage::Done(vec![])]));
        pool.push_search(Ok(vec![SearchMessage::Done(vec![])]));
        let mut session = open(&pool).await;

        for _ in 0..2 {
            let request = SearchRequest::new("ou=users", "(uid=*)").sort(SortKey::ascending("uid"));
            let mut cursor = session.search(request).await.unwrap();
            while cursor.next().await.unwrap().is_some() {}
        }
        assert_eq!(session.protocol_version(), Some(ProtocolVersion::V3));
        let log = pool.log();
        assert_eq!(log.iter().filter(|l| l.starts_with("set_version")).count(), 1);
        assert_eq!(log[0], "set_version 3");
    }
}
