//! Index windows over a sorted result set.
//!
//! Each fetch is an independent sorted search carrying a virtual list view
//! control, so the server positions the window and only the requested slice
//! crosses the wire. The list keeps no cursor state between fetches; the
//! content count it reports is the server's estimate at the time of the last
//! fetch and may change between calls.

use tracing::debug;

use crate::connection::{ConnectionPool, RawEntry};
use crate::control::{RequestControl, ResponseControl, VlvRequest, VlvResponse, VlvTarget};
use crate::error::{Error, Operation, Result};
use crate::registry::Registry;
use crate::result::ProtocolError;
use crate::search::{SearchRequest, SortKey};
use crate::session::Session;

/// A contiguous slice of a windowed list.
#[derive(Debug, Clone, PartialEq)]
pub struct Window<T> {
    /// 0-based index of the first record.
    pub start: usize,
    pub records: Vec<T>,
    /// The server's size estimate when this window was fetched.
    pub total_estimate: usize,
}

impl<T> Window<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One past the index of the last record.
    pub fn end(&self) -> usize {
        self.start + self.records.len()
    }
}

pub struct WindowedList<'s, P: ConnectionPool, R: Registry> {
    session: &'s mut Session<P, R>,
    request: SearchRequest,
    sort: SortKey,
    total_estimate: Option<usize>,
}

impl<'s, P: ConnectionPool, R: Registry> WindowedList<'s, P, R> {
    pub(crate) fn new(session: &'s mut Session<P, R>, request: SearchRequest, sort: SortKey) -> Self {
        Self {
            session,
            request,
            sort,
            total_estimate: None,
        }
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    /// Size estimate from the last fetch; `None` before the first one.
    pub fn total_estimate(&self) -> Option<usize> {
        self.total_estimate
    }

    /// Ask the server for a fresh size estimate without fetching records.
    pub async fn size(&mut self) -> Result<usize> {
        let (_, vlv) = self.positioned(0, 0, VlvTarget::Offset {
            offset: 1,
            content_count: 0,
        })
        .await?;
        Ok(vlv.content_count as usize)
    }

    /// Records `[start, start + length)`, or fewer at the end of the list.
    /// A start at or past the end yields an empty window.
    pub async fn fetch(&mut self, start: usize, length: usize) -> Result<Window<R::Record>> {
        debug!(start, length, "fetching window");
        let Some(offset) = start.checked_add(1).and_then(|o| u32::try_from(o).ok()) else {
            // Counts are 32-bit, so such a start is past the end of any list.
            let total = self.size().await?;
            return Ok(Window {
                start,
                records: Vec::new(),
                total_estimate: total,
            });
        };
        let after = u32::try_from(length.saturating_sub(1)).unwrap_or(u32::MAX);

        let (entries, vlv) = self
            .positioned(0, after, VlvTarget::Offset {
                offset,
                content_count: 0,
            })
            .await?;
        let total = vlv.content_count as usize;
        if length == 0 || start >= total {
            return Ok(Window {
                start,
                records: Vec::new(),
                total_estimate: total,
            });
        }

        let records = self.decode_all(entries.into_iter().take(length))?;
        Ok(Window {
            start,
            records,
            total_estimate: total,
        })
    }

    /// A window around the first record whose primary sort value is at or
    /// after `value`, with up to `before` records ahead of it and `after`
    /// records following it.
    pub async fn fetch_at_key(
        &mut self,
        value: &str,
        before: usize,
        after: usize,
    ) -> Result<Window<R::Record>> {
        let before_count = u32::try_from(before)
            .map_err(|_| Error::InvalidArgument(format!("before count {before} out of range")))?;
        let after_count = u32::try_from(after)
            .map_err(|_| Error::InvalidArgument(format!("after count {after} out of range")))?;
        debug!(value, before, after, "fetching window at key");

        let (entries, vlv) = self
            .positioned(before_count, after_count, VlvTarget::GreaterOrEqual {
                value: value.to_string(),
            })
            .await?;
        let target = vlv.target_position as usize;
        let start = target.saturating_sub(before).max(1) - 1;
        let records = self.decode_all(entries.into_iter())?;
        Ok(Window {
            start,
            records,
            total_estimate: vlv.content_count as usize,
        })
    }

    fn decode_all(&self, entries: impl Iterator<Item = RawEntry>) -> Result<Vec<R::Record>> {
        entries
            .map(|entry| self.session.decode(entry.attributes))
            .collect()
    }

    async fn positioned(
        &mut self,
        before: u32,
        after: u32,
        target: VlvTarget,
    ) -> Result<(Vec<RawEntry>, VlvResponse)> {
        let controls = vec![
            RequestControl::Sort {
                key: self.sort.clone(),
            },
            RequestControl::VirtualListView(VlvRequest {
                before,
                after,
                target,
            }),
        ];
        let search = self.session.wire_search(&self.request, controls)?;
        let (entries, controls) = self.session.collect(&search, Operation::WindowFetch).await?;

        if let Some(result) = ResponseControl::find_sort(&controls) {
            if !result.is_success() {
                return Err(Error::from_protocol(
                    Operation::WindowFetch,
                    ProtocolError::new(result, "server could not sort the result set"),
                ));
            }
        }
        let vlv = ResponseControl::find_vlv(&controls).cloned().ok_or_else(|| {
            Error::UnsupportedOperation(
                "server did not answer the virtual list view control".to_string(),
            )
        })?;
        if !vlv.result.is_success() {
            return Err(Error::from_protocol(
                Operation::WindowFetch,
                ProtocolError::new(vlv.result, "virtual list view request failed"),
            ));
        }

        debug!(
            target = vlv.target_position,
            count = vlv.content_count,
            returned = entries.len(),
            "window positioned"
        );
        self.total_estimate = Some(vlv.content_count as usize);
        Ok((entries, vlv))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionConfig;
    use crate::connection::SearchMessage;
    use crate::result::ResultCode;
    use crate::search::SortDirection;
    use crate::testing::{MockPool, User, UserRegistry, entry};

    fn vlv_done(target: u32, count: u32) -> SearchMessage {
        SearchMessage::Done(vec![
            ResponseControl::Sort {
                result: ResultCode::SUCCESS,
            },
            ResponseControl::VirtualListView(VlvResponse {
                target_position: target,
                content_count: count,
                result: ResultCode::SUCCESS,
            }),
        ])
    }

    fn sorted() -> SearchRequest {
        SearchRequest::new("ou=users", "(uid=*)").sort_by("name", SortDirection::Ascending)
    }

    async fn open(pool: &Arc<MockPool>) -> Session<MockPool, UserRegistry> {
        Session::open(pool.clone(), Arc::new(UserRegistry), SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_requires_sort_key() {
        let pool = MockPool::new();
        let mut session = open(&pool).await;
        let result = session
            .create_windowed_list(SearchRequest::new("ou=users", "(uid=*)"))
            .await;
        assert!(matches!(result, Err(Error::UnsupportedOperation(_))));
        assert!(pool.log().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_sends_offset_window() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![
            SearchMessage::Entry(entry("uid=u5,ou=users", "u5", "User 5")),
            SearchMessage::Entry(entry("uid=u6,ou=users", "u6", "User 6")),
            vlv_done(6, 50),
        ]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        let window = list.fetch(5, 2).await.unwrap();
        assert_eq!(window.start, 5);
        assert_eq!(window.end(), 7);
        assert_eq!(window.records[0], User::new("u5", "User 5"));
        assert_eq!(window.total_estimate, 50);
        assert_eq!(list.total_estimate(), Some(50));
        drop(list);

        let search = pool.searches().pop().unwrap();
        let vlv = search.controls.vlv().unwrap();
        assert_eq!(vlv.before, 0);
        assert_eq!(vlv.after, 1);
        assert_eq!(
            vlv.target,
            VlvTarget::Offset {
                offset: 6,
                content_count: 0
            }
        );
        assert_eq!(search.controls.sort().unwrap().fields()[0].attribute, "cn");
    }

    #[tokio::test]
    async fn test_start_past_end_is_empty() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![
            SearchMessage::Entry(entry("uid=u9,ou=users", "u9", "User 9")),
            vlv_done(11, 10),
        ]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        let window = list.fetch(10, 5).await.unwrap();
        assert!(window.is_empty());
        assert_eq!(window.total_estimate, 10);
    }

    #[tokio::test]
    async fn test_start_beyond_offset_range_is_empty() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![vlv_done(1, 10)]));
        pool.push_search(Ok(vec![vlv_done(1, 10)]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();

        let window = list.fetch(u32::MAX as usize, 10).await.unwrap();
        assert!(window.is_empty());
        assert_eq!(window.start, u32::MAX as usize);
        assert_eq!(window.total_estimate, 10);

        let window = list.fetch(usize::MAX, 10).await.unwrap();
        assert!(window.is_empty());
        drop(list);

        // Both fetches only probed the size.
        for search in pool.searches() {
            let vlv = search.controls.vlv().unwrap();
            assert_eq!((vlv.before, vlv.after), (0, 0));
        }
    }

    #[tokio::test]
    async fn test_missing_vlv_response_is_unsupported() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Done(vec![])]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        assert!(matches!(
            list.fetch(0, 10).await,
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_vlv_error_result_is_mapped() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![SearchMessage::Done(vec![ResponseControl::VirtualListView(
            VlvResponse {
                target_position: 0,
                content_count: 0,
                result: ResultCode::OFFSET_RANGE_ERROR,
            },
        )])]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        match list.fetch(0, 10).await {
            Err(Error::OperationFailed { code, .. }) => assert_eq!(code, ResultCode::OFFSET_RANGE_ERROR),
            other => panic!("expected OperationFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_at_key_computes_start() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![
            SearchMessage::Entry(entry("uid=u1,ou=users", "u1", "B")),
            SearchMessage::Entry(entry("uid=u2,ou=users", "u2", "C")),
            SearchMessage::Entry(entry("uid=u3,ou=users", "u3", "D")),
            vlv_done(2, 30),
        ]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        // Target at rank 2 with 3 requested before: clamped at the top.
        let window = list.fetch_at_key("C", 3, 1).await.unwrap();
        assert_eq!(window.start, 0);
        assert_eq!(window.len(), 3);
    }

    #[tokio::test]
    async fn test_size_probe() {
        let pool = MockPool::new();
        pool.push_search(Ok(vec![vlv_done(1, 1000)]));
        let mut session = open(&pool).await;
        let mut list = session.create_windowed_list(sorted()).await.unwrap();
        assert_eq!(list.size().await.unwrap(), 1000);
    }
}
