//! Cookie-driven paging over a sorted result set.
//!
//! Every page is a separate sorted search carrying a paged-results control.
//! The server answers with a continuation cookie that is stored as-is and
//! sent back unmodified with the next request; an empty cookie ends the
//! iteration. [`PagedIterator::seek`] instead synthesizes a client cookie
//! holding a target rank.

use tracing::{debug, warn};

use crate::connection::ConnectionPool;
use crate::control::{PagedResultsRequest, RequestControl, ResponseControl};
use crate::cookie::{Cookie, CookieOrigin};
use crate::error::{Error, Operation, Result};
use crate::registry::Registry;
use crate::search::{SearchRequest, SortKey, WireSearch};
use crate::session::{PendingRelease, Session};

#[derive(Debug, Clone)]
enum PageState {
    /// No server state yet; the next page starts fresh or at a seek cookie.
    Start(Option<Cookie>),
    /// The server holds paging state identified by this cookie.
    Resume(Cookie),
    Exhausted,
    Abandoned,
}

pub struct PagedIterator<'s, P: ConnectionPool, R: Registry> {
    session: &'s mut Session<P, R>,
    request: SearchRequest,
    sort: SortKey,
    page_size: u32,
    state: PageState,
    size_estimate: Option<u32>,
}

impl<'s, P: ConnectionPool, R: Registry> PagedIterator<'s, P, R> {
    pub(crate) fn new(
        session: &'s mut Session<P, R>,
        request: SearchRequest,
        sort: SortKey,
        page_size: u32,
        cookie: Option<Cookie>,
    ) -> Self {
        let state = match cookie {
            Some(cookie) if cookie.origin() == CookieOrigin::Server => PageState::Resume(cookie),
            other => PageState::Start(other),
        };
        Self {
            session,
            request,
            sort,
            page_size,
            state,
            size_estimate: None,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The server's estimate of the total result size, if it sent one.
    pub fn size_estimate(&self) -> Option<u32> {
        self.size_estimate
    }

    /// The cookie the next page will be requested with. Handing it to
    /// [`Session::resume_paged_iterator`] continues from the same point.
    pub fn cookie(&self) -> Option<&Cookie> {
        match &self.state {
            PageState::Start(cookie) => cookie.as_ref(),
            PageState::Resume(cookie) => Some(cookie),
            PageState::Exhausted | PageState::Abandoned => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, PageState::Exhausted | PageState::Abandoned)
    }

    /// The next page, or `None` when the result set is exhausted. Pages hold
    /// at most `page_size` records.
    ///
    /// A server-issued cookie the server no longer accepts fails with
    /// [`Error::StaleCursor`]; call [`PagedIterator::restart`] to begin
    /// again.
    pub async fn next_page(&mut self) -> Result<Option<Vec<R::Record>>> {
        let cookie = match &self.state {
            PageState::Start(cookie) => cookie.clone(),
            PageState::Resume(cookie) => Some(cookie.clone()),
            PageState::Exhausted | PageState::Abandoned => return Ok(None),
        };
        let resumed = cookie
            .as_ref()
            .is_some_and(|c| c.origin() == CookieOrigin::Server);
        let operation = Operation::PagedSearch { resumed };

        let search = self.page_search(self.page_size, cookie)?;
        let (entries, controls) = match self.session.collect(&search, operation).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, Error::StaleCursor { .. }) {
                    debug!("server rejected continuation cookie");
                    self.state = PageState::Exhausted;
                }
                return Err(e);
            }
        };

        let Some(paged) = ResponseControl::find_paged(&controls) else {
            self.state = PageState::Exhausted;
            return Err(Error::UnsupportedOperation(
                "server did not answer the paged results control".to_string(),
            ));
        };
        let paged = paged.clone();

        // A page that fails to decode is not consumed; the same request can be
        // retried.
        let records = entries
            .into_iter()
            .map(|entry| self.session.decode(entry.attributes))
            .collect::<Result<Vec<_>>>()?;

        if paged.size_estimate > 0 {
            self.size_estimate = Some(paged.size_estimate);
        }
        self.state = if paged.cookie.is_empty() {
            PageState::Exhausted
        } else {
            PageState::Resume(Cookie::from_server(paged.cookie.as_bytes().to_vec()))
        };
        debug!(
            returned = records.len(),
            exhausted = self.is_exhausted(),
            "page fetched"
        );
        Ok(Some(records))
    }

    /// Continue from 0-based `rank` with a client-synthesized cookie. Any
    /// server state held by this iterator is released first.
    pub async fn seek(&mut self, rank: u64) {
        self.release().await;
        debug!(rank, "seeking paged iterator");
        self.state = PageState::Start(Some(Cookie::seek(rank)));
    }

    /// Begin again from the first page.
    pub async fn restart(&mut self) {
        self.release().await;
        self.state = PageState::Start(None);
    }

    /// Release the server's paging state and end the iteration. Idempotent.
    pub async fn abandon(&mut self) {
        self.release().await;
        self.state = PageState::Abandoned;
    }

    async fn release(&mut self) {
        let PageState::Resume(cookie) = &self.state else {
            return;
        };
        match self.page_search(0, Some(cookie.clone())) {
            Ok(search) => {
                debug!("releasing paged results state");
                self.session.release_paged(&search).await;
            }
            Err(e) => warn!(error = %e, "could not build paged results release"),
        }
        self.state = PageState::Exhausted;
    }

    fn page_search(&self, size: u32, cookie: Option<Cookie>) -> Result<WireSearch> {
        let controls = vec![
            RequestControl::Sort {
                key: self.sort.clone(),
            },
            RequestControl::PagedResults(PagedResultsRequest { size, cookie }),
        ];
        self.session.wire_search(&self.request, controls)
    }
}

impl<P: ConnectionPool, R: Registry> Drop for PagedIterator<'_, P, R> {
    fn drop(&mut self) {
        if let PageState::Resume(cookie) = &self.state {
            if let Ok(search) = self.page_search(0, Some(cookie.clone())) {
                debug!("paged iterator dropped mid-iteration, deferring release");
                self.session.defer(PendingRelease::PagedState(search));
            }
        }
    }
}
