//! Lazy, one-shot result sequences.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attribute::AttributeSet;
use crate::connection::{ConnectionPool, MessageId, RawEntry, SearchMessage};
use crate::error::{Operation, Result};
use crate::registry::Registry;
use crate::session::{PendingRelease, Session};

/// A cloneable handle that abandons a cursor or change stream from outside
/// the task reading it.
///
/// Signalling is immediate; the abandon request itself is sent by the reading
/// side, which stops at its next (or current) wait for a result.
#[derive(Debug, Clone, Default)]
pub struct AbandonHandle {
    token: CancellationToken,
}

impl AbandonHandle {
    pub fn abandon(&self) {
        self.token.cancel();
    }

    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn requested(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Active,
    Exhausted,
    Abandoned,
}

/// Records of one search, read on demand.
///
/// A cursor is not restartable. Once [`Cursor::next`] returns `None` or an
/// error it stays finished. Dropping an unfinished cursor abandons its search
/// before the session's next request.
pub struct Cursor<'s, P: ConnectionPool, R: Registry> {
    session: &'s mut Session<P, R>,
    id: MessageId,
    operation: Operation,
    handle: AbandonHandle,
    state: CursorState,
}

impl<'s, P: ConnectionPool, R: Registry> Cursor<'s, P, R> {
    pub(crate) fn new(session: &'s mut Session<P, R>, id: MessageId, operation: Operation) -> Self {
        Self {
            session,
            id,
            operation,
            handle: AbandonHandle::default(),
            state: CursorState::Active,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn abandon_handle(&self) -> AbandonHandle {
        self.handle.clone()
    }

    /// True until the search completes, fails or is abandoned.
    pub fn is_active(&self) -> bool {
        self.state == CursorState::Active
    }

    /// The next record, or `None` once the search is complete or abandoned.
    pub async fn next(&mut self) -> Result<Option<R::Record>> {
        match self.next_entry().await? {
            Some(entry) => self.decode(entry.attributes).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the remaining records.
    pub async fn collect(mut self) -> Result<Vec<R::Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    /// Stop the search. Idempotent: later calls, and calls on a finished
    /// cursor, send nothing.
    pub async fn abandon(&mut self) {
        self.handle.abandon();
        if self.state != CursorState::Active {
            return;
        }
        self.state = CursorState::Abandoned;
        debug!(id = self.id, operation = %self.operation, "abandoning search");
        self.session.abandon_message(self.id).await;
    }

    pub(crate) fn decode(&self, attributes: AttributeSet) -> Result<R::Record> {
        self.session.decode(attributes)
    }

    pub(crate) async fn next_entry(&mut self) -> Result<Option<RawEntry>> {
        if self.state != CursorState::Active {
            return Ok(None);
        }
        if self.handle.is_abandoned() {
            self.abandon().await;
            return Ok(None);
        }

        let message = {
            let Self {
                session,
                id,
                operation,
                handle,
                ..
            } = self;
            tokio::select! {
                biased;
                _ = handle.requested() => None,
                message = session.next_message(*id, *operation) => Some(message),
            }
        };

        match message {
            None => {
                self.abandon().await;
                Ok(None)
            }
            Some(Ok(SearchMessage::Entry(entry))) => Ok(Some(entry)),
            Some(Ok(SearchMessage::Done(_))) => {
                debug!(id = self.id, "search complete");
                self.state = CursorState::Exhausted;
                Ok(None)
            }
            Some(Err(e)) => {
                self.state = CursorState::Exhausted;
                Err(e)
            }
        }
    }
}

impl<P: ConnectionPool, R: Registry> Drop for Cursor<'_, P, R> {
    fn drop(&mut self) {
        if self.state == CursorState::Active {
            debug!(id = self.id, "cursor dropped mid-search, deferring abandon");
            self.session.defer(PendingRelease::Abandon(self.id));
        }
    }
}
