//! Client side of the socket protocol: a `Connection` over a Unix socket and
//! a pool of them.
//!
//! Responses to different requests may interleave on one socket. Frames for
//! a message other than the one being waited on are parked in a per-message
//! backlog; frames for abandoned messages are discarded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use dirsession_core::{
    AttributeChange, AttributeSet, Connection, ConnectionPool, MessageId, ProtocolError,
    ProtocolVersion, ResultCode, SearchMessage, WireSearch,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use crate::error::{ClientError, connect_error};
use crate::protocol::{Request, RequestFrame, Response, ResponseFrame};

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// A connection to a `dirsession-server`.
pub struct WireConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    /// Bytes of the frame being read. Only cleared once a whole line has been
    /// parsed, so a read interrupted by cancellation resumes where it stopped.
    line_buf: Vec<u8>,
    version: ProtocolVersion,
    next_id: MessageId,
    backlog: HashMap<MessageId, VecDeque<Response>>,
    abandoned: HashSet<MessageId>,
    broken: bool,
}

impl WireConnection {
    /// Connect to the server at `path` and announce `version`.
    pub async fn connect(
        path: impl AsRef<Path>,
        version: ProtocolVersion,
    ) -> std::result::Result<Self, ProtocolError> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(connect_error)?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: Vec::new(),
            version,
            next_id: 1,
            backlog: HashMap::new(),
            abandoned: HashSet::new(),
            broken: false,
        };
        conn.set_protocol_version(version).await?;
        debug!(path = %path.as_ref().display(), ?version, "connected");
        Ok(conn)
    }

    /// True once a transport failure has left the stream in an unknown state.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    async fn send(&mut self, request: Request) -> Result<MessageId> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = RequestFrame { id, request };
        let mut data = serde_json::to_vec(&frame)?;
        data.push(b'\n');
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(id)
    }

    async fn read_frame(&mut self) -> Result<ResponseFrame> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.line_buf).await?;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            if self.line_buf.last() != Some(&b'\n') {
                // EOF in the middle of a line.
                return Err(ClientError::Disconnected);
            }
            let parsed = {
                let line = self.line_buf.trim_ascii();
                if line.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice::<ResponseFrame>(line))
                }
            };
            self.line_buf.clear();
            match parsed {
                None => continue,
                Some(frame) => return Ok(frame?),
            }
        }
    }

    /// Next response for message `id`, parking responses to other messages.
    async fn next_response(&mut self, id: MessageId) -> Result<Response> {
        if let Some(queue) = self.backlog.get_mut(&id) {
            if let Some(response) = queue.pop_front() {
                if queue.is_empty() {
                    self.backlog.remove(&id);
                }
                return Ok(response);
            }
        }
        loop {
            let frame = self.read_frame().await?;
            if frame.id == id {
                return Ok(frame.response);
            }
            if self.abandoned.contains(&frame.id) {
                if matches!(frame.response, Response::Done { .. }) {
                    self.abandoned.remove(&frame.id);
                }
                continue;
            }
            self.backlog
                .entry(frame.id)
                .or_default()
                .push_back(frame.response);
        }
    }

    /// Send a request answered by a single result and wait for it.
    async fn exchange(&mut self, request: Request) -> std::result::Result<(), ProtocolError> {
        self.ensure_usable()?;
        let outcome = async {
            let id = self.send(request).await?;
            self.next_response(id).await
        }
        .await;
        match self.check(outcome)? {
            Response::Done { result, .. } => result.into_result(),
            Response::Entry { .. } => Err(ProtocolError::decoding(
                "unexpected entry in reply to a non-search request",
            )),
        }
    }

    fn ensure_usable(&self) -> std::result::Result<(), ProtocolError> {
        if self.broken {
            return Err(ProtocolError::server_down("connection is broken"));
        }
        Ok(())
    }

    /// Mark the connection broken on transport failure.
    fn check<T>(&mut self, outcome: Result<T>) -> std::result::Result<T, ProtocolError> {
        outcome.map_err(|e| {
            warn!(error = %e, "connection failed");
            self.broken = true;
            e.into()
        })
    }
}

impl Connection for WireConnection {
    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    async fn set_protocol_version(
        &mut self,
        version: ProtocolVersion,
    ) -> std::result::Result<(), ProtocolError> {
        self.exchange(Request::SetVersion { version }).await?;
        self.version = version;
        Ok(())
    }

    async fn add(
        &mut self,
        dn: &str,
        attributes: &AttributeSet,
    ) -> std::result::Result<(), ProtocolError> {
        self.exchange(Request::Add {
            dn: dn.to_string(),
            attributes: attributes.clone(),
        })
        .await
    }

    async fn delete(&mut self, dn: &str) -> std::result::Result<(), ProtocolError> {
        self.exchange(Request::Delete { dn: dn.to_string() }).await
    }

    async fn modify(
        &mut self,
        dn: &str,
        changes: &[AttributeChange],
    ) -> std::result::Result<(), ProtocolError> {
        self.exchange(Request::Modify {
            dn: dn.to_string(),
            changes: changes.to_vec(),
        })
        .await
    }

    async fn search(&mut self, search: &WireSearch) -> std::result::Result<MessageId, ProtocolError> {
        self.ensure_usable()?;
        let sent = self.send(Request::Search(search.clone())).await;
        self.check(sent)
    }

    async fn next_message(&mut self, id: MessageId) -> std::result::Result<SearchMessage, ProtocolError> {
        self.ensure_usable()?;
        if self.abandoned.contains(&id) {
            return Err(ProtocolError::new(
                ResultCode::OTHER,
                format!("search {id} was abandoned"),
            ));
        }
        let response = self.next_response(id).await;
        match self.check(response)? {
            Response::Entry { entry } => Ok(SearchMessage::Entry(entry)),
            Response::Done { result, controls } => {
                result.into_result()?;
                Ok(SearchMessage::Done(controls))
            }
        }
    }

    async fn abandon(&mut self, id: MessageId) -> std::result::Result<(), ProtocolError> {
        self.ensure_usable()?;
        self.backlog.remove(&id);
        self.abandoned.insert(id);
        let sent = self.send(Request::Abandon { target: id }).await;
        self.check(sent).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Options for a [`WirePool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub socket_path: PathBuf,
    /// Protocol revision new connections announce.
    pub protocol_version: ProtocolVersion,
    /// Idle connections kept for reuse; extras are closed on release.
    pub max_idle: usize,
}

impl PoolOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            protocol_version: ProtocolVersion::V3,
            max_idle: 4,
        }
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// A pool of [`WireConnection`]s to one server.
pub struct WirePool {
    options: PoolOptions,
    idle: Mutex<Vec<WireConnection>>,
}

impl WirePool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl ConnectionPool for WirePool {
    type Connection = WireConnection;

    async fn acquire(&self) -> std::result::Result<WireConnection, ProtocolError> {
        let reused = self.idle.lock().pop();
        if let Some(conn) = reused {
            debug!("reusing pooled connection");
            return Ok(conn);
        }
        WireConnection::connect(&self.options.socket_path, self.options.protocol_version).await
    }

    fn release(&self, connection: WireConnection) {
        if connection.is_broken() {
            debug!("dropping broken connection");
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.options.max_idle {
            idle.push(connection);
        }
    }
}
