//! Unix domain socket server that serves an in-memory [`Directory`].
//!
//! Each connected client sends JSON-line requests and receives JSON-line
//! responses. Responses go through a per-connection writer task, so
//! persistent searches running in their own tasks can interleave entry
//! frames with replies to later requests.

use std::collections::HashMap;
use std::path::PathBuf;

use dirsession_core::{MessageId, ProtocolError, ProtocolVersion, ResultCode, WireSearch};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{Directory, PagingState, change_entry};
use crate::filter::Filter;
use crate::protocol::{Request, RequestFrame, ResponseFrame};

/// A directory server listening on a Unix socket.
pub struct DirectoryServer {
    directory: Directory,
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl DirectoryServer {
    pub fn new(directory: Directory, socket_path: PathBuf) -> Self {
        Self {
            directory,
            socket_path,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Cancelling this token stops the server as a signal would.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the server, accepting connections until shut down.
    ///
    /// On startup, removes any stale socket file and binds a new one.
    /// On shutdown (SIGINT, SIGTERM or the shutdown token), closes every
    /// client connection and removes the socket file.
    pub async fn run(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "server listening");

        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let directory = self.directory.clone();
                        let shutdown = self.shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(directory, stream, shutdown).await {
                                warn!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
            _ = self.shutdown.cancelled() => {
                info!("shutdown requested");
            }
        }
        self.shutdown.cancel();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove socket file on shutdown");
            } else {
                info!(path = %self.socket_path.display(), "socket file removed");
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    directory: Directory,
    stream: UnixStream,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (out, frames) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, frames));

    let mut client = ClientState {
        directory,
        version: ProtocolVersion::V3,
        paging: PagingState::default(),
        persistent: HashMap::new(),
        out,
        shutdown,
    };

    let mut line = String::new();
    loop {
        line.clear();
        let n = tokio::select! {
            n = reader.read_line(&mut line) => n?,
            _ = client.shutdown.cancelled() => break,
        };
        if n == 0 {
            // Client disconnected.
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RequestFrame>(trimmed) {
            Ok(frame) => client.dispatch(frame),
            Err(e) => client.send(ResponseFrame::failure(
                0,
                ProtocolError::new(ResultCode::PROTOCOL_ERROR, format!("malformed request: {e}")),
            )),
        }
    }

    // Dropping the state stops persistent searches and closes the channel,
    // which lets the writer finish.
    drop(client);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn write_frames(
    writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<ResponseFrame>,
) -> std::io::Result<()> {
    let mut writer = BufWriter::new(writer);
    while let Some(frame) = frames.recv().await {
        let mut bytes = serde_json::to_vec(&frame)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Per-connection protocol state.
struct ClientState {
    directory: Directory,
    version: ProtocolVersion,
    paging: PagingState,
    /// Running persistent searches by message id.
    persistent: HashMap<MessageId, CancellationToken>,
    out: mpsc::UnboundedSender<ResponseFrame>,
    shutdown: CancellationToken,
}

impl ClientState {
    fn send(&self, frame: ResponseFrame) {
        // The writer only goes away with the client.
        let _ = self.out.send(frame);
    }

    fn reply(&self, id: MessageId, result: Result<(), ProtocolError>) {
        match result {
            Ok(()) => self.send(ResponseFrame::success(id)),
            Err(e) => self.send(ResponseFrame::failure(id, e)),
        }
    }

    fn dispatch(&mut self, frame: RequestFrame) {
        let RequestFrame { id, request } = frame;
        match request {
            Request::SetVersion { version } => {
                debug!(?version, "protocol version set");
                self.version = version;
                self.send(ResponseFrame::success(id));
            }
            Request::Add { dn, attributes } => self.reply(id, self.directory.add(&dn, attributes)),
            Request::Delete { dn } => self.reply(id, self.directory.delete(&dn)),
            Request::Modify { dn, changes } => {
                self.reply(id, self.directory.modify(&dn, &changes))
            }
            Request::Search(search) => self.search(id, search),
            Request::Abandon { target } => self.abandon(target),
        }
    }

    fn search(&mut self, id: MessageId, search: WireSearch) {
        if !search.controls.is_empty() && !self.version.supports_controls() {
            let err = ProtocolError::new(
                ResultCode::PROTOCOL_ERROR,
                "controls require protocol version 3",
            );
            return self.send(ResponseFrame::failure(id, err));
        }
        if search.controls.persistent().is_some() {
            return self.persistent_search(id, search);
        }

        match self.directory.search(&search, &mut self.paging) {
            Ok(outcome) => {
                for entry in outcome.entries {
                    self.send(ResponseFrame::entry(id, entry));
                }
                self.send(ResponseFrame::done(id, outcome.result, outcome.controls));
            }
            Err(e) => self.send(ResponseFrame::failure(id, e)),
        }
    }

    /// Send the initial result set (unless only changes were asked for),
    /// then follow the change feed until abandoned.
    fn persistent_search(&mut self, id: MessageId, search: WireSearch) {
        let filter = match Filter::parse(&search.filter) {
            Ok(filter) => filter,
            Err(e) => return self.send(ResponseFrame::failure(id, e.into())),
        };
        // Subscribe first so no change between the two phases is lost.
        let mut changes = self.directory.subscribe();
        match self.directory.search(&search, &mut self.paging) {
            Ok(outcome) => {
                for entry in outcome.entries {
                    self.send(ResponseFrame::entry(id, entry));
                }
            }
            Err(e) => return self.send(ResponseFrame::failure(id, e)),
        }

        let token = self.shutdown.child_token();
        self.persistent.insert(id, token.clone());
        let out = self.out.clone();
        debug!(id, base = %search.base, "persistent search started");
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = token.cancelled() => break,
                    notice = changes.recv() => notice,
                };
                match notice {
                    Ok(notice) => {
                        let Some(entry) = change_entry(&search, &filter, &notice) else {
                            continue;
                        };
                        if out.send(ResponseFrame::entry(id, entry)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(id, skipped, "persistent search fell behind, changes lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(id, "persistent search ended");
        });
    }

    fn abandon(&mut self, target: MessageId) {
        if let Some(token) = self.persistent.remove(&target) {
            token.cancel();
        }
        debug!(target, "abandon received");
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        for token in self.persistent.values() {
            token.cancel();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
