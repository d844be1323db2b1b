//! Replication protocol state machine for one connection.
//!
//! A [`Replicator`] turns each inbound command into zero or more replies.
//! It owns the receiving side of every file transfer running on its
//! connection; when the connection ends, [`Replicator::abandon_all`]
//! releases whatever was left half-done.

use crate::error::{StoreError, StoreResult};
use crate::node::Node;
use crate::protocol::max_chunk_len;
use peersync_core::{ends_file, ChunkRequest, Progress, TransferSession};
use peersync_types::{
    BytesRequest, BytesResponse, Command, DirectoryRequest, DirectoryResponse, FileMeta,
    FileRequest, FileResponse, PeerAddress, Status,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn status_of(result: &StoreResult<()>) -> Status {
    match result {
        Ok(()) => Status::Ok,
        Err(e) => Status::refused(e.to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
enum FileOp {
    Create,
    Modify,
}

/// Per-connection command handler.
pub struct Replicator {
    node: Arc<Node>,
    peer: PeerAddress,
    /// Paths reserved in the store on behalf of this connection.
    reserved: HashSet<String>,
    /// Transfers that have received their first chunk.
    sessions: HashMap<String, TransferSession>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("peer", &self.peer)
            .field("reserved", &self.reserved.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Replicator {
    /// Create a handler for the connection to `peer`.
    pub fn new(node: Arc<Node>, peer: PeerAddress) -> Self {
        Self {
            node,
            peer,
            reserved: HashSet::new(),
            sessions: HashMap::new(),
        }
    }

    fn block_size(&self) -> u64 {
        self.node.config().sync.block_size
    }

    /// Handle one command from the peer, returning the replies in order.
    pub async fn handle(&mut self, command: Command) -> Vec<Command> {
        match command {
            Command::FileCreateRequest(request) => self.on_file_request(FileOp::Create, request).await,
            Command::FileModifyRequest(request) => self.on_file_request(FileOp::Modify, request).await,
            Command::FileDeleteRequest(request) => {
                let result = self
                    .node
                    .store()
                    .delete_path(&request.path_name, &request.file_descriptor)
                    .await;
                self.log_outcome("delete", &request.path_name, &result);
                vec![Command::FileDeleteResponse(FileResponse {
                    status: status_of(&result),
                    path_name: request.path_name,
                    file_descriptor: request.file_descriptor,
                })]
            }
            Command::DirectoryCreateRequest(DirectoryRequest { path_name }) => {
                let result = self.node.store().create_directory(&path_name).await;
                self.log_outcome("mkdir", &path_name, &result);
                vec![Command::DirectoryCreateResponse(DirectoryResponse {
                    status: status_of(&result),
                    path_name,
                })]
            }
            Command::DirectoryDeleteRequest(DirectoryRequest { path_name }) => {
                let result = self.node.store().delete_directory(&path_name).await;
                self.log_outcome("rmdir", &path_name, &result);
                vec![Command::DirectoryDeleteResponse(DirectoryResponse {
                    status: status_of(&result),
                    path_name,
                })]
            }
            Command::FileBytesRequest(request) => vec![self.serve_bytes(request).await],
            Command::FileBytesResponse(response) => self.on_bytes(response).await.into_iter().collect(),

            Command::FileCreateResponse(r)
            | Command::FileModifyResponse(r)
            | Command::FileDeleteResponse(r) => {
                tracing::debug!("{} answered {}: {}", self.peer, r.path_name, r.status);
                Vec::new()
            }
            Command::DirectoryCreateResponse(r) | Command::DirectoryDeleteResponse(r) => {
                tracing::debug!("{} answered {}: {}", self.peer, r.path_name, r.status);
                Vec::new()
            }

            Command::HandshakeRequest(_) => {
                tracing::warn!("{} sent a second handshake", self.peer);
                self.node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
                vec![Command::invalid_protocol("handshake already completed")]
            }
            Command::HandshakeResponse(_) | Command::ConnectionRefused(_) => {
                tracing::debug!("Ignoring late handshake reply from {}", self.peer);
                Vec::new()
            }
            Command::InvalidProtocol(notice) | Command::ConnectionExists(notice) => {
                tracing::warn!("{} reported a protocol problem: {}", self.peer, notice.message);
                Vec::new()
            }
            Command::Heartbeat => Vec::new(),
        }
    }

    fn log_outcome(&self, what: &str, path: &str, result: &StoreResult<()>) {
        match result {
            Ok(()) => tracing::info!("{} {} for {}", what, path, self.peer),
            Err(e) => tracing::debug!("Refused {} {} for {}: {}", what, path, self.peer, e),
        }
    }

    async fn on_file_request(&mut self, op: FileOp, request: FileRequest) -> Vec<Command> {
        let FileRequest {
            path_name,
            file_descriptor,
        } = request;

        let result = if self.reserved.contains(&path_name) {
            Err(StoreError::TransferInProgress {
                path: path_name.clone(),
            })
        } else {
            let store = self.node.store();
            match op {
                FileOp::Create => store.create_path(&path_name, &file_descriptor).await,
                FileOp::Modify => store.modify_path(&path_name, &file_descriptor).await,
            }
        };
        self.log_outcome(
            match op {
                FileOp::Create => "create",
                FileOp::Modify => "modify",
            },
            &path_name,
            &result,
        );

        let response = FileResponse {
            path_name: path_name.clone(),
            file_descriptor: file_descriptor.clone(),
            status: status_of(&result),
        };
        let mut replies = vec![match op {
            FileOp::Create => Command::FileCreateResponse(response),
            FileOp::Modify => Command::FileModifyResponse(response),
        }];

        if result.is_ok() {
            self.reserved.insert(path_name.clone());
            match TransferSession::first_chunk(&file_descriptor, self.block_size()) {
                Some(chunk) => replies.push(self.request_chunk(&path_name, &file_descriptor, chunk)),
                None => self.complete(&path_name, &file_descriptor).await,
            }
        }
        replies
    }

    fn request_chunk(&self, path: &str, meta: &FileMeta, chunk: ChunkRequest) -> Command {
        self.node.metrics().byte_requests_sent.fetch_add(1, Ordering::Relaxed);
        Command::FileBytesRequest(BytesRequest {
            path_name: path.to_string(),
            file_descriptor: meta.clone(),
            position: chunk.position,
            length: chunk.length,
        })
    }

    async fn serve_bytes(&self, request: BytesRequest) -> Command {
        let BytesRequest {
            path_name,
            file_descriptor,
            position,
            length,
        } = request;
        let length = length.min(max_chunk_len());

        let read = self
            .node
            .store()
            .read_range(&path_name, &file_descriptor, position, length)
            .await;
        self.node.metrics().byte_responses_sent.fetch_add(1, Ordering::Relaxed);

        let response = match read {
            Ok(content) => {
                let length = content.len() as u64;
                BytesResponse {
                    done: ends_file(position, length, file_descriptor.file_size),
                    path_name,
                    file_descriptor,
                    position,
                    length,
                    content,
                    status: Status::Ok,
                }
            }
            Err(e) => {
                tracing::debug!("Cannot serve {} to {}: {}", path_name, self.peer, e);
                BytesResponse {
                    path_name,
                    file_descriptor,
                    position,
                    length: 0,
                    content: Vec::new(),
                    done: false,
                    status: Status::refused(e.to_string()),
                }
            }
        };
        Command::FileBytesResponse(response)
    }

    async fn on_bytes(&mut self, response: BytesResponse) -> Option<Command> {
        let path = response.path_name.clone();
        if !self.reserved.contains(&path) {
            tracing::debug!("Ignoring bytes for {} from {}: no transfer", path, self.peer);
            return None;
        }
        if !response.status.is_ok() {
            tracing::warn!("{} refused bytes of {}: {}", self.peer, path, response.status);
            self.fail(&path).await;
            return None;
        }

        if !self.sessions.contains_key(&path) {
            if response.position != 0 {
                tracing::warn!("First chunk of {} from {} not at offset 0", path, self.peer);
                self.fail(&path).await;
                return None;
            }
            let session = TransferSession::new(response.file_descriptor.clone(), self.block_size());
            self.sessions.insert(path.clone(), session);
        }
        let session = self.sessions.get_mut(&path)?;
        if session.meta() != &response.file_descriptor {
            tracing::warn!("{} switched versions of {} mid-transfer", self.peer, path);
            self.fail(&path).await;
            return None;
        }

        let progress = match session.accept(
            response.position,
            response.length,
            response.content.len() as u64,
            response.done,
        ) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::warn!("Bad chunk of {} from {}: {}", path, self.peer, e);
                self.fail(&path).await;
                return None;
            }
        };
        let meta = session.meta().clone();

        if let Err(e) = self
            .node
            .store()
            .write_range(&path, response.position, &response.content)
            .await
        {
            tracing::warn!("Cannot write {}: {}", path, e);
            self.fail(&path).await;
            return None;
        }

        match progress {
            Progress::Next(chunk) => Some(self.request_chunk(&path, &meta, chunk)),
            Progress::Complete => {
                self.complete(&path, &meta).await;
                None
            }
        }
    }

    async fn complete(&mut self, path: &str, meta: &FileMeta) {
        self.sessions.remove(path);
        self.reserved.remove(path);
        match self.node.store().finalize(path, meta).await {
            Ok(()) => {
                self.node.metrics().transfers_completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Received {} ({} bytes) from {}", path, meta.file_size, self.peer);
            }
            Err(e) => {
                self.node.metrics().transfers_failed.fetch_add(1, Ordering::Relaxed);
                // The store has already released the reservation.
                tracing::warn!("Discarded {} from {}: {}", path, self.peer, e);
            }
        }
    }

    async fn fail(&mut self, path: &str) {
        self.sessions.remove(path);
        self.reserved.remove(path);
        self.node.metrics().transfers_failed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.node.store().abandon(path).await {
            tracing::warn!("Cannot release {}: {}", path, e);
        }
    }

    /// Release every transfer still running on this connection.
    pub async fn abandon_all(&mut self) {
        let paths: Vec<String> = self.reserved.drain().collect();
        self.sessions.clear();
        for path in paths {
            tracing::debug!("Abandoning {} after losing {}", path, self.peer);
            self.node.metrics().transfers_failed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.node.store().abandon(&path).await {
                tracing::warn!("Cannot release {}: {}", path, e);
            }
        }
    }
}
