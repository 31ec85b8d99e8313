use super::types::{FileEntry, TransferMessage};
use super::wire::{self, WireError};
use super::TransferError;
use crate::config::TransferConfig;
use crate::core::domain::{BatchId, DeviceEntry, FileId};
use crate::core::events::{CoreEvent, EventBus};
use crate::discovery::DeviceRegistry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A verified transfer request awaiting the collaborator's decision.
///
/// Delivered on the approvals channel; the session blocks until `approve` or
/// `reject` is called (or the request is dropped, which counts as a
/// rejection). Requests from addresses with no registered device never get
/// this far.
pub struct IncomingBatchRequest {
    pub batch_id: BatchId,
    pub device: DeviceEntry,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
    responder: oneshot::Sender<Decision>,
}

struct Decision {
    approved: bool,
    dest_dir: Option<PathBuf>,
}

impl IncomingBatchRequest {
    /// Accept the batch, optionally into a directory other than the default.
    pub fn approve(self, dest_dir: Option<PathBuf>) {
        let _ = self.responder.send(Decision {
            approved: true,
            dest_dir,
        });
    }

    pub fn reject(self) {
        let _ = self.responder.send(Decision {
            approved: false,
            dest_dir: None,
        });
    }
}

/// The listening half of the transfer endpoint.
///
/// Accepts connections from any peer and runs one independent session per
/// connection; all per-batch state lives inside the session task.
pub struct TransferListener {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    download_dir: PathBuf,
    approvals: mpsc::Sender<IncomingBatchRequest>,
}

impl TransferListener {
    /// Bind the endpoint and hand back the approvals receiver.
    pub async fn bind(
        config: &TransferConfig,
        registry: Arc<DeviceRegistry>,
        events: Arc<EventBus>,
        download_dir: PathBuf,
    ) -> io::Result<(Self, mpsc::Receiver<IncomingBatchRequest>)> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("transfer endpoint listening on {}", listener.local_addr()?);

        let (approvals, rx) = mpsc::channel(16);
        Ok((
            Self {
                listener,
                registry,
                events,
                download_dir,
                approvals,
            },
            rx,
        ))
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("inbound transfer connection from {}", peer);
                    let session = Session {
                        peer,
                        registry: self.registry.clone(),
                        events: self.events.clone(),
                        approvals: self.approvals.clone(),
                        default_dir: self.download_dir.clone(),
                        batch: None,
                        pending: HashMap::new(),
                        open: HashMap::new(),
                    };
                    tokio::spawn(session.run(stream));
                }
                Err(e) => {
                    warn!("transfer accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

struct ApprovedBatch {
    batch_id: BatchId,
    dest_dir: PathBuf,
}

/// Metadata received for a file whose first chunk has not arrived yet
struct PendingFile {
    name: String,
}

/// An open write target: bytes land in the `.part` file and the final name
/// appears only on the rename at `FileEnd`.
struct OpenFile {
    file: tokio::fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
    name: String,
}

/// One inbound connection's state machine. Everything here is task-local;
/// sessions on other connections share nothing but the registry and bus.
struct Session {
    peer: SocketAddr,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    approvals: mpsc::Sender<IncomingBatchRequest>,
    default_dir: PathBuf,
    batch: Option<ApprovedBatch>,
    pending: HashMap<FileId, PendingFile>,
    open: HashMap<FileId, OpenFile>,
}

impl Session {
    async fn run(mut self, mut stream: TcpStream) {
        loop {
            match wire::read_message(&mut stream).await {
                Ok(message) => {
                    if !self.handle(&mut stream, message).await {
                        break;
                    }
                }
                // Alignment survived; drop the frame and keep serving.
                Err(e @ WireError::Decode(_)) => {
                    warn!("dropping undecodable frame from {}: {}", self.peer, e);
                }
                Err(WireError::FrameTooLarge(len)) => {
                    warn!(
                        "closing connection from {}: oversized frame ({} bytes)",
                        self.peer, len
                    );
                    break;
                }
                Err(WireError::Io(e)) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        warn!("connection from {} failed: {}", self.peer, e);
                    }
                    break;
                }
            }
        }
        self.cleanup().await;
    }

    /// Returns false when the session should close.
    async fn handle(&mut self, stream: &mut TcpStream, message: TransferMessage) -> bool {
        match message {
            TransferMessage::BatchStart { batch_id, files } => {
                match self.handle_batch_start(stream, batch_id, files).await {
                    Ok(keep_serving) => keep_serving,
                    Err(e) => {
                        info!("refusing batch from {}: {}", self.peer, e);
                        false
                    }
                }
            }
            TransferMessage::FileMetadata {
                file_id,
                file_name,
                batch_id,
                ..
            } => {
                self.handle_file_metadata(file_id, file_name, batch_id);
                true
            }
            TransferMessage::FileChunk { file_id, data } => {
                let ack = self.handle_file_chunk(file_id, data).await;
                wire::write_message(stream, &ack).await.is_ok()
            }
            TransferMessage::FileEnd { file_id } => {
                self.handle_file_end(file_id).await;
                true
            }
            TransferMessage::BatchProgress { batch_id, progress } => {
                self.events
                    .publish(CoreEvent::BatchProgress {
                        batch_id,
                        percent: progress,
                    })
                    .await;
                true
            }
            other => {
                debug!("dropping unexpected {} from {}", other.kind(), self.peer);
                true
            }
        }
    }

    async fn handle_batch_start(
        &mut self,
        stream: &mut TcpStream,
        batch_id: BatchId,
        files: Vec<FileEntry>,
    ) -> Result<bool, TransferError> {
        if self.batch.is_some() {
            debug!("dropping second batch-start from {}", self.peer);
            return Ok(true);
        }

        // The remote address must belong to a device we have verified a
        // beacon from; anonymous connections never reach the approval
        // surface.
        let Some(device) = self.registry.find_by_ip(self.peer.ip()) else {
            let _ = self.send_decision(stream, &batch_id, false).await;
            return Err(TransferError::UnknownSender(self.peer.ip()));
        };

        let total_size = files.iter().map(|f| f.size).sum();
        let (responder, decision_rx) = oneshot::channel();
        let request = IncomingBatchRequest {
            batch_id: batch_id.clone(),
            device: device.clone(),
            files,
            total_size,
            responder,
        };

        // A missing or dropped collaborator is a rejection, never a hang.
        let decision = if self.approvals.send(request).await.is_ok() {
            decision_rx.await.unwrap_or(Decision {
                approved: false,
                dest_dir: None,
            })
        } else {
            Decision {
                approved: false,
                dest_dir: None,
            }
        };

        if !self.send_decision(stream, &batch_id, decision.approved).await {
            return Ok(false);
        }
        if decision.approved {
            info!("approved batch {} from '{}'", batch_id, device.name);
            self.batch = Some(ApprovedBatch {
                batch_id,
                dest_dir: decision.dest_dir.unwrap_or_else(|| self.default_dir.clone()),
            });
        } else {
            info!("rejected batch {} from '{}'", batch_id, device.name);
        }
        Ok(true)
    }

    async fn send_decision(&self, stream: &mut TcpStream, batch_id: &BatchId, approved: bool) -> bool {
        wire::write_message(
            stream,
            &TransferMessage::BatchDecision {
                batch_id: batch_id.clone(),
                approved,
            },
        )
        .await
        .is_ok()
    }

    fn handle_file_metadata(&mut self, file_id: FileId, file_name: String, batch_id: BatchId) {
        let Some(batch) = &self.batch else {
            debug!("dropping file-metadata from {}: no approved batch", self.peer);
            return;
        };
        if batch.batch_id != batch_id {
            debug!(
                "dropping file-metadata from {}: batch {} is not the approved one",
                self.peer, batch_id
            );
            return;
        }

        // Only the final path component is honored; a name like
        // "../../etc/cron.d/x" cannot escape the destination directory.
        let Some(name) = std::path::Path::new(&file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
        else {
            warn!(
                "dropping file-metadata from {}: unusable file name {:?}",
                self.peer, file_name
            );
            return;
        };

        self.pending.insert(file_id, PendingFile { name });
    }

    async fn handle_file_chunk(&mut self, file_id: FileId, data: Vec<u8>) -> TransferMessage {
        if !self.open.contains_key(&file_id) {
            // First chunk: create the write target now, not at metadata
            // time, so a rejected or abandoned file never touches disk.
            match self.open_target(&file_id).await {
                Ok(()) => {}
                Err(message) => return TransferMessage::ack_error(message),
            }
        }

        let Some(target) = self.open.get_mut(&file_id) else {
            return TransferMessage::ack_error("unknown file");
        };
        match tokio::io::AsyncWriteExt::write_all(&mut target.file, &data).await {
            Ok(()) => TransferMessage::ack_received(),
            Err(e) => {
                warn!("write failed for '{}': {}", target.name, e);
                // This file is dead; its siblings keep streaming.
                if let Some(dead) = self.open.remove(&file_id) {
                    drop(dead.file);
                    let _ = tokio::fs::remove_file(&dead.part_path).await;
                }
                TransferMessage::ack_error(format!("write failed: {}", e))
            }
        }
    }

    /// Open `<name>.part` in the destination directory for a file announced
    /// by metadata.
    async fn open_target(&mut self, file_id: &FileId) -> Result<(), String> {
        let Some(batch) = &self.batch else {
            return Err("no approved batch".to_string());
        };
        let Some(pending) = self.pending.remove(file_id) else {
            return Err("unknown file".to_string());
        };

        if let Err(e) = tokio::fs::create_dir_all(&batch.dest_dir).await {
            return Err(format!("cannot create destination directory: {}", e));
        }
        let final_path = batch.dest_dir.join(&pending.name);
        let part_path = batch.dest_dir.join(format!("{}.part", pending.name));
        let file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| format!("cannot create {}: {}", part_path.display(), e))?;

        self.open.insert(
            file_id.clone(),
            OpenFile {
                file,
                part_path,
                final_path,
                name: pending.name,
            },
        );
        Ok(())
    }

    async fn handle_file_end(&mut self, file_id: FileId) {
        // A zero-byte file sends metadata and file-end with no chunk in
        // between; give it its empty write target now.
        if !self.open.contains_key(&file_id) && self.pending.contains_key(&file_id) {
            if let Err(message) = self.open_target(&file_id).await {
                warn!("cannot finalize empty file from {}: {}", self.peer, message);
                return;
            }
        }

        let Some(mut target) = self.open.remove(&file_id) else {
            debug!("dropping file-end from {} for unknown file", self.peer);
            return;
        };

        if let Err(e) = tokio::io::AsyncWriteExt::flush(&mut target.file).await {
            warn!("flush failed for '{}': {}", target.name, e);
            let _ = tokio::fs::remove_file(&target.part_path).await;
            return;
        }
        drop(target.file);

        // The completed file appears under its final name atomically, or
        // not at all. An existing file of the same name is replaced.
        match tokio::fs::rename(&target.part_path, &target.final_path).await {
            Ok(()) => {
                info!("received '{}' -> {}", target.name, target.final_path.display());
                self.events
                    .publish(CoreEvent::FileReceived {
                        file_id,
                        name: target.name,
                        path: target.final_path,
                    })
                    .await;
            }
            Err(e) => {
                warn!("rename failed for '{}': {}", target.name, e);
                let _ = tokio::fs::remove_file(&target.part_path).await;
            }
        }
    }

    /// Discard-on-disconnect: every write target still open when the
    /// connection ends is destroyed and its `.part` file deleted. Nothing
    /// partial survives under a final name; resume is not supported.
    async fn cleanup(&mut self) {
        for (_, target) in self.open.drain() {
            debug!("discarding partial '{}' after disconnect", target.name);
            drop(target.file);
            let _ = tokio::fs::remove_file(&target.part_path).await;
        }
        self.pending.clear();
    }
}
