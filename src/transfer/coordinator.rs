use super::types::{AckStatus, FileEntry, TransferMessage};
use super::{wire, TransferError};
use crate::config::TransferConfig;
use crate::core::domain::{BatchId, BatchOutcome, BatchState, DeviceId, FileId, FileReport, FileState};
use crate::core::events::{CoreEvent, EventBus};
use crate::discovery::DeviceRegistry;
use crate::utils;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Cancellation flag for one in-flight file.
///
/// Cancellation is local only: flipping the token stops the read/transmit
/// pipeline before the next chunk, but no cancel message crosses the wire.
/// The receiver just sees the stream stop and cleans up on disconnect.
#[derive(Clone, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How one file's streaming ended, when not cleanly.
#[derive(Debug)]
pub enum StreamEnd {
    /// The local abort token was flipped
    Canceled,
    /// This file failed but the connection is still usable
    Failed(String),
    /// The socket itself died; remaining files cannot be sent
    ConnectionLost(String),
}

/// Drives outbound batches: handshake, sequential per-file streaming with
/// per-chunk acknowledgment backpressure, progress events, cancellation.
pub struct TransferCoordinator {
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    config: TransferConfig,
    /// Abort tokens for files currently streaming, keyed by file id
    active: Mutex<HashMap<FileId, AbortToken>>,
}

impl TransferCoordinator {
    pub fn new(registry: Arc<DeviceRegistry>, events: Arc<EventBus>, config: TransferConfig) -> Self {
        Self {
            registry,
            events,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Abort an in-flight file. Returns false if the file is not streaming
    /// (unknown id, already finished, or never started).
    pub fn cancel_file(&self, file_id: &FileId) -> bool {
        match self.active.lock().unwrap().get(file_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Send a batch of files to a discovered device.
    ///
    /// Fails whole before any file data moves: unknown/expired target, an
    /// unreadable path in the manifest, connect exhaustion, or a broken
    /// handshake. After approval, per-file failures are isolated; the
    /// outcome lists every requested file with its terminal state and
    /// callers diff it against the request to detect partial failure.
    pub async fn send_batch(
        &self,
        target: &DeviceId,
        paths: &[PathBuf],
    ) -> Result<BatchOutcome, TransferError> {
        let ip = self
            .registry
            .lookup(target)
            .ok_or_else(|| TransferError::DeviceNotFound(target.clone()))?;

        // Stat everything up front; a bad path fails the call before the
        // peer ever sees a handshake.
        let mut manifest: Vec<(PathBuf, FileEntry)> = Vec::with_capacity(paths.len());
        for path in paths {
            let manifest_err = |source: io::Error| TransferError::Manifest {
                path: path.display().to_string(),
                source,
            };
            let meta = tokio::fs::metadata(path).await.map_err(manifest_err)?;
            if !meta.is_file() {
                return Err(manifest_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not a regular file",
                )));
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(String::from)
                .ok_or_else(|| {
                    manifest_err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "path has no usable file name",
                    ))
                })?;
            manifest.push((
                path.clone(),
                FileEntry {
                    name,
                    size: meta.len(),
                },
            ));
        }
        let total_size: u64 = manifest.iter().map(|(_, f)| f.size).sum();

        let addr = SocketAddr::new(ip, self.config.dial_port());
        let mut stream = self.connect(addr).await?;

        let batch_id = BatchId::new();
        info!(
            "batch {} -> {}: {} file(s), {} bytes",
            batch_id,
            target,
            manifest.len(),
            total_size
        );

        wire::write_message(
            &mut stream,
            &TransferMessage::BatchStart {
                batch_id: batch_id.clone(),
                files: manifest.iter().map(|(_, f)| f.clone()).collect(),
            },
        )
        .await
        .map_err(|_| TransferError::HandshakeClosed)?;

        if !self.await_decision(&mut stream).await? {
            info!("batch {} rejected by peer", batch_id);
            self.events
                .publish(CoreEvent::BatchRejected {
                    batch_id: batch_id.clone(),
                })
                .await;
            return Ok(BatchOutcome {
                batch_id,
                state: BatchState::Rejected,
                files: Vec::new(),
            });
        }
        self.events
            .publish(CoreEvent::BatchApproved {
                batch_id: batch_id.clone(),
            })
            .await;

        // Files go one at a time; a file fully finishes before the next
        // starts, so progress accounting never interleaves.
        let mut sent_total: u64 = 0;
        let mut reports: Vec<FileReport> = Vec::with_capacity(manifest.len());
        let mut link_down = false;

        for (path, entry) in &manifest {
            let file_id = FileId::new();
            let token = AbortToken::new();
            self.active
                .lock()
                .unwrap()
                .insert(file_id.clone(), token.clone());

            let result = if link_down {
                Err(StreamEnd::ConnectionLost(
                    "connection already lost".to_string(),
                ))
            } else {
                stream_file(
                    &mut stream,
                    &self.events,
                    &batch_id,
                    &file_id,
                    entry,
                    path,
                    self.config.chunk_size,
                    &token,
                    &mut sent_total,
                    total_size,
                )
                .await
            };
            self.active.lock().unwrap().remove(&file_id);

            let state = match result {
                Ok(()) => {
                    self.events
                        .publish(CoreEvent::FileCompleted {
                            file_id: file_id.clone(),
                            name: entry.name.clone(),
                        })
                        .await;
                    // Feed the receiver's aggregate display after each
                    // completed file.
                    let progress = aggregate_percent(sent_total, total_size);
                    if wire::write_message(
                        &mut stream,
                        &TransferMessage::BatchProgress {
                            batch_id: batch_id.clone(),
                            progress,
                        },
                    )
                    .await
                    .is_err()
                    {
                        link_down = true;
                    }
                    FileState::Complete
                }
                Err(StreamEnd::Canceled) => {
                    self.events
                        .publish(CoreEvent::FileCanceled {
                            file_id: file_id.clone(),
                            name: entry.name.clone(),
                        })
                        .await;
                    FileState::Canceled
                }
                Err(StreamEnd::Failed(reason)) => {
                    self.events
                        .publish(CoreEvent::FileFailed {
                            file_id: file_id.clone(),
                            name: entry.name.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    FileState::Failed { reason }
                }
                Err(StreamEnd::ConnectionLost(reason)) => {
                    link_down = true;
                    self.events
                        .publish(CoreEvent::FileFailed {
                            file_id: file_id.clone(),
                            name: entry.name.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    FileState::Failed { reason }
                }
            };
            reports.push(FileReport {
                id: file_id,
                name: entry.name.clone(),
                state,
            });
        }

        let completed = reports
            .iter()
            .filter(|r| r.state == FileState::Complete)
            .count();
        self.events
            .publish(CoreEvent::BatchCompleted {
                batch_id: batch_id.clone(),
                completed,
                requested: reports.len(),
            })
            .await;

        Ok(BatchOutcome {
            batch_id,
            state: BatchState::Completed,
            files: reports,
        })
    }

    /// Wait for the peer's accept/reject answer. Unbounded: a human may be
    /// looking at a dialog. Anything that is not a decision is dropped.
    async fn await_decision<S>(&self, stream: &mut S) -> Result<bool, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match wire::read_message(stream).await {
                Ok(TransferMessage::BatchDecision { approved, .. }) => return Ok(approved),
                Ok(other) => {
                    debug!("ignoring {} while awaiting batch decision", other.kind());
                }
                Err(e) if e.is_recoverable() => {
                    debug!("ignoring undecodable frame while awaiting batch decision");
                }
                Err(_) => return Err(TransferError::HandshakeClosed),
            }
        }
    }

    /// Time-bounded connect with a small retry budget and jittered pauses.
    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransferError> {
        let attempts = self.config.connect_attempts;
        let mut last_err = io::Error::new(io::ErrorKind::Other, "no connection attempt made");

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    warn!("connect to {} failed (attempt {}): {}", addr, attempt, e);
                    last_err = e;
                }
                Err(_) => {
                    warn!("connect to {} timed out (attempt {})", addr, attempt);
                    last_err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                }
            }
            if attempt < attempts {
                let pause = rand::thread_rng().gen_range(100..400);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }

        Err(TransferError::Connection {
            addr,
            attempts,
            source: last_err,
        })
    }
}

/// Stream one file over an already-approved connection.
///
/// Strict per-file backpressure: one chunk goes out, then nothing else until
/// its acknowledgment arrives. Progress events fire after every ack, and a
/// zero-length file reports 100 percent exactly once. Generic over the
/// stream so tests can drive it against an in-memory duplex.
#[allow(clippy::too_many_arguments)]
pub async fn stream_file<S>(
    stream: &mut S,
    events: &EventBus,
    batch_id: &BatchId,
    file_id: &FileId,
    entry: &FileEntry,
    path: &Path,
    chunk_size: usize,
    token: &AbortToken,
    sent_total: &mut u64,
    total_size: u64,
) -> Result<(), StreamEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_message(
        stream,
        &TransferMessage::FileMetadata {
            file_id: file_id.clone(),
            file_name: entry.name.clone(),
            file_size: entry.size,
            batch_id: batch_id.clone(),
        },
    )
    .await
    .map_err(|e| StreamEnd::ConnectionLost(e.to_string()))?;

    if entry.size == 0 {
        wire::write_message(stream, &TransferMessage::FileEnd { file_id: file_id.clone() })
            .await
            .map_err(|e| StreamEnd::ConnectionLost(e.to_string()))?;
        publish_progress(events, batch_id, file_id, entry, 0, *sent_total, total_size).await;
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StreamEnd::Failed(format!("open: {}", e)))?;
    debug!(
        "streaming '{}': {} in {} chunk(s)",
        entry.name,
        utils::format_size(entry.size),
        utils::calculate_chunks(entry.size, chunk_size)
    );
    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    while sent < entry.size {
        if token.is_canceled() {
            return Err(StreamEnd::Canceled);
        }

        // Never read past the manifested size; a file that grew underneath
        // us is truncated to what the peer approved.
        let remaining = (entry.size - sent).min(chunk_size as u64) as usize;
        let n = file
            .read(&mut buf[..remaining])
            .await
            .map_err(|e| StreamEnd::Failed(format!("read: {}", e)))?;
        if n == 0 {
            return Err(StreamEnd::Failed("file shrank while streaming".to_string()));
        }

        wire::write_message(
            stream,
            &TransferMessage::FileChunk {
                file_id: file_id.clone(),
                data: buf[..n].to_vec(),
            },
        )
        .await
        .map_err(|e| StreamEnd::ConnectionLost(e.to_string()))?;

        await_ack(stream).await?;

        sent += n as u64;
        *sent_total += n as u64;
        publish_progress(events, batch_id, file_id, entry, sent, *sent_total, total_size).await;
    }

    wire::write_message(stream, &TransferMessage::FileEnd { file_id: file_id.clone() })
        .await
        .map_err(|e| StreamEnd::ConnectionLost(e.to_string()))?;
    Ok(())
}

/// Block until the receiver acknowledges the outstanding chunk.
async fn await_ack<S>(stream: &mut S) -> Result<(), StreamEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match wire::read_message(stream).await {
            Ok(TransferMessage::Ack {
                status: AckStatus::Received,
                ..
            }) => return Ok(()),
            Ok(TransferMessage::Ack {
                status: AckStatus::Error,
                message,
            }) => {
                return Err(StreamEnd::Failed(
                    message.unwrap_or_else(|| "receiver reported an error".to_string()),
                ));
            }
            Ok(other) => {
                debug!("ignoring {} while awaiting chunk ack", other.kind());
            }
            Err(e) if e.is_recoverable() => {
                debug!("ignoring undecodable frame while awaiting chunk ack");
            }
            Err(e) => return Err(StreamEnd::ConnectionLost(e.to_string())),
        }
    }
}

async fn publish_progress(
    events: &EventBus,
    batch_id: &BatchId,
    file_id: &FileId,
    entry: &FileEntry,
    sent: u64,
    sent_total: u64,
    total_size: u64,
) {
    let file_percent = if entry.size == 0 {
        100.0
    } else {
        (sent as f32 / entry.size as f32) * 100.0
    };
    events
        .publish(CoreEvent::FileProgress {
            file_id: file_id.clone(),
            name: entry.name.clone(),
            percent: file_percent,
        })
        .await;
    events
        .publish(CoreEvent::BatchProgress {
            batch_id: batch_id.clone(),
            percent: aggregate_percent(sent_total, total_size),
        })
        .await;
}

fn aggregate_percent(sent_total: u64, total_size: u64) -> f32 {
    if total_size == 0 {
        100.0
    } else {
        (sent_total as f32 / total_size as f32) * 100.0
    }
}
