use crate::core::domain::{BatchId, FileId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// One file in a batch manifest: display name and size in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Delivery status carried in a chunk acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum AckStatus {
    Received,
    Error,
}

/// Everything that crosses the transfer channel, both directions.
///
/// The channel is reliable and ordered, so nothing here carries sequence
/// numbers; a chunk is implicitly the next bytes of its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum TransferMessage {
    /// Opens a batch: the full manifest, sent before any file data
    BatchStart {
        batch_id: BatchId,
        files: Vec<FileEntry>,
    },
    /// The receiver's accept/reject answer to `BatchStart`
    BatchDecision { batch_id: BatchId, approved: bool },
    /// Announces the next file of an approved batch
    FileMetadata {
        file_id: FileId,
        file_name: String,
        file_size: u64,
        batch_id: BatchId,
    },
    /// The next bytes of `file_id`, at most one unacknowledged at a time
    FileChunk { file_id: FileId, data: Vec<u8> },
    /// Receiver's answer to every `FileChunk`
    Ack {
        status: AckStatus,
        message: Option<String>,
    },
    /// All bytes of `file_id` have been sent
    FileEnd { file_id: FileId },
    /// Aggregate percent for the receiver's progress display
    BatchProgress { batch_id: BatchId, progress: f32 },
}

impl TransferMessage {
    /// Wire-style name of the variant, for log lines that must not dump
    /// chunk payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchStart { .. } => "batch-start",
            Self::BatchDecision { .. } => "batch-decision",
            Self::FileMetadata { .. } => "file-metadata",
            Self::FileChunk { .. } => "file-chunk",
            Self::Ack { .. } => "ack",
            Self::FileEnd { .. } => "file-end",
            Self::BatchProgress { .. } => "batch-progress",
        }
    }

    pub fn ack_received() -> Self {
        Self::Ack {
            status: AckStatus::Received,
            message: None,
        }
    }

    pub fn ack_error(message: impl Into<String>) -> Self {
        Self::Ack {
            status: AckStatus::Error,
            message: Some(message.into()),
        }
    }
}
