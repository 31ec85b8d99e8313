pub mod coordinator;
pub mod inbound;
pub mod types;
pub mod wire;

pub use coordinator::{AbortToken, TransferCoordinator};
pub use inbound::{IncomingBatchRequest, TransferListener};
pub use types::{AckStatus, FileEntry, TransferMessage};

use crate::core::domain::{DeviceId, FileId};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Transfer failure taxonomy.
///
/// `Stream` is the only variant scoped below a whole batch: one file's
/// mid-stream failure is reported through events and its siblings continue.
/// Everything else fails the operation before any file data moves.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("device {0} is not known (never seen or expired)")]
    DeviceNotFound(DeviceId),

    #[error("no registered device announces from {0}")]
    UnknownSender(IpAddr),

    #[error("cannot read {path}: {source}")]
    Manifest {
        path: String,
        source: std::io::Error,
    },

    #[error("could not connect to {addr} after {attempts} attempt(s): {source}")]
    Connection {
        addr: SocketAddr,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("connection lost while awaiting the batch decision")]
    HandshakeClosed,

    #[error("stream failure for file {file_id}: {reason}")]
    Stream { file_id: FileId, reason: String },
}
