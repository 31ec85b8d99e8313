use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use uuid::Uuid;

/// Stable identifier for a device on the local network.
///
/// Derived from the device's public key and display name, never from its
/// address, so it survives DHCP churn and re-announcements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strongly typed batch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strongly typed file identifier, allocated per file per batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct FileId(pub String);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device currently known to the registry
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub name: String,
    pub os: String,
    pub addr: IpAddr,
    pub expires_at: Instant,
}

/// How a finished batch ended. `Rejected` means no file data ever moved;
/// a `Completed` batch may still contain failed or canceled files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Completed,
    Rejected,
}

/// Terminal state of one file within an approved batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Complete,
    Failed { reason: String },
    Canceled,
}

/// Terminal state of one file from a finished batch
#[derive(Debug, Clone)]
pub struct FileReport {
    pub id: FileId,
    pub name: String,
    pub state: FileState,
}

/// What a finished `send_batch` call reports back.
///
/// One report per requested file; callers inspect the states to detect partial
/// failure. A rejected batch carries no file reports.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub state: BatchState,
    pub files: Vec<FileReport>,
}

impl BatchOutcome {
    /// Files that fully streamed and were acknowledged by the peer.
    pub fn completed(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.state == FileState::Complete)
    }

    pub fn is_fully_complete(&self) -> bool {
        self.state == BatchState::Completed
            && self.files.iter().all(|f| f.state == FileState::Complete)
    }
}
