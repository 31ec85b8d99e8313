pub mod config;
pub mod core;
pub mod crypto;
pub mod discovery;
pub mod identity;
pub mod node;
pub mod transfer;
pub mod utils;

// Re-export the surface most callers and integration tests need
pub use config::AppConfig;
pub use core::{BatchOutcome, BatchState, CoreEvent, DeviceId, EventBus, FileId, FileState};
pub use discovery::{Beacon, BeaconService, DeviceRegistry};
pub use identity::Identity;
pub use node::Node;
pub use transfer::{IncomingBatchRequest, TransferError};
