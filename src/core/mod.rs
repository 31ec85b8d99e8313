pub mod domain;
pub mod events;

// Avoid wildcard re-exports to keep the public API explicit and lints clean
pub use domain::{BatchId, BatchOutcome, BatchState, DeviceEntry, DeviceId, FileId, FileReport, FileState};
pub use events::{CoreEvent, EventBus, EventHandler, LoggingEventHandler};
