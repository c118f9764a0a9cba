pub mod action;
pub mod checksum;
pub mod diff;
pub mod engine;
pub mod filter;
pub mod manager;
pub mod progress;
pub mod reduce;
pub mod report;
pub mod scanner;
pub mod snapshot;
pub mod stat;
pub mod store;
pub mod tasks;
pub mod transfer;

pub use action::{Action, ActionBatch, ActionKind, ActionPlan};
pub use engine::{EngineConfig, SyncEngine, SyncOutcome};
pub use manager::{due_paths, SyncManager};
pub use progress::{SyncContext, SyncEvent, SyncEvents, TransferReporter};
pub use snapshot::{Side, SidePair, Snapshot, SyncState};
pub use stat::FileStat;
pub use store::SnapshotStore;
