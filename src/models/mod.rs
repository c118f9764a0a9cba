pub mod server;
pub mod sync_path;
pub mod transfer;

pub use server::Server;
pub use sync_path::{
    ConflictMode, DiffMode, Scheduler, SchedulerUnit, SyncMode, SyncPath, SyncPathUpdate,
};
pub use transfer::{FileAction, SyncTransfer};
