pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

pub use crate::core::{EngineConfig, SyncEngine, SyncEvents, SyncManager};
pub use error::{Result, SyncError};
pub use models::{Server, SyncMode, SyncPath};

/// 配置目录
pub mod dirs {
    use std::path::PathBuf;

    /// 覆盖配置目录的环境变量
    pub const CONFIG_DIR_ENV: &str = "SYNCIN_CONFIG_DIR";

    pub fn config_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA")
                .map(|p| PathBuf::from(p).join("Sync-in-Profile"))
                .unwrap_or_else(|_| PathBuf::from(".sync-in"))
        } else {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".sync-in"))
                .unwrap_or_else(|_| PathBuf::from(".sync-in"))
        }
    }

    pub fn snapshots_dir(config_dir: &std::path::Path) -> PathBuf {
        config_dir.join("snapshots")
    }
}
