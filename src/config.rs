//! 应用配置：`servers.json`

use crate::core::engine::EngineConfig;
use crate::logging::LogConfig;
use crate::models::Server;
use crate::storage::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE: &str = "servers.json";

/// 同步引擎参数（可选，缺省时使用默认值）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub fast_workers: usize,
    pub slow_workers: usize,
    pub props_workers: usize,
    /// 进入慢队列并跟踪进度的文件大小（MB）
    pub large_size_mb: u64,
    /// 可续传的最小文件大小（MB）
    pub resume_size_mb: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fast_workers: 3,
            slow_workers: 1,
            props_workers: 2,
            large_size_mb: 10,
            resume_size_mb: 20,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl EngineSettings {
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.tasks.fast = self.fast_workers.max(1);
        config.tasks.slow = self.slow_workers.max(1);
        config.tasks.props = self.props_workers.max(1);
        config.tasks.large_size = self.large_size_mb * 1024 * 1024;
        config.transfer.resume_min_size = self.resume_size_mb * 1024 * 1024;
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// `servers.json` 的内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Settings {
    pub fn file_path(config_dir: &Path) -> PathBuf {
        config_dir.join(SETTINGS_FILE)
    }

    /// 读取配置，文件不存在时返回默认值
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::file_path(config_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("无法读取 {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("配置文件格式错误: {}", path.display()))
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let path = Self::file_path(config_dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("无法写入 {}", tmp.display()))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// 按 id 或名称查找服务器
    pub fn find_server(&self, key: &str) -> Option<&Server> {
        self.servers
            .iter()
            .find(|s| s.name == key || s.id.to_string() == key)
    }

    pub fn find_server_mut(&mut self, id: u64) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }
}
