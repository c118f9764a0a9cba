use super::sync_path::SyncPath;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// 远程服务器及其同步路径
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: u64,
    pub name: String,
    /// 例如 `https://sync.example.com`
    pub url: String,
    /// 已认证的访问令牌（Bearer）
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_true")]
    pub available: bool,
    /// 并发运行所有同步路径
    #[serde(default)]
    pub parallel_sync: bool,
    #[serde(default)]
    pub sync_paths: Vec<SyncPath>,
}

impl Server {
    pub fn new(id: u64, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into().trim_end_matches('/').to_string(),
            access_token: None,
            available: true,
            parallel_sync: false,
            sync_paths: Vec::new(),
        }
    }

    pub fn find_path(&self, id: u64) -> Option<&SyncPath> {
        self.sync_paths.iter().find(|p| p.id == id)
    }

    pub fn find_path_mut(&mut self, id: u64) -> Option<&mut SyncPath> {
        self.sync_paths.iter_mut().find(|p| p.id == id)
    }

    /// 下一个可用的同步路径 id
    pub fn next_path_id(&self) -> u64 {
        self.sync_paths.iter().map(|p| p.id).max().unwrap_or(0) + 1
    }

    /// 移除同步路径，返回被移除的路径
    pub fn remove_path(&mut self, id: u64) -> Option<SyncPath> {
        let pos = self.sync_paths.iter().position(|p| p.id == id)?;
        Some(self.sync_paths.remove(pos))
    }
}
