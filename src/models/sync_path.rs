//! 同步路径：本地目录与远程路径的配对

use super::transfer::SyncTransfer;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// 同步方向
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 远程 -> 本地
    Download,
    /// 本地 -> 远程
    Upload,
    #[default]
    Both,
}

/// 变更检测方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// 仅比较 size 与 mtime
    #[default]
    Fast,
    /// 额外比较内容 checksum
    Secure,
}

/// 双向模式下的冲突策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    #[default]
    Recent,
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerUnit {
    #[default]
    Disabled,
    Second,
    Minute,
    Hour,
    Day,
}

/// 自动同步周期
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub unit: SchedulerUnit,
    pub value: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            unit: SchedulerUnit::Disabled,
            value: 15,
        }
    }
}

impl Scheduler {
    /// 周期（秒），禁用时为 None
    pub fn interval_secs(&self) -> Option<u64> {
        let unit = match self.unit {
            SchedulerUnit::Disabled => return None,
            SchedulerUnit::Second => 1,
            SchedulerUnit::Minute => 60,
            SchedulerUnit::Hour => 3600,
            SchedulerUnit::Day => 86400,
        };
        Some(unit * self.value.max(1))
    }
}

/// 权限字符：a(添加)、m(修改)、d(删除)
pub const PERMISSION_ADD: char = 'a';
pub const PERMISSION_MODIFY: char = 'm';
pub const PERMISSION_DELETE: char = 'd';

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPath {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub diff_mode: DiffMode,
    #[serde(default)]
    pub conflict_mode: ConflictMode,
    /// 用户定义的路径正则
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub first_sync: bool,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_errors: Vec<SyncTransfer>,
    #[serde(default)]
    pub main_error: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub scheduler: Scheduler,
}

/// 允许通过设置修改的字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPathUpdate {
    pub mode: Option<SyncMode>,
    pub diff_mode: Option<DiffMode>,
    pub conflict_mode: Option<ConflictMode>,
    pub filters: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub scheduler: Option<Scheduler>,
    pub timestamp: Option<i64>,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub permissions: Option<String>,
}

impl SyncPath {
    pub fn new(id: u64, local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        let local_path = local_path.into();
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id,
            name,
            local_path,
            remote_path: normalize_remote_path(&remote_path.into()),
            mode: SyncMode::default(),
            diff_mode: DiffMode::default(),
            conflict_mode: ConflictMode::default(),
            filters: Vec::new(),
            enabled: true,
            first_sync: true,
            last_sync: None,
            last_errors: Vec::new(),
            main_error: None,
            timestamp: Utc::now().timestamp(),
            permissions: String::new(),
            scheduler: Scheduler::default(),
        }
    }

    pub fn is_download_mode(&self) -> bool {
        self.mode == SyncMode::Download
    }

    pub fn is_upload_mode(&self) -> bool {
        self.mode == SyncMode::Upload
    }

    pub fn is_both_mode(&self) -> bool {
        self.mode == SyncMode::Both
    }

    pub fn secure_diff(&self) -> bool {
        self.diff_mode == DiffMode::Secure
    }

    pub fn is_writeable(&self) -> bool {
        [PERMISSION_ADD, PERMISSION_MODIFY, PERMISSION_DELETE]
            .iter()
            .all(|p| self.permissions.contains(*p))
    }

    /// 用于日志显示的方向符号
    pub fn symbol(&self) -> &'static str {
        match self.mode {
            SyncMode::Both => "<->",
            SyncMode::Download => "<-",
            SyncMode::Upload => "->",
        }
    }

    /// 每次同步前的检查：清空上次的错误，确认本地目录存在，
    /// 无写权限时强制为下载模式
    pub fn checks(&mut self) -> Result<()> {
        self.last_errors.clear();
        self.main_error = None;
        if !self.local_path.is_dir() {
            return Err(SyncError::LocalRoot(
                self.local_path.display().to_string(),
            ));
        }
        if !self.is_writeable() && self.mode != SyncMode::Download {
            warn!(
                "同步路径 {} 没有写权限 ({}), 切换为下载模式",
                self.name, self.permissions
            );
            self.mode = SyncMode::Download;
        }
        Ok(())
    }

    pub fn local_real_path(&self, file_path: &str) -> PathBuf {
        local_join(&self.local_path, file_path)
    }

    /// 远程完整路径（不含 API 前缀）
    pub fn remote_full_path(&self, file_path: &str) -> String {
        join_posix(&[&self.remote_path, file_path])
    }

    /// `{api}/{remotePath}/{filePath}`，转义 URL 保留字符
    pub fn api_from_path(&self, api: &str, file_path: &str) -> String {
        escape_reserved_url_chars(&join_posix(&[api, &self.remote_path, file_path]))
    }

    /// 应用设置修改，返回实际修改的字段名
    pub fn update(&mut self, update: SyncPathUpdate) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let SyncPathUpdate {
            mode,
            diff_mode,
            conflict_mode,
            filters,
            enabled,
            scheduler,
            timestamp,
            local_path,
            remote_path,
            permissions,
        } = update;
        if let Some(v) = mode {
            self.mode = v;
            changed.push("mode");
        }
        if let Some(v) = diff_mode {
            self.diff_mode = v;
            changed.push("diffMode");
        }
        if let Some(v) = conflict_mode {
            self.conflict_mode = v;
            changed.push("conflictMode");
        }
        if let Some(v) = filters {
            self.filters = v;
            changed.push("filters");
        }
        if let Some(v) = enabled {
            self.enabled = v;
            changed.push("enabled");
        }
        if let Some(v) = scheduler {
            self.scheduler = v;
            changed.push("scheduler");
        }
        if let Some(v) = timestamp {
            self.timestamp = v;
            changed.push("timestamp");
        }
        if let Some(v) = local_path {
            self.local_path = v;
            changed.push("localPath");
        }
        if let Some(v) = remote_path {
            self.remote_path = normalize_remote_path(&v);
            changed.push("remotePath");
        }
        if let Some(v) = permissions {
            self.permissions = v;
            changed.push("permissions");
        }
        changed
    }

    /// 根据调度周期判断是否该同步
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(interval) = self.scheduler.interval_secs() else {
            return false;
        };
        match self.last_sync {
            None => true,
            Some(last) => (now - last).num_seconds() >= interval as i64,
        }
    }
}

pub fn normalize_remote_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn local_join(base: &Path, file_path: &str) -> PathBuf {
    if file_path.is_empty() {
        return base.to_path_buf();
    }
    file_path
        .split('/')
        .filter(|p| !p.is_empty())
        .fold(base.to_path_buf(), |acc, p| acc.join(p))
}

fn join_posix(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if parts.first().map(|p| p.starts_with('/')).unwrap_or(false) {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// 转义 `#` `?` `%` 和空格
pub fn escape_reserved_url_chars(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        match c {
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            _ => out.push(c),
        }
    }
    out
}
