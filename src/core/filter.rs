//! 过滤规则与未完成传输标记

use crate::error::{Result, SyncError};
use regex::Regex;
use tracing::{debug, trace};

/// 默认忽略的系统文件
pub const DEFAULT_FILTERS: &[&str] = &[
    ".DS_Store",
    ".swp",
    ".AppleDouble",
    ".AppleDesktop",
    "Thumbs.db",
    ".Spotlight-V100",
    ".DocumentRevisions-V100",
    ".fseventsd",
    ".MobileBackups",
    "Icon?",
    "__MACOSX",
    ".thumbnails",
    ".DAV",
    ".desktop",
    "desktop.ini",
    ".TemporaryItems",
    ".localized",
    "__pycache__",
];

/// 未完成传输文件的前缀
pub const INCOMPLETE_PREFIX: &str = ".sync-in.";

/// 未完成文件保留时间（秒）
pub const INCOMPLETE_RETENTION: i64 = 172_800;

pub fn is_incomplete(name: &str) -> bool {
    name.starts_with(INCOMPLETE_PREFIX)
}

/// `dir/name` -> `dir/.sync-in.name`
pub fn incomplete_path(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => format!("{}/{}{}", &path[..i], INCOMPLETE_PREFIX, &path[i + 1..]),
        None => format!("{}{}", INCOMPLETE_PREFIX, path),
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 路径过滤器：默认规则按文件名匹配，用户规则按相对路径匹配
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    user: Option<Regex>,
}

impl PathFilter {
    pub fn new(filters: &[String]) -> Result<Self> {
        let filters: Vec<&str> = filters
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect();
        if filters.is_empty() {
            return Ok(Self { user: None });
        }
        let user = Regex::new(&filters.join("|"))
            .map_err(|e| SyncError::transfer(format!("过滤规则无效: {}", e)))?;
        Ok(Self { user: Some(user) })
    }

    pub fn is_default_filtered(name: &str) -> bool {
        // macOS 的自定义图标文件名为 "Icon\r"
        DEFAULT_FILTERS.contains(&name) || name == "Icon\r"
    }

    pub fn is_filtered(&self, name: &str, path: &str) -> bool {
        if Self::is_default_filtered(name) {
            trace!("默认过滤: {}", path);
            return true;
        }
        if self.user.as_ref().map(|re| re.is_match(path)).unwrap_or(false) {
            debug!("用户过滤: {}", path);
            return true;
        }
        false
    }

    /// 发送给远程的合并正则
    pub fn pattern(&self) -> Option<String> {
        self.user.as_ref().map(|re| re.as_str().to_string())
    }
}
