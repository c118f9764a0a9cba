pub mod http;
pub mod local;
#[cfg(test)]
pub mod memory;

use crate::core::progress::TransferProgress;
use crate::core::snapshot::Snapshot;
use crate::error::Result;
use crate::models::SyncPath;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

pub use http::{HttpRemote, RetryPolicy};

// ============ 公共常量 ============

pub const API_SYNC: &str = "/api/app/sync";
/// 远程遍历
pub const API_DIFF: &str = "/api/app/sync/operation/diff";
/// 文件操作
pub const API_OPERATION: &str = "/api/app/sync/operation";
/// diff 流的结束标记
pub const SYNC_DIFF_DONE: &str = "done";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// 远程遍历请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub secure_diff: bool,
    pub first_sync: bool,
    pub default_filters: Vec<String>,
    pub path_filters: Option<String>,
    /// 非首次同步的 secure 模式下附带上次的远程快照，请求体 gzip 压缩
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl DiffRequest {
    pub fn is_compressed(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// 下载响应
pub struct Download {
    pub stream: ByteStream,
    /// 服务器接受了 Range 请求（206）
    pub resumed: bool,
}

/// 上传参数
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// PUT 覆盖已有文件，否则 POST 新建
    pub diff: bool,
    pub source: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub checksum: Option<String>,
    /// 续传起始位置
    pub offset: u64,
}

impl UploadRequest {
    pub fn content_length(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }

    /// `bytes {start}-{end}/{total}`，非续传时为 None
    pub fn content_range(&self) -> Option<String> {
        (self.offset > 0).then(|| {
            format!(
                "bytes {}-{}/{}",
                self.offset,
                self.size.saturating_sub(1),
                self.size
            )
        })
    }
}

/// 远程复制的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCopy {
    pub ino: u64,
    pub mtime: i64,
}

/// 同步服务器的远程接口
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// 以 NDJSON 行流返回远程树
    async fn diff(&self, sync_path: &SyncPath, request: DiffRequest) -> Result<LineStream>;

    /// 下载文件，`offset > 0` 时请求 `Range: bytes={offset}-`
    async fn download(&self, sync_path: &SyncPath, path: &str, offset: u64) -> Result<Download>;

    /// 上传文件，返回远程 ino
    async fn upload(
        &self,
        sync_path: &SyncPath,
        path: &str,
        request: UploadRequest,
        progress: Option<Arc<TransferProgress>>,
    ) -> Result<u64>;

    async fn delete(&self, sync_path: &SyncPath, path: &str) -> Result<()>;

    /// 创建空目录或空文件，返回远程 ino
    async fn make(&self, sync_path: &SyncPath, path: &str, is_dir: bool, mtime: i64)
        -> Result<u64>;

    async fn rename(&self, sync_path: &SyncPath, src: &str, dst: &str) -> Result<()>;

    async fn copy(&self, sync_path: &SyncPath, src: &str, dst: &str, mtime: i64)
        -> Result<RemoteCopy>;

    /// 修改 mtime
    async fn set_mtime(&self, sync_path: &SyncPath, path: &str, mtime: i64) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range() {
        let mut req = UploadRequest {
            diff: false,
            source: PathBuf::from("/tmp/x"),
            size: 5000,
            mtime: 0,
            checksum: None,
            offset: 0,
        };
        assert_eq!(req.content_range(), None);
        assert_eq!(req.content_length(), 5000);
        req.offset = 1000;
        assert_eq!(req.content_range().unwrap(), "bytes 1000-4999/5000");
        assert_eq!(req.content_length(), 4000);
    }

    #[test]
    fn test_diff_request_json() {
        let req = DiffRequest {
            secure_diff: true,
            first_sync: false,
            default_filters: vec![".DS_Store".into()],
            path_filters: None,
            snapshot: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["secureDiff"], true);
        assert_eq!(json["pathFilters"], serde_json::Value::Null);
        assert!(json.get("snapshot").is_none());
        assert!(!req.is_compressed());
    }
}
