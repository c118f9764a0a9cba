//! 内存中的远程存储，用于测试同步流程

use super::{
    DiffRequest, Download, LineStream, RemoteCopy, RemoteStorage, UploadRequest, SYNC_DIFF_DONE,
};
use crate::core::checksum::Checksum;
use crate::core::filter::{file_name, incomplete_path, PathFilter};
use crate::core::progress::TransferProgress;
use crate::core::snapshot::{is_child_of, rebase};
use crate::error::{Result, SyncError};
use crate::models::SyncPath;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub is_dir: bool,
    pub data: Vec<u8>,
    pub mtime: i64,
    pub ino: u64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, MemoryEntry>,
    next_ino: u64,
    ranges: Vec<u64>,
    operations: Vec<String>,
    ignore_range: bool,
    truncate_diff: bool,
    diff_requests: Vec<serde_json::Value>,
}

impl Inner {
    fn ino(&mut self) -> u64 {
        self.next_ino += 1;
        1_000_000 + self.next_ino
    }
}

#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn put_dir(&self, path: &str, mtime: i64) {
        let mut inner = self.lock();
        let ino = inner.ino();
        inner.entries.insert(
            path.to_string(),
            MemoryEntry {
                is_dir: true,
                data: Vec::new(),
                mtime,
                ino,
            },
        );
    }

    pub fn put_file(&self, path: &str, data: &[u8], mtime: i64) {
        let mut inner = self.lock();
        let ino = inner.ino();
        inner.entries.insert(
            path.to_string(),
            MemoryEntry {
                is_dir: false,
                data: data.to_vec(),
                mtime,
                ino,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<MemoryEntry> {
        self.lock().entries.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// 收到的 Range 请求（下载）与 Content-Range 起点（上传）
    pub fn ranges(&self) -> Vec<u64> {
        self.lock().ranges.clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    pub fn diff_requests(&self) -> Vec<serde_json::Value> {
        self.lock().diff_requests.clone()
    }

    /// 模拟不支持 Range 的服务器
    pub fn set_ignore_range(&self, ignore: bool) {
        self.lock().ignore_range = ignore;
    }

    /// diff 流不发送结束标记
    pub fn set_truncate_diff(&self, truncate: bool) {
        self.lock().truncate_diff = truncate;
    }
}

fn diff_line(path: &str, value: serde_json::Value) -> String {
    let mut record = serde_json::Map::new();
    record.insert(path.to_string(), value);
    serde_json::Value::Object(record).to_string()
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn diff(&self, _sync_path: &SyncPath, request: DiffRequest) -> Result<LineStream> {
        let user = request
            .path_filters
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        let mut inner = self.lock();
        inner.diff_requests.push(json!({
            "secureDiff": request.secure_diff,
            "firstSync": request.first_sync,
            "compressed": request.is_compressed(),
        }));
        let mut lines = Vec::new();
        let mut filtered_dirs: Vec<String> = Vec::new();
        for (path, e) in &inner.entries {
            if filtered_dirs.iter().any(|d| is_child_of(path, d)) {
                continue;
            }
            if PathFilter::is_default_filtered(file_name(path)) {
                continue;
            }
            if user.as_ref().map(|re| re.is_match(path)).unwrap_or(false) {
                if e.is_dir {
                    filtered_dirs.push(path.clone());
                }
                lines.push(diff_line(path, json!(["filtered", e.is_dir])));
                continue;
            }
            let checksum = (!e.is_dir && request.secure_diff).then(|| Checksum::of_bytes(&e.data));
            let size = if e.is_dir { 0 } else { e.data.len() as u64 };
            // 快速模式下服务器省略 checksum 字段
            let stat = match checksum {
                Some(c) => json!([e.is_dir, size, e.mtime, e.ino, c]),
                None => json!([e.is_dir, size, e.mtime, e.ino]),
            };
            lines.push(diff_line(path, stat));
        }
        if !inner.truncate_diff {
            lines.push(SYNC_DIFF_DONE.to_string());
        }
        Ok(Box::pin(futures::stream::iter(lines.into_iter().map(Ok))))
    }

    async fn download(&self, _sync_path: &SyncPath, path: &str, offset: u64) -> Result<Download> {
        let mut inner = self.lock();
        let entry = inner.entries.get(path).cloned().ok_or(SyncError::Http {
            status: 404,
            message: "Not Found".into(),
        })?;
        inner.operations.push(format!("download {}", path));
        let resumed = offset > 0 && !inner.ignore_range;
        let data = if resumed {
            inner.ranges.push(offset);
            entry.data[(offset as usize).min(entry.data.len())..].to_vec()
        } else {
            entry.data
        };
        // 分成两个块，验证流式写入
        let mid = data.len() / 2;
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&data[..mid])),
            Ok(Bytes::copy_from_slice(&data[mid..])),
        ];
        Ok(Download {
            stream: Box::pin(futures::stream::iter(chunks)),
            resumed,
        })
    }

    async fn upload(
        &self,
        _sync_path: &SyncPath,
        path: &str,
        request: UploadRequest,
        progress: Option<Arc<TransferProgress>>,
    ) -> Result<u64> {
        let content = tokio::fs::read(&request.source).await?;
        let tail = content
            .get(request.offset as usize..)
            .unwrap_or_default()
            .to_vec();
        if let Some(tp) = progress {
            tp.set_current(request.offset);
            tp.update(tail.len() as u64);
        }
        let mut inner = self.lock();
        let tmp = incomplete_path(path);
        let mut data = if request.offset > 0 {
            inner.ranges.push(request.offset);
            let mut head = inner
                .entries
                .get(&tmp)
                .map(|e| e.data.clone())
                .unwrap_or_default();
            head.truncate(request.offset as usize);
            head
        } else {
            Vec::new()
        };
        data.extend_from_slice(&tail);
        inner.entries.remove(&tmp);
        if data.len() as u64 != request.size {
            return Err(SyncError::Http {
                status: 400,
                message: "size mismatch".into(),
            });
        }
        if let Some(checksum) = &request.checksum {
            if &Checksum::of_bytes(&data) != checksum {
                return Err(SyncError::Http {
                    status: 400,
                    message: "checksum mismatch".into(),
                });
            }
        }
        let ino = inner.ino();
        inner.operations.push(format!("upload {}", path));
        inner.entries.insert(
            path.to_string(),
            MemoryEntry {
                is_dir: false,
                data,
                mtime: request.mtime,
                ino,
            },
        );
        Ok(ino)
    }

    async fn delete(&self, _sync_path: &SyncPath, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .entries
            .retain(|p, _| p != path && !is_child_of(p, path));
        inner.operations.push(format!("delete {}", path));
        Ok(())
    }

    async fn make(&self, _sync_path: &SyncPath, path: &str, is_dir: bool, mtime: i64) -> Result<u64> {
        let mut inner = self.lock();
        let ino = inner.ino();
        inner.entries.insert(
            path.to_string(),
            MemoryEntry {
                is_dir,
                data: Vec::new(),
                mtime,
                ino,
            },
        );
        inner.operations.push(format!("make {}", path));
        Ok(ino)
    }

    async fn rename(&self, _sync_path: &SyncPath, src: &str, dst: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.entries.contains_key(src) {
            return Err(SyncError::Http {
                status: 404,
                message: "Not Found".into(),
            });
        }
        let moved: Vec<String> = inner
            .entries
            .keys()
            .filter(|p| p.as_str() == src || is_child_of(p, src))
            .cloned()
            .collect();
        for p in moved {
            if let Some(e) = inner.entries.remove(&p) {
                inner.entries.insert(rebase(&p, src, dst), e);
            }
        }
        inner.operations.push(format!("move {} {}", src, dst));
        Ok(())
    }

    async fn copy(&self, _sync_path: &SyncPath, src: &str, dst: &str, mtime: i64) -> Result<RemoteCopy> {
        let mut inner = self.lock();
        let mut entry = inner.entries.get(src).cloned().ok_or(SyncError::Http {
            status: 404,
            message: "Not Found".into(),
        })?;
        entry.ino = inner.ino();
        entry.mtime = mtime;
        let result = RemoteCopy {
            ino: entry.ino,
            mtime,
        };
        inner.entries.insert(dst.to_string(), entry);
        inner.operations.push(format!("copy {} {}", src, dst));
        Ok(result)
    }

    async fn set_mtime(&self, _sync_path: &SyncPath, path: &str, mtime: i64) -> Result<()> {
        let mut inner = self.lock();
        match inner.entries.get_mut(path) {
            Some(e) => e.mtime = mtime,
            None => {
                return Err(SyncError::Http {
                    status: 404,
                    message: "Not Found".into(),
                })
            }
        }
        inner.operations.push(format!("props {}", path));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
