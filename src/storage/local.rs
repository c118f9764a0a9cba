//! 本地文件系统操作

use super::ByteStream;
use crate::core::checksum::Checksum;
use crate::core::progress::TransferProgress;
use crate::core::stat::FileStat;
use crate::error::Result;
use futures::TryStreamExt;
use std::fs::{FileTimes, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 删除本地文件时的回收站钩子（未设置时直接删除）
pub trait TrashHook: Send + Sync {
    fn trash(&self, path: &Path) -> io::Result<()>;
}

/// 秒级 mtime
pub fn mtime_secs(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
pub fn ino(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// 稳定版标准库在非 unix 平台不提供文件编号，返回 0 表示未知，
/// 此时移动只能在安全模式下通过 checksum 识别
#[cfg(not(unix))]
pub fn ino(_meta: &Metadata) -> u64 {
    0
}

/// 由元数据构造 `FileStat`（不计算 checksum）
pub fn stat_from_metadata(meta: &Metadata) -> FileStat {
    if meta.is_dir() {
        FileStat::dir(mtime_secs(meta), ino(meta))
    } else {
        FileStat::file(meta.len(), mtime_secs(meta), ino(meta), None)
    }
}

/// 本地同步根目录
pub struct LocalStorage {
    base_path: PathBuf,
    trash: Option<Arc<dyn TrashHook>>,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            trash: None,
        }
    }

    pub fn with_trash(mut self, trash: Option<Arc<dyn TrashHook>>) -> Self {
        self.trash = trash;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 相对路径（`/` 分隔）转为本地路径
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self.base_path.clone(), |acc, p| acc.join(p))
    }

    pub async fn exists(path: &Path) -> bool {
        fs::symlink_metadata(path).await.is_ok()
    }

    pub async fn is_dir(path: &Path) -> bool {
        fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    /// 读取状态，`with_checksum` 时在阻塞线程中计算内容校验
    pub async fn stat(path: &Path, with_checksum: bool) -> io::Result<FileStat> {
        let meta = fs::metadata(path).await?;
        let mut stat = stat_from_metadata(&meta);
        if with_checksum && !stat.is_dir {
            let p = path.to_path_buf();
            let checksum = tokio::task::spawn_blocking(move || Checksum::of_file(&p))
                .await
                .map_err(io::Error::other)??;
            stat.checksum = Some(checksum);
        }
        Ok(stat)
    }

    /// 确保父目录存在
    pub async fn check_parent_dir(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !Self::exists(parent).await {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// 设置 atime 与 mtime
    pub async fn set_mtime(path: &Path, mtime: i64) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let time = UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
            let file = std::fs::File::options()
                .read(true)
                .open(&path)
                .or_else(|_| std::fs::File::options().write(true).open(&path))?;
            file.set_times(FileTimes::new().set_accessed(time).set_modified(time))
        })
        .await
        .map_err(io::Error::other)?
    }

    /// 删除文件或目录（目录递归删除），不存在时忽略
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Some(trash) = &self.trash {
            debug!("移到回收站: {}", path.display());
            let trash = trash.clone();
            let path = path.to_path_buf();
            return tokio::task::spawn_blocking(move || trash.trash(&path))
                .await
                .map_err(io::Error::other)?;
        }
        if meta.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        }
    }

    pub async fn rename(src: &Path, dst: &Path) -> io::Result<()> {
        Self::check_parent_dir(dst).await?;
        fs::rename(src, dst).await
    }

    pub async fn copy(src: &Path, dst: &Path, mtime: i64) -> io::Result<()> {
        Self::check_parent_dir(dst).await?;
        fs::copy(src, dst).await?;
        Self::set_mtime(dst, mtime).await
    }

    /// 创建目录或空文件
    pub async fn make(path: &Path, is_dir: bool) -> io::Result<()> {
        if is_dir {
            fs::create_dir_all(path).await
        } else {
            Self::check_parent_dir(path).await?;
            fs::write(path, b"").await
        }
    }

    /// 将下载流写入 `path`
    ///
    /// `offset > 0` 时保留已有的前 `offset` 字节并追加；`secure` 时返回完整文件的 checksum，
    /// 否则返回写入后的文件大小。
    pub async fn write_stream(
        path: &Path,
        mut stream: ByteStream,
        offset: u64,
        secure: bool,
        progress: Option<&TransferProgress>,
    ) -> Result<WrittenFile> {
        Self::check_parent_dir(path).await?;
        let mut checksum = secure.then(Checksum::new);
        let mut file = if offset > 0 {
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(offset).await?;
            if let Some(c) = checksum.as_mut() {
                c.update_from_file(path).await?;
            }
            let mut file = file;
            tokio::io::AsyncSeekExt::seek(&mut file, io::SeekFrom::Start(offset)).await?;
            file
        } else {
            fs::File::create(path).await?
        };
        if let Some(tp) = progress {
            tp.set_current(offset);
        }

        let mut size = offset;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            if let Some(c) = checksum.as_mut() {
                c.update(&chunk);
            }
            if let Some(tp) = progress {
                tp.update(chunk.len() as u64);
            }
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(WrittenFile {
            size,
            checksum: checksum.map(Checksum::finalize),
        })
    }
}

/// 下载写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub size: u64,
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[test]
    fn test_resolve_path() {
        let local = LocalStorage::new("/data/sync");
        assert_eq!(
            local.resolve_path("a/b.txt"),
            PathBuf::from("/data/sync").join("a").join("b.txt")
        );
        assert_eq!(local.resolve_path(""), PathBuf::from("/data/sync"));
    }

    #[tokio::test]
    async fn test_set_mtime_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"abc").unwrap();
        LocalStorage::set_mtime(&path, 1_600_000_000).await.unwrap();

        let stat = LocalStorage::stat(&path, true).await.unwrap();
        assert_eq!(stat.mtime, 1_600_000_000);
        assert_eq!(stat.size, 3);
        assert_eq!(stat.checksum.unwrap(), Checksum::of_bytes(b"abc"));

        LocalStorage::set_mtime(dir.path(), 1_500_000_000).await.unwrap();
        let stat = LocalStorage::stat(dir.path(), false).await.unwrap();
        assert!(stat.is_dir);
        assert_eq!(stat.mtime, 1_500_000_000);
    }

    #[test]
    fn test_ino_by_platform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"abc").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        if cfg!(unix) {
            assert_ne!(ino(&meta), 0);
            let renamed = dir.path().join("g.txt");
            std::fs::rename(&path, &renamed).unwrap();
            assert_eq!(ino(&std::fs::metadata(&renamed).unwrap()), ino(&meta));
        } else {
            assert_eq!(ino(&meta), 0);
        }
    }

    #[tokio::test]
    async fn test_write_stream_resume_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(".sync-in.f.bin");
        LocalStorage::check_parent_dir(&path).await.unwrap();
        // 已有 4 字节，再加一个多余字节（会被截断）
        std::fs::write(&path, b"hellX").unwrap();

        let written = LocalStorage::write_stream(&path, byte_stream(vec![b"o world"]), 4, true, None)
            .await
            .unwrap();
        assert_eq!(written.size, 11);
        assert_eq!(written.checksum.unwrap(), Checksum::of_bytes(b"hello world"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_remove_uses_trash_hook() {
        struct Recorder(std::sync::Mutex<Vec<PathBuf>>);
        impl TrashHook for Recorder {
            fn trash(&self, path: &Path) -> io::Result<()> {
                self.0.lock().unwrap().push(path.to_path_buf());
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        LocalStorage::make(&path, true).await.unwrap();

        let recorder = Arc::new(Recorder(Default::default()));
        let local = LocalStorage::new(dir.path()).with_trash(Some(recorder.clone() as Arc<dyn TrashHook>));
        local.remove(&path).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[path.clone()]);
        assert!(path.exists());

        LocalStorage::new(dir.path()).remove(&path).await.unwrap();
        assert!(!path.exists());
        // 不存在时忽略
        LocalStorage::new(dir.path()).remove(&path).await.unwrap();
    }
}
