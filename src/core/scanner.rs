//! 本地与远程目录树的遍历
//!
//! 两侧并行遍历，结果写入 `SyncState` 的当前快照。

use super::checksum::Checksum;
use super::filter::{file_name, is_incomplete, PathFilter, DEFAULT_FILTERS};
use super::progress::TransferReporter;
use super::snapshot::{normalize_path, Side, Snapshot, SyncState};
use super::stat::{FileStat, SpecialStat, StatRecord};
use crate::error::{Result, SyncError};
use crate::models::{FileAction, SyncPath, SyncTransfer};
use crate::storage::local::{stat_from_metadata, LocalStorage};
use crate::storage::{DiffRequest, RemoteStorage, SYNC_DIFF_DONE};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

/// 本地遍历线程发出的条目
#[derive(Debug)]
enum LocalEntry {
    Stat(String, FileStat),
    Incomplete(String, FileStat),
    Filtered(String, bool),
    Error(String, String),
}

/// 一侧的遍历结果
#[derive(Debug, Default)]
pub struct SideScan {
    pub snapshot: Snapshot,
    pub incomplete: Snapshot,
    pub errors: Vec<String>,
    /// 超过保留期的未完成文件
    pub stale: Vec<String>,
}

pub struct Scanner<'a> {
    sync_path: &'a SyncPath,
    remote: &'a dyn RemoteStorage,
    local: &'a LocalStorage,
    reporter: &'a TransferReporter,
    filter: PathFilter,
    cancel: CancellationToken,
    retention: i64,
    now: i64,
}

impl<'a> Scanner<'a> {
    pub fn new(
        sync_path: &'a SyncPath,
        remote: &'a dyn RemoteStorage,
        local: &'a LocalStorage,
        reporter: &'a TransferReporter,
        cancel: CancellationToken,
        retention: i64,
    ) -> Result<Self> {
        Ok(Self {
            sync_path,
            remote,
            local,
            reporter,
            filter: PathFilter::new(&sync_path.filters)?,
            cancel,
            retention,
            now: chrono::Utc::now().timestamp(),
        })
    }

    /// 用指定时间判断未完成文件是否过期（测试用）
    pub fn with_now(mut self, now: i64) -> Self {
        self.now = now;
        self
    }

    /// 遍历两侧并填充当前快照
    pub async fn run(&self, state: &mut SyncState, first_sync: bool) -> Result<()> {
        let (local, remote) = tokio::join!(
            self.scan_local(&state.old.local, &state.old_inc.local, first_sync),
            self.scan_remote(&state.old.remote, &state.old_inc.remote, first_sync),
        );
        // 任一侧出错都会中止，另一侧的结果丢弃
        let (local, remote) = match (local, remote) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(e), _) | (_, Err(e)) => {
                self.cancel.cancel();
                return Err(e);
            }
        };

        self.remove_stale(Side::Local, &local.stale).await;
        self.remove_stale(Side::Remote, &remote.stale).await;

        let folding = state.cur.local.is_case_insensitive();
        state.cur.local = local.snapshot.with_case_folding(folding);
        // 两侧使用相同的大小写策略，避免只差大小写的路径被当作删除
        state.cur.remote = remote.snapshot.with_case_folding(folding);
        state.cur_inc.local = local.incomplete.with_case_folding(folding);
        state.cur_inc.remote = remote.incomplete;
        state.errors.local = local.errors;
        state.errors.remote = remote.errors;

        if first_sync {
            self.check_first_sync(state)?;
        }
        state.ignore_snapshot_errors();
        Ok(())
    }

    /// 首次同步时一侧为空而另一侧非空，继续会删除非空一侧的内容
    fn check_first_sync(&self, state: &SyncState) -> Result<()> {
        let (empty, other) = if self.sync_path.is_download_mode() {
            (Side::Remote, Side::Local)
        } else if self.sync_path.is_upload_mode() {
            (Side::Local, Side::Remote)
        } else {
            return Ok(());
        };
        if state.cur[empty].is_empty() && !state.cur[other].is_empty() {
            self.cancel.cancel();
            return Err(SyncError::SafetyGuard(format!(
                "The {} folder is empty, the contents of the {} folder will be deleted, add file in {} folder to confirm and sync changes",
                empty, other, other
            )));
        }
        Ok(())
    }

    fn report_filtered(&self, side: Side, path: &str, is_dir: bool) {
        debug!("过滤 {}: {}", side, path);
        self.reporter.filtered(
            SyncTransfer::new(side, FileAction::Filtered, path, is_dir).succeed(),
        );
    }

    /// 处理未完成传输文件：过期的待删除，其余根据已存储的记录更新已传输大小
    fn check_incomplete(
        &self,
        side: Side,
        path: String,
        stat: FileStat,
        old_inc: &Snapshot,
        scan: &mut SideScan,
    ) {
        if self.now - stat.mtime > self.retention {
            scan.stale.push(path);
        } else if let Some(stored) = old_inc.get(&path) {
            let mut stored = stored.clone();
            stored.incomplete_size = Some(stat.size);
            debug!("未完成文件 {}: {} ({} bytes)", side, path, stat.size);
            scan.incomplete.insert(&path, stored);
        }
        // 不在快照中的未完成文件可能属于其他客户端，保留不动
    }

    async fn remove_stale(&self, side: Side, paths: &[String]) {
        for path in paths {
            let result = match side {
                Side::Local => self
                    .local
                    .remove(&self.local.resolve_path(path))
                    .await
                    .map_err(SyncError::from),
                Side::Remote => self.remote.delete(self.sync_path, path).await,
            };
            match result {
                Ok(()) => debug!("已删除过期的未完成文件 {}: {}", side, path),
                Err(e) => warn!("无法删除过期的未完成文件 {}: {}: {}", side, path, e),
            }
        }
    }

    async fn scan_local(
        &self,
        old: &Snapshot,
        old_inc: &Snapshot,
        first_sync: bool,
    ) -> Result<SideScan> {
        let root = self.local.base_path().to_path_buf();
        debug!("本地遍历: {}", root.display());
        // 只有 secure 模式且已有快照时才需要复用 checksum
        let reuse = (self.sync_path.secure_diff() && !first_sync).then(|| old.clone());
        let walker = LocalWalker {
            root,
            filter: self.filter.clone(),
            secure: self.sync_path.secure_diff(),
            previous: reuse,
            cancel: self.cancel.clone(),
        };

        let (tx, rx) = mpsc::channel(1024);
        let handle = tokio::task::spawn_blocking(move || walker.walk(&tx));

        let mut scan = SideScan::default();
        let mut entries = ReceiverStream::new(rx);
        while let Some(entry) = entries.next().await {
            match entry {
                LocalEntry::Stat(path, stat) => scan.snapshot.insert(&path, stat),
                LocalEntry::Incomplete(path, stat) => {
                    self.check_incomplete(Side::Local, path, stat, old_inc, &mut scan)
                }
                LocalEntry::Filtered(path, is_dir) => {
                    self.report_filtered(Side::Local, &path, is_dir)
                }
                LocalEntry::Error(path, e) => {
                    warn!("本地遍历出错: {}: {}", path, e);
                    scan.errors.push(path);
                }
            }
        }
        handle
            .await
            .map_err(|e| SyncError::transfer(format!("本地遍历任务失败: {}", e)))??;
        info!("本地遍历完成 ({} 个文件)", scan.snapshot.len());
        Ok(scan)
    }

    async fn scan_remote(
        &self,
        old: &Snapshot,
        old_inc: &Snapshot,
        first_sync: bool,
    ) -> Result<SideScan> {
        debug!("远程遍历: {}", self.sync_path.remote_path);
        let secure = self.sync_path.secure_diff();
        let request = DiffRequest {
            secure_diff: secure,
            first_sync,
            default_filters: DEFAULT_FILTERS.iter().map(|f| f.to_string()).collect(),
            path_filters: self.filter.pattern(),
            snapshot: (secure && !first_sync).then(|| old.clone()),
        };
        let mut lines = self.remote.diff(self.sync_path, request).await?;

        let mut scan = SideScan::default();
        let mut done = false;
        let mut last_line: Option<String> = None;
        loop {
            let next = tokio::select! {
                next = lines.try_next() => next,
                _ = self.cancel.cancelled() => return Err(SyncError::Aborted),
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    if let Some(last) = &last_line {
                        error!("远程遍历中断: {}", e);
                        error!("最后一行: {}", last);
                        break;
                    }
                    return Err(e);
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == SYNC_DIFF_DONE {
                done = true;
                break;
            }
            let (path, record) = parse_diff_line(line).map_err(|e| {
                error!("无法解析远程数据: {}", line);
                SyncError::Protocol(e)
            })?;
            last_line = Some(line.to_string());

            match record {
                StatRecord::Stat(stat) => {
                    if !stat.is_dir && is_incomplete(file_name(&path)) {
                        self.check_incomplete(Side::Remote, path, stat, old_inc, &mut scan);
                    } else {
                        scan.snapshot.insert(&path, stat);
                    }
                }
                StatRecord::Special(SpecialStat::Error(e)) => {
                    warn!("远程遍历出错: {}: {}", path, e);
                    scan.errors.push(path);
                }
                StatRecord::Special(SpecialStat::Filtered { is_dir }) => {
                    self.report_filtered(Side::Remote, &path, is_dir)
                }
            }
        }

        if !done {
            return Err(SyncError::IncompleteRemote(scan.snapshot.len()));
        }
        info!("远程遍历完成 ({} 个文件)", scan.snapshot.len());
        Ok(scan)
    }
}

/// `{"path": [..]}` -> (path, record)
fn parse_diff_line(line: &str) -> std::result::Result<(String, StatRecord), String> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let serde_json::Value::Object(map) = value else {
        return Err(format!("记录不是对象: {}", line));
    };
    let (path, stat) = map
        .into_iter()
        .next()
        .ok_or_else(|| "空记录".to_string())?;
    Ok((normalize_path(&path), StatRecord::from_value(stat)?))
}

/// 在阻塞线程中运行的本地遍历
struct LocalWalker {
    root: PathBuf,
    filter: PathFilter,
    secure: bool,
    /// 上次的本地快照，用于复用未变化文件的 checksum
    previous: Option<Snapshot>,
    cancel: CancellationToken,
}

impl LocalWalker {
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(normalize_path(&rel.to_string_lossy()))
    }

    fn walk(&self, tx: &mpsc::Sender<LocalEntry>) -> Result<()> {
        let mut it = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        loop {
            let entry = match it.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    let path = e.path().and_then(|p| self.relative(p));
                    match path {
                        Some(p) if !p.is_empty() => {
                            send(tx, LocalEntry::Error(p, e.to_string()))?;
                            continue;
                        }
                        _ => {
                            error!("无法遍历本地目录: {}", e);
                            return Err(SyncError::LocalRoot(e.to_string()));
                        }
                    }
                }
            };
            if self.cancel.is_cancelled() {
                return Err(SyncError::Aborted);
            }

            let file_type = entry.file_type();
            let Some(path) = self.relative(entry.path()) else {
                continue;
            };
            if !file_type.is_dir() && !file_type.is_file() {
                info!("忽略特殊文件: {}", entry.path().display());
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if self.filter.is_filtered(&name, &path) {
                if file_type.is_dir() {
                    it.skip_current_dir();
                }
                // 默认规则过滤的系统文件不上报
                if !PathFilter::is_default_filtered(&name) {
                    send(tx, LocalEntry::Filtered(path, file_type.is_dir()))?;
                }
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    if file_type.is_dir() {
                        it.skip_current_dir();
                    }
                    send(tx, LocalEntry::Error(path, e.to_string()))?;
                    continue;
                }
            };
            let mut stat = stat_from_metadata(&meta);
            if !stat.is_dir && is_incomplete(&name) {
                send(tx, LocalEntry::Incomplete(path, stat))?;
                continue;
            }
            if self.secure && !stat.is_dir {
                match self.checksum(&path, entry.path(), &stat) {
                    Ok(checksum) => stat.checksum = Some(checksum),
                    Err(e) => {
                        send(tx, LocalEntry::Error(path, e.to_string()))?;
                        continue;
                    }
                }
            }
            trace!("本地: {}", path);
            send(tx, LocalEntry::Stat(path, stat))?;
        }
        Ok(())
    }

    fn checksum(&self, path: &str, real_path: &Path, stat: &FileStat) -> std::io::Result<String> {
        if let Some(prev) = self.previous.as_ref().and_then(|s| s.get(path)) {
            if let Some(checksum) = &prev.checksum {
                if prev.mtime == stat.mtime && prev.size == stat.size && prev.ino == stat.ino {
                    return Ok(checksum.clone());
                }
            }
        }
        Checksum::of_file(real_path)
    }
}

fn send(tx: &mpsc::Sender<LocalEntry>, entry: LocalEntry) -> Result<()> {
    tx.blocking_send(entry).map_err(|_| SyncError::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::{incomplete_path, INCOMPLETE_RETENTION};
    use crate::core::progress::{SyncContext, SyncEvents};
    use crate::models::{DiffMode, SyncMode};
    use crate::storage::memory::MemoryRemote;

    struct Fixture {
        dir: tempfile::TempDir,
        remote: MemoryRemote,
        reporter: TransferReporter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                remote: MemoryRemote::new(),
                reporter: TransferReporter::new(SyncContext::default(), SyncEvents::new(), false),
            }
        }

        fn sync_path(&self, mode: SyncMode) -> SyncPath {
            let mut sp = SyncPath::new(1, self.dir.path(), "files/docs");
            sp.mode = mode;
            sp
        }

        fn write(&self, path: &str, data: &[u8]) {
            let p = self.dir.path().join(path);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, data).unwrap();
        }

        async fn scan(&self, sp: &SyncPath, state: &mut SyncState, first_sync: bool) -> Result<()> {
            let local = LocalStorage::new(self.dir.path());
            Scanner::new(
                sp,
                &self.remote,
                &local,
                &self.reporter,
                CancellationToken::new(),
                INCOMPLETE_RETENTION,
            )?
            .run(state, first_sync)
            .await
        }
    }

    #[tokio::test]
    async fn test_scan_both_sides() {
        let f = Fixture::new();
        f.write("a/b.txt", b"hello");
        f.write(".DS_Store", b"x");
        f.remote.put_dir("r", 10);
        f.remote.put_file("r/c.txt", b"abc", 10);

        let sp = f.sync_path(SyncMode::Both);
        let mut state = SyncState::default();
        f.scan(&sp, &mut state, true).await.unwrap();

        assert!(state.cur.local.is_dir("a"));
        assert_eq!(state.cur.local.get("a/b.txt").unwrap().size, 5);
        assert!(!state.cur.local.contains(".DS_Store"));
        assert_eq!(state.cur.remote.len(), 2);
        assert_eq!(state.cur.remote.get("r/c.txt").unwrap().checksum, None);
    }

    #[tokio::test]
    async fn test_secure_scan_reuses_unchanged_checksum() {
        let f = Fixture::new();
        f.write("x.bin", b"content");
        let mut sp = f.sync_path(SyncMode::Both);
        sp.diff_mode = DiffMode::Secure;

        let mut state = SyncState::default();
        f.scan(&sp, &mut state, true).await.unwrap();
        let mut stat = state.cur.local.get("x.bin").unwrap().clone();
        assert_eq!(stat.checksum.as_deref(), Some(Checksum::of_bytes(b"content").as_str()));

        // 上次快照中的 checksum 在 size/mtime/ino 未变时直接复用
        stat.checksum = Some("cached".into());
        let mut state = SyncState::default();
        state.old.local.insert("x.bin", stat);
        f.scan(&sp, &mut state, false).await.unwrap();
        assert_eq!(state.cur.local.get("x.bin").unwrap().checksum.as_deref(), Some("cached"));
        assert_eq!(f.remote.diff_requests()[1]["compressed"], true);
    }

    #[tokio::test]
    async fn test_user_filters_skip_subtree() {
        let f = Fixture::new();
        f.write("build/out.o", b"o");
        f.write("src/main.rs", b"fn main() {}");
        let mut sp = f.sync_path(SyncMode::Both);
        sp.filters = vec!["^build".into()];

        let mut state = SyncState::default();
        f.scan(&sp, &mut state, true).await.unwrap();
        assert!(!state.cur.local.contains("build"));
        assert!(!state.cur.local.contains("build/out.o"));
        assert!(state.cur.local.contains("src/main.rs"));
    }

    #[tokio::test]
    async fn test_first_sync_guard_download() {
        let f = Fixture::new();
        for i in 0..10 {
            f.write(&format!("f{}.txt", i), b"data");
        }
        let sp = f.sync_path(SyncMode::Download);
        let mut state = SyncState::default();
        let err = f.scan(&sp, &mut state, true).await.unwrap_err();
        assert!(matches!(err, SyncError::SafetyGuard(_)));
        assert!(err.to_string().contains("remote folder is empty"));

        // 双向模式不受影响
        let sp = f.sync_path(SyncMode::Both);
        let mut state = SyncState::default();
        f.scan(&sp, &mut state, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_records_without_checksum() {
        let f = Fixture::new();
        f.remote.put_dir("d", 10);
        f.remote.put_file("d/x.txt", b"hello", 20);
        let sp = f.sync_path(SyncMode::Both);
        let mut state = SyncState::default();
        f.scan(&sp, &mut state, true).await.unwrap();

        let dir = state.cur.remote.get("d").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.mtime, 10);
        let file = state.cur.remote.get("d/x.txt").unwrap();
        assert_eq!(file.size, 5);
        assert_eq!(file.mtime, 20);
        assert!(file.ino != 0);
        assert_eq!(file.checksum, None);
    }

    #[tokio::test]
    async fn test_truncated_remote_stream_aborts() {
        let f = Fixture::new();
        f.remote.put_file("a.txt", b"a", 1);
        f.remote.set_truncate_diff(true);
        let sp = f.sync_path(SyncMode::Both);
        let mut state = SyncState::default();
        let err = f.scan(&sp, &mut state, true).await.unwrap_err();
        assert!(matches!(err, SyncError::IncompleteRemote(1)));
    }

    #[tokio::test]
    async fn test_incomplete_files_are_tracked_not_listed() {
        let f = Fixture::new();
        let tmp = incomplete_path("big.bin");
        f.write(&tmp, &[0u8; 1000]);

        let sp = f.sync_path(SyncMode::Both);
        let mut state = SyncState::default();
        let mut stored = FileStat::file(5000, 10, 1, Some("sum".into()));
        stored.incomplete_size = Some(0);
        state.old_inc.local.insert(&tmp, stored);
        f.scan(&sp, &mut state, false).await.unwrap();

        assert!(!state.cur.local.contains(&tmp));
        let inc = state.cur_inc.local.get(&tmp).unwrap();
        assert_eq!(inc.incomplete_size, Some(1000));
        assert_eq!(inc.size, 5000);
    }

    #[tokio::test]
    async fn test_stale_incomplete_files_are_removed() {
        let f = Fixture::new();
        let tmp = incomplete_path("old.bin");
        f.write(&tmp, b"partial");
        f.remote.put_file(&incomplete_path("remote.bin"), b"partial", 0);

        let sp = f.sync_path(SyncMode::Both);
        let local = LocalStorage::new(f.dir.path());
        let mut state = SyncState::default();
        Scanner::new(
            &sp,
            &f.remote,
            &local,
            &f.reporter,
            CancellationToken::new(),
            INCOMPLETE_RETENTION,
        )
        .unwrap()
        .with_now(chrono::Utc::now().timestamp() + INCOMPLETE_RETENTION + 10)
        .run(&mut state, true)
        .await
        .unwrap();

        assert!(!f.dir.path().join(&tmp).exists());
        assert!(f.remote.get(&incomplete_path("remote.bin")).is_none());
        assert!(state.cur_inc.local.is_empty());
    }

    #[test]
    fn test_parse_diff_line() {
        let (path, record) = parse_diff_line(r#"{"a/b":["error","EACCES"]}"#).unwrap();
        assert_eq!(path, "a/b");
        assert_eq!(record, StatRecord::Special(SpecialStat::Error("EACCES".into())));
        let (_, record) = parse_diff_line(r#"{"a":[true,0,10,1]}"#).unwrap();
        assert_eq!(record, StatRecord::Stat(FileStat::dir(10, 1)));
        assert!(parse_diff_line("not json").is_err());
        assert!(parse_diff_line("{}").is_err());
    }
}
