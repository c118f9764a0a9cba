//! 单个同步路径的一次运行：加载快照 → 遍历 → 比较 → 执行 → 保存快照

use super::diff::DiffOptions;
use super::filter::INCOMPLETE_RETENTION;
use super::progress::{SyncContext, SyncEvents, TransferReporter};
use super::reduce::reduce;
use super::report::Report;
use super::scanner::Scanner;
use super::snapshot::{Snapshot, SyncState};
use super::store::SnapshotStore;
use super::tasks::{TasksConfig, TasksManager};
use super::transfer::{TransferConfig, TransferExecutor};
use crate::error::{Result, SyncError};
use crate::models::{SyncPath, SyncTransfer};
use crate::storage::local::{LocalStorage, TrashHook};
use crate::storage::RemoteStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// 同步引擎参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tasks: TasksConfig,
    pub transfer: TransferConfig,
    /// 未完成文件的保留时间（秒）
    pub incomplete_retention: i64,
    /// 进度事件的最小间隔
    pub progress_throttle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tasks: TasksConfig::default(),
            transfer: TransferConfig::default(),
            incomplete_retention: INCOMPLETE_RETENTION,
            progress_throttle: Duration::from_millis(500),
        }
    }
}

/// 一次运行的结果
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// 计划中的任务数（不含属性更新）
    pub tasks: u64,
    /// 失败的操作
    pub errors: Vec<SyncTransfer>,
    /// 运行被停止
    pub aborted: bool,
}

pub struct SyncEngine {
    config: EngineConfig,
    store: SnapshotStore,
    events: SyncEvents,
    trash: Option<Arc<dyn TrashHook>>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: SnapshotStore, events: SyncEvents) -> Self {
        Self {
            config,
            store,
            events,
            trash: None,
        }
    }

    /// 本地删除改为移入回收站
    pub fn with_trash(mut self, trash: Arc<dyn TrashHook>) -> Self {
        self.trash = Some(trash);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// 同步一个路径；`report_only` 时只报告计划，不修改任何一侧
    pub async fn run(
        &self,
        ctx: SyncContext,
        sync_path: &SyncPath,
        remote: Arc<dyn RemoteStorage>,
        report_only: bool,
        cancel: CancellationToken,
    ) -> Result<SyncOutcome> {
        let span = info_span!(
            "sync",
            server = %ctx.server_name,
            path = %ctx.sync_path_name,
        );
        self.run_inner(ctx, sync_path, remote, report_only, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        ctx: SyncContext,
        sync_path: &SyncPath,
        remote: Arc<dyn RemoteStorage>,
        report_only: bool,
        cancel: CancellationToken,
    ) -> Result<SyncOutcome> {
        let (server_id, sync_path_id) = (ctx.server_id, ctx.sync_path_id);
        info!(
            "{} {} {}",
            sync_path.local_path.display(),
            sync_path.symbol(),
            sync_path.remote_path
        );

        let reporter = Arc::new(
            TransferReporter::new(ctx, self.events.clone(), report_only)
                .with_throttle(self.config.progress_throttle)
                .with_min_size(self.config.tasks.large_size),
        );
        let watcher = scopeguard::guard(reporter.spawn_watcher(), |handle| handle.abort());

        let local = LocalStorage::new(&sync_path.local_path).with_trash(self.trash.clone());
        let mut state = SyncState::default();
        if local_case_insensitive() {
            state.cur.local = Snapshot::case_insensitive();
        }
        let stored = self.store.load(server_id, sync_path_id);
        let first_sync = stored.apply(&mut state) || sync_path.first_sync;
        info!(
            "{{FirstSync: {}, DiffMode: {:?}, ConflictMode: {:?}, ReportOnly: {}}}",
            first_sync, sync_path.diff_mode, sync_path.conflict_mode, report_only
        );

        Scanner::new(
            sync_path,
            remote.as_ref(),
            &local,
            &reporter,
            cancel.clone(),
            self.config.incomplete_retention,
        )?
        .run(&mut state, first_sync)
        .await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted);
        }

        let plan = reduce(&mut state, DiffOptions::new(sync_path, first_sync));
        let tasks = plan.task_count();
        info!("共 {} 个任务", tasks);

        if report_only {
            Report::new(reporter.clone(), cancel.clone()).run(&state, plan);
            return Ok(SyncOutcome {
                tasks,
                errors: Vec::new(),
                aborted: cancel.is_cancelled(),
            });
        }

        let state = Arc::new(Mutex::new(state));
        let executor = TransferExecutor::new(
            sync_path.clone(),
            remote,
            local,
            state.clone(),
            reporter.clone(),
            Arc::new(TasksManager::new(self.config.tasks.clone(), cancel.clone())),
            self.config.transfer.clone(),
            cancel.clone(),
        );
        executor.run(plan).await;
        let errors = executor.take_errors();
        let aborted = cancel.is_cancelled();
        drop(watcher);

        if aborted {
            warn!("同步已中止");
        }
        let state = state.lock().await;
        self.store.save(server_id, sync_path_id, &state, aborted)?;
        info!(
            "同步完成: {}/{} 个任务, {} 个错误",
            reporter.done_count(),
            reporter.count(),
            errors.len()
        );
        Ok(SyncOutcome {
            tasks,
            errors,
            aborted,
        })
    }
}

fn local_case_insensitive() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{Side, SidePair};
    use crate::core::stat::FileStat;
    use crate::core::filter::incomplete_path;
    use crate::models::SyncMode;
    use crate::storage::memory::MemoryRemote;
    use std::path::Path;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: std::path::PathBuf,
        engine: SyncEngine,
        remote: Arc<MemoryRemote>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("Docs");
        std::fs::create_dir(&root).unwrap();
        let store = SnapshotStore::new(tmp.path().join("snapshots"));
        Fixture {
            engine: SyncEngine::new(config, store, SyncEvents::new()),
            remote: Arc::new(MemoryRemote::new()),
            root,
            _tmp: tmp,
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.tasks.poll_interval = Duration::from_millis(5);
        config.progress_throttle = Duration::from_millis(20);
        config
    }

    fn ctx() -> SyncContext {
        SyncContext {
            server_id: 1,
            server_name: "test".into(),
            sync_path_id: 1,
            sync_path_name: "Docs".into(),
        }
    }

    async fn run(f: &Fixture, sp: &SyncPath, report_only: bool) -> Result<SyncOutcome> {
        f.engine
            .run(ctx(), sp, f.remote.clone(), report_only, CancellationToken::new())
            .await
    }

    fn write(root: &Path, path: &str, data: &[u8]) {
        let real = root.join(path);
        std::fs::create_dir_all(real.parent().unwrap()).unwrap();
        std::fs::write(real, data).unwrap();
    }

    #[tokio::test]
    async fn test_simple_upload_then_idempotent() {
        let f = fixture(config());
        write(&f.root, "a.txt", b"hello");
        write(&f.root, "d/b.txt", b"world!");
        let mut sp = SyncPath::new(1, &f.root, "/Docs");

        let outcome = run(&f, &sp, false).await.unwrap();
        assert!(outcome.errors.is_empty());
        assert!(!outcome.aborted);
        assert_eq!(f.remote.get("a.txt").unwrap().data, b"hello");
        assert_eq!(f.remote.get("d/b.txt").unwrap().data, b"world!");
        assert!(f.remote.get("d").unwrap().is_dir);
        let dir_mtime = crate::storage::local::mtime_secs(
            &std::fs::metadata(f.root.join("d")).unwrap(),
        );
        assert_eq!(f.remote.get("d").unwrap().mtime, dir_mtime);

        // 第二次运行没有任何操作
        sp.first_sync = false;
        f.remote.clear_operations();
        let outcome = run(&f, &sp, false).await.unwrap();
        assert_eq!(outcome.tasks, 0);
        assert!(f.remote.operations().is_empty());

        let stored = f.engine.store().load(1, 1);
        let old = stored.old.unwrap();
        assert!(old.local.contains("a.txt"));
        assert!(old.remote.contains("d/b.txt"));
    }

    #[tokio::test]
    async fn test_resumed_download_requests_range() {
        let mut config = config();
        config.transfer.resume_min_size = 1000;
        let f = fixture(config);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        f.remote.put_file("big.bin", &data, 1_700_000_000);

        // 上次运行中断：已下载 1000 字节
        let tmp = incomplete_path("big.bin");
        write(&f.root, &tmp, &data[..1000]);
        let mut interrupted = SyncState::default();
        interrupted
            .cur_inc
            .local
            .insert(&tmp, FileStat::file(5000, 1_700_000_000, 1, None));
        f.engine.store().save(1, 1, &interrupted, true).unwrap();

        let mut sp = SyncPath::new(1, &f.root, "/Docs");
        sp.mode = SyncMode::Download;
        let outcome = run(&f, &sp, false).await.unwrap();

        assert!(outcome.errors.is_empty());
        assert_eq!(f.remote.ranges(), vec![1000]);
        assert_eq!(std::fs::read(f.root.join("big.bin")).unwrap(), data);
        assert!(!f.root.join(&tmp).exists());
        let stored = f.engine.store().load(1, 1);
        assert!(stored.old_inc.local.is_empty());
    }

    #[tokio::test]
    async fn test_first_sync_guard_keeps_local_files() {
        let f = fixture(config());
        write(&f.root, "keep.txt", b"data");
        let mut sp = SyncPath::new(1, &f.root, "/Docs");
        sp.mode = SyncMode::Download;

        let err = run(&f, &sp, false).await.unwrap_err();
        assert!(matches!(err, SyncError::SafetyGuard(_)));
        assert!(f.root.join("keep.txt").exists());
        assert!(f.engine.store().load(1, 1).first_sync());
    }

    #[tokio::test]
    async fn test_report_only_changes_nothing() {
        let f = fixture(config());
        write(&f.root, "a.txt", b"hello");
        f.remote.put_file("b.txt", b"remote", 100);
        let sp = SyncPath::new(1, &f.root, "/Docs");

        let outcome = run(&f, &sp, true).await.unwrap();
        assert_eq!(outcome.tasks, 2);
        assert!(f.remote.operations().is_empty());
        assert!(!f.root.join("b.txt").exists());
        assert!(f.engine.store().load(1, 1).first_sync());
    }

    #[tokio::test]
    async fn test_remote_rename_is_replayed_locally() {
        let f = fixture(config());
        write(&f.root, "a.txt", b"content");
        let mut sp = SyncPath::new(1, &f.root, "/Docs");
        run(&f, &sp, false).await.unwrap();
        sp.first_sync = false;

        let entry = f.remote.get("a.txt").unwrap();
        f.remote.clear_operations();
        f.remote
            .rename(&sp, "a.txt", "b.txt")
            .await
            .unwrap();
        assert_eq!(f.remote.get("b.txt").unwrap().ino, entry.ino);

        let outcome = run(&f, &sp, false).await.unwrap();
        assert!(outcome.errors.is_empty());
        assert!(!f.root.join("a.txt").exists());
        assert_eq!(std::fs::read(f.root.join("b.txt")).unwrap(), b"content");
        // 本地执行移动，不重新传输
        let ops = f.remote.operations();
        assert!(!ops.iter().any(|op| op.starts_with("upload") || op.starts_with("download")));

        let old = f.engine.store().load(1, 1).old.unwrap_or_else(SidePair::default);
        assert!(old[Side::Local].contains("b.txt"));
        assert!(!old[Side::Remote].contains("a.txt"));
    }
}
