//! 传输执行器
//!
//! 每种操作一个方法：从当前快照取状态、执行 I/O，成功后更新快照；
//! 失败时移除另一侧的条目，让下次同步重新比较，并记录错误。

use super::action::{Action, ActionBatch, ActionKind, ActionPlan, CopyAction, MkAction, MoveAction, PropsAction};
use super::filter::incomplete_path;
use super::progress::TransferReporter;
use super::snapshot::{parent_dir, Side, SidePair, SyncState};
use super::stat::FileStat;
use super::tasks::{Task, TasksManager};
use crate::error::{Result, SyncError};
use crate::models::{FileAction, SyncPath, SyncTransfer};
use crate::storage::local::{self, LocalStorage};
use crate::storage::{RemoteStorage, UploadRequest};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 可续传的最小文件大小
pub const RESUME_MIN_SIZE: u64 = 20 * 1024 * 1024;

/// 批量操作（删除、创建、复制、属性）的并发上限
pub const BATCH_CONCURRENCY: usize = 25;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub resume_min_size: u64,
    pub batch_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            resume_min_size: RESUME_MIN_SIZE,
            batch_concurrency: BATCH_CONCURRENCY,
        }
    }
}

/// 待更新的属性，每侧只提交一次属性任务
#[derive(Default)]
struct PropsStore {
    files: Vec<PropsAction>,
    tasked: bool,
}

pub struct TransferExecutor {
    sync_path: SyncPath,
    remote: Arc<dyn RemoteStorage>,
    local: LocalStorage,
    state: Arc<Mutex<SyncState>>,
    reporter: Arc<TransferReporter>,
    tasks: Arc<TasksManager>,
    config: TransferConfig,
    cancel: CancellationToken,
    props: std::sync::Mutex<SidePair<PropsStore>>,
    last_errors: std::sync::Mutex<Vec<SyncTransfer>>,
    move_tasks: AtomicU64,
    /// 属性任务需要持有执行器
    this: Weak<Self>,
}

impl TransferExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync_path: SyncPath,
        remote: Arc<dyn RemoteStorage>,
        local: LocalStorage,
        state: Arc<Mutex<SyncState>>,
        reporter: Arc<TransferReporter>,
        tasks: Arc<TasksManager>,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sync_path,
            remote,
            local,
            state,
            reporter,
            tasks,
            config,
            cancel,
            props: std::sync::Mutex::new(SidePair::default()),
            last_errors: std::sync::Mutex::new(Vec::new()),
            move_tasks: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// 本次运行中失败的操作
    pub fn take_errors(&self) -> Vec<SyncTransfer> {
        self.last_errors
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }

    /// 提交计划并运行任务队列，直到全部完成或停止
    pub async fn run(self: &Arc<Self>, plan: ActionPlan) {
        let tasks = self.tasks.clone();
        tokio::join!(self.dispatch(plan), tasks.run());
    }

    fn secure(&self) -> bool {
        self.sync_path.secure_diff()
    }

    fn real_path(&self, path: &str) -> PathBuf {
        self.sync_path.local_real_path(path)
    }

    async fn stat(&self, side: Side, path: &str) -> Option<FileStat> {
        self.state.lock().await.cur[side].get(path).cloned()
    }

    fn task<F>(self: &Arc<Self>, f: impl FnOnce(Arc<Self>) -> F) -> Task
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fut = f(self.clone());
        Box::pin(async move {
            fut.await;
            Ok(())
        })
    }

    async fn dispatch(self: &Arc<Self>, plan: ActionPlan) {
        for batch in plan {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.wait_for_moves(&batch).await {
                break;
            }
            if batch.kind.is_counted() {
                self.reporter.add_tasks(batch.len() as u64);
            }
            self.submit(batch).await;
        }
        self.tasks.filling_done();
    }

    /// 移动必须先完成，其余批次等待已完成数达到移动数
    async fn wait_for_moves(&self, batch: &ActionBatch) -> bool {
        if batch.kind.is_move() {
            self.move_tasks
                .fetch_add(batch.len() as u64, Ordering::SeqCst);
            return true;
        }
        let moves = self.move_tasks.load(Ordering::SeqCst);
        if moves > self.reporter.done_count() {
            return self.reporter.wait_for_done(moves, &self.cancel).await;
        }
        true
    }

    async fn submit(self: &Arc<Self>, batch: ActionBatch) {
        let ActionBatch { kind, actions } = batch;
        match kind {
            ActionKind::Upload
            | ActionKind::UploadDiff
            | ActionKind::Download
            | ActionKind::DownloadDiff => {
                let source = match kind.side() {
                    Side::Local => Side::Remote,
                    Side::Remote => Side::Local,
                };
                let diff = kind.is_diff();
                for action in actions {
                    let path = action.target().to_string();
                    let size = match self.stat(source, &path).await {
                        Some(stat) => stat.size,
                        None => {
                            warn!("{}: 快照中找不到 {}", kind, path);
                            1
                        }
                    };
                    let task = if kind.side() == Side::Local {
                        self.task(move |this| async move { this.download(&path, diff).await })
                    } else {
                        self.task(move |this| async move { this.upload(&path, diff).await })
                    };
                    self.tasks.add(task, size);
                }
            }
            ActionKind::LocalMove | ActionKind::RemoteMove => {
                let moves = move_actions(actions);
                let side = kind.side();
                let task = self.task(move |this| async move { this.moves(side, moves).await });
                self.tasks.add(task, 0);
            }
            ActionKind::LocalMk | ActionKind::RemoteMk => {
                let mks = mk_actions(actions);
                let side = kind.side();
                let task = self.task(move |this| async move { this.mks(side, mks).await });
                self.tasks.add(task, 0);
            }
            ActionKind::LocalCopy | ActionKind::RemoteCopy => {
                let copies = copy_actions(actions);
                let side = kind.side();
                let task = self.task(move |this| async move { this.copies(side, copies).await });
                self.tasks.add_to_end(task, false);
            }
            ActionKind::LocalRemove | ActionKind::RemoteRemove => {
                let paths: Vec<String> = actions.iter().map(|a| a.target().to_string()).collect();
                let side = kind.side();
                let task = self.task(move |this| async move { this.removes(side, paths).await });
                self.tasks.add_to_end(task, true);
            }
            ActionKind::LocalProperties | ActionKind::RemoteProperties => {
                let props = actions
                    .into_iter()
                    .filter_map(|a| match a {
                        Action::Props(p) => Some(p),
                        _ => None,
                    })
                    .collect();
                self.add_properties(kind.side(), props);
            }
        }
    }

    fn set_transfer_state(&self, tr: SyncTransfer, result: Result<()>) {
        let tr = match result {
            Ok(()) => tr.succeed(),
            Err(e) => {
                let tr = tr.fail(e);
                if let Ok(mut errors) = self.last_errors.lock() {
                    errors.push(tr.clone());
                }
                tr
            }
        };
        self.reporter.done(tr);
    }

    // ============ 下载 / 上传 ============

    async fn download(&self, path: &str, diff: bool) {
        let action = if diff { FileAction::Diff } else { FileAction::New };
        let tr = SyncTransfer::new(Side::Local, action, path, false);
        let result = self.download_file(path, action).await;
        if result.is_err() {
            self.state.lock().await.remove_file(Side::Remote, path, false);
        }
        self.set_transfer_state(tr, result);
    }

    async fn download_file(&self, path: &str, action: FileAction) -> Result<()> {
        let real = self.real_path(path);
        if LocalStorage::is_dir(&real).await {
            self.local.remove(&real).await?;
            self.state.lock().await.remove_file(Side::Local, path, false);
        }
        let mut stat = self
            .stat(Side::Remote, path)
            .await
            .ok_or_else(|| SyncError::transfer("not found in remote snapshot"))?;
        let progress = self.reporter.add(path, Side::Local, action, stat.size);
        let tmp = incomplete_path(path);
        let real_tmp = self.real_path(&tmp);
        let offset = self.has_range(Side::Local, &tmp, &stat, Some(&real_tmp)).await;
        LocalStorage::check_parent_dir(&real_tmp).await?;

        let download = self.remote.download(&self.sync_path, path, offset).await?;
        // 服务器忽略 Range 时从头开始
        let offset = if download.resumed { offset } else { 0 };
        let written = LocalStorage::write_stream(
            &real_tmp,
            download.stream,
            offset,
            self.secure(),
            progress.as_deref(),
        )
        .await?;

        let (matches, check) = if self.secure() {
            (written.checksum == stat.checksum, "checksum")
        } else {
            (written.size == stat.size, "size")
        };
        if !matches {
            self.state.lock().await.remove_incomplete(Side::Local, &tmp);
            if let Err(e) = tokio::fs::remove_file(&real_tmp).await {
                debug!("删除未完成文件失败 {}: {}", real_tmp.display(), e);
            }
            return Err(SyncError::Verification(check));
        }

        LocalStorage::rename(&real_tmp, &real).await?;
        stat.ino = local::ino(&tokio::fs::metadata(&real).await?);
        self.add_properties(
            Side::Local,
            vec![PropsAction {
                path: path.to_string(),
                mtime: stat.mtime,
            }],
        );
        let mut state = self.state.lock().await;
        state.add_file(Side::Local, path, stat);
        state.remove_incomplete(Side::Local, &tmp);
        Ok(())
    }

    async fn upload(&self, path: &str, diff: bool) {
        let action = if diff { FileAction::Diff } else { FileAction::New };
        let tr = SyncTransfer::new(Side::Remote, action, path, false);
        if !LocalStorage::exists(&self.real_path(path)).await {
            self.set_transfer_state(
                tr,
                Err(SyncError::transfer(format!("does not exist on {} side", Side::Local))),
            );
            return;
        }
        let result = self.upload_file(path, diff, action).await;
        if result.is_err() {
            self.state.lock().await.remove_file(Side::Local, path, false);
        }
        self.set_transfer_state(tr, result);
    }

    async fn upload_file(&self, path: &str, diff: bool, action: FileAction) -> Result<()> {
        let real = self.real_path(path);
        let mut stat = self
            .stat(Side::Local, path)
            .await
            .ok_or_else(|| SyncError::transfer("not found in local snapshot"))?;
        if tokio::fs::metadata(&real).await?.len() != stat.size {
            return Err(SyncError::transfer("size has changed since parsing"));
        }
        let tmp = incomplete_path(path);
        let offset = self.has_range(Side::Remote, &tmp, &stat, None).await;
        let progress = self.reporter.add(path, Side::Remote, action, stat.size);
        let request = UploadRequest {
            diff,
            source: real,
            size: stat.size,
            mtime: stat.mtime,
            checksum: stat.checksum.clone(),
            offset,
        };
        stat.ino = self
            .remote
            .upload(&self.sync_path, path, request, progress)
            .await?;
        let mut state = self.state.lock().await;
        state.add_file(Side::Remote, path, stat);
        state.remove_incomplete(Side::Remote, &tmp);
        Ok(())
    }

    /// 续传位置：大文件且未完成快照与目标一致时返回已传输的字节数，
    /// 否则登记新的未完成条目并返回 0
    async fn has_range(&self, side: Side, tmp: &str, stat: &FileStat, real_tmp: Option<&Path>) -> u64 {
        if stat.size < self.config.resume_min_size {
            return 0;
        }
        let tmp_exists = match real_tmp {
            Some(p) => LocalStorage::exists(p).await,
            None => true,
        };
        let mut state = self.state.lock().await;
        if tmp_exists {
            if let Some(inc) = state.cur_inc[side].get(tmp) {
                let same = if self.secure() {
                    inc.checksum.is_some() && inc.checksum == stat.checksum
                } else {
                    inc.size == stat.size
                };
                if same {
                    let offset = inc.incomplete_size.unwrap_or(0);
                    debug!("续传 ({}) {} 从 {} 字节开始", side, tmp, offset);
                    return offset;
                }
            }
        }
        let mut inc = stat.clone();
        inc.incomplete_size = Some(0);
        state.add_incomplete(side, tmp, inc);
        0
    }

    // ============ 删除 ============

    async fn removes(&self, side: Side, paths: Vec<String>) {
        let props = self
            .bounded(paths.into_iter().map(|f| self.remove(side, f)).collect())
            .await;
        self.add_properties(side, props.into_iter().flatten().collect());
    }

    /// 删除一项，返回父目录的属性更新（父目录的 mtime 会因删除而改变）
    async fn remove(&self, side: Side, path: String) -> Option<PropsAction> {
        let is_dir = self
            .stat(side, &path)
            .await
            .map(|s| s.is_dir)
            .unwrap_or(false);
        let action = if is_dir { FileAction::Rmdir } else { FileAction::Rm };
        let tr = SyncTransfer::new(side, action, path.as_str(), is_dir);
        let result = match side {
            Side::Local => self
                .local
                .remove(&self.real_path(&path))
                .await
                .map_err(SyncError::from),
            Side::Remote => self.remote.delete(&self.sync_path, &path).await,
        };
        let mut props = None;
        if result.is_ok() {
            let mut state = self.state.lock().await;
            state.remove_file(side, &path, false);
            if let Some(parent) = parent_dir(&path) {
                props = state.cur[side.inverse()].get(parent).map(|s| PropsAction {
                    path: parent.to_string(),
                    mtime: s.mtime,
                });
            }
        }
        self.set_transfer_state(tr, result);
        props
    }

    // ============ 创建 ============

    /// 目录按顺序创建（父目录在前），空文件并发创建
    async fn mks(&self, side: Side, items: Vec<MkAction>) {
        let (dirs, files): (Vec<_>, Vec<_>) = items.into_iter().partition(|m| m.is_dir);
        for dir in dirs {
            self.mk(side, dir).await;
        }
        self.bounded(files.into_iter().map(|f| self.mk(side, f)).collect())
            .await;
    }

    async fn mk(&self, side: Side, item: MkAction) {
        let action = if item.is_dir {
            FileAction::Mkdir
        } else {
            FileAction::Mkfile
        };
        let tr = SyncTransfer::new(side, action, item.path.as_str(), item.is_dir);
        let result = match side {
            Side::Local => self.local_mk(&item).await,
            Side::Remote => self.remote_mk(&item).await,
        };
        if result.is_err() {
            self.state
                .lock()
                .await
                .remove_file(side.inverse(), &item.path, false);
        }
        self.set_transfer_state(tr, result);
    }

    async fn local_mk(&self, item: &MkAction) -> Result<()> {
        let real = self.real_path(&item.path);
        if LocalStorage::exists(&real).await && LocalStorage::is_dir(&real).await != item.is_dir {
            // 类型不同，先删除
            self.local.remove(&real).await?;
            self.state
                .lock()
                .await
                .remove_file(Side::Local, &item.path, false);
        }
        LocalStorage::make(&real, item.is_dir).await?;
        let mut stat = self
            .stat(Side::Remote, &item.path)
            .await
            .unwrap_or_else(|| mk_stat(item));
        stat.ino = local::ino(&tokio::fs::metadata(&real).await?);
        self.state
            .lock()
            .await
            .add_file(Side::Local, &item.path, stat);
        self.add_properties(
            Side::Local,
            vec![PropsAction {
                path: item.path.clone(),
                mtime: item.mtime,
            }],
        );
        Ok(())
    }

    async fn remote_mk(&self, item: &MkAction) -> Result<()> {
        let ino = self
            .remote
            .make(&self.sync_path, &item.path, item.is_dir, item.mtime)
            .await?;
        let mut stat = self
            .stat(Side::Local, &item.path)
            .await
            .unwrap_or_else(|| mk_stat(item));
        stat.ino = ino;
        self.state
            .lock()
            .await
            .add_file(Side::Remote, &item.path, stat);
        if item.is_dir {
            // 之后在目录中创建内容会改变其 mtime
            self.add_properties(
                Side::Remote,
                vec![PropsAction {
                    path: item.path.clone(),
                    mtime: item.mtime,
                }],
            );
        }
        Ok(())
    }

    // ============ 复制 ============

    async fn copies(&self, side: Side, items: Vec<CopyAction>) {
        self.bounded(items.into_iter().map(|item| self.copy(side, item)).collect())
            .await;
    }

    async fn copy(&self, side: Side, item: CopyAction) {
        let tr = SyncTransfer::new(side, FileAction::Copy, item.src.as_str(), false)
            .with_dst(item.dst.as_str());
        let result = match side {
            Side::Local => self.local_copy(&item).await,
            Side::Remote => self.remote_copy(&item).await,
        };
        if result.is_err() {
            self.state
                .lock()
                .await
                .remove_file(side.inverse(), &item.dst, false);
        }
        self.set_transfer_state(tr, result);
    }

    /// 以 `batch_concurrency` 为上限并发执行
    async fn bounded<F: Future>(&self, futures: Vec<F>) -> Vec<F::Output> {
        futures::stream::iter(futures)
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    async fn local_copy(&self, item: &CopyAction) -> Result<()> {
        let src = self.real_path(&item.src);
        let dst = self.real_path(&item.dst);
        if LocalStorage::is_dir(&dst).await {
            self.local.remove(&dst).await?;
            self.state
                .lock()
                .await
                .remove_file(Side::Local, &item.dst, false);
        }
        LocalStorage::copy(&src, &dst, item.mtime).await?;
        let stat = LocalStorage::stat(&dst, self.secure()).await?;
        self.state.lock().await.add_file(Side::Local, &item.dst, stat);
        Ok(())
    }

    async fn remote_copy(&self, item: &CopyAction) -> Result<()> {
        let copied = self
            .remote
            .copy(&self.sync_path, &item.src, &item.dst, item.mtime)
            .await?;
        let mut state = self.state.lock().await;
        let mut stat = state
            .cur
            .local
            .get(&item.src)
            .or_else(|| state.cur.local.get(&item.dst))
            .cloned()
            .unwrap_or_default();
        stat.ino = copied.ino;
        stat.mtime = copied.mtime;
        state.add_file(Side::Remote, &item.dst, stat);
        Ok(())
    }

    // ============ 移动 ============

    /// 按顺序执行，后面的移动可能依赖前面的结果
    async fn moves(&self, side: Side, items: Vec<MoveAction>) {
        for item in items {
            let is_dir = self
                .stat(side, &item.src)
                .await
                .map(|s| s.is_dir)
                .unwrap_or(false);
            let tr = SyncTransfer::new(side, FileAction::Move, item.src.as_str(), is_dir)
                .with_dst(item.dst.as_str());
            let result = match side {
                Side::Local => LocalStorage::rename(
                    &self.real_path(&item.src),
                    &self.real_path(&item.dst),
                )
                .await
                .map_err(SyncError::from),
                Side::Remote => {
                    self.remote
                        .rename(&self.sync_path, &item.src, &item.dst)
                        .await
                }
            };
            let mut state = self.state.lock().await;
            match &result {
                Ok(()) => state.move_file(side, &item.src, &item.dst),
                Err(_) => {
                    // 恢复来源，下次同步再次尝试移动
                    state.remove_file(side.inverse(), &item.dst, false);
                    if let Some(old) = state.old.local.get(&item.src).cloned() {
                        state.add_file(Side::Local, &item.src, old.clone());
                        state.add_file(Side::Remote, &item.src, old);
                    }
                }
            }
            drop(state);
            self.set_transfer_state(tr, result);
        }
    }

    // ============ 属性 ============

    fn add_properties(&self, side: Side, files: Vec<PropsAction>) {
        if files.is_empty() {
            return;
        }
        let submit = match self.props.lock() {
            Ok(mut props) => {
                let store = &mut props[side];
                store.files.extend(files);
                !std::mem::replace(&mut store.tasked, true)
            }
            Err(_) => false,
        };
        if submit {
            if let Some(this) = self.this.upgrade() {
                self.tasks.add_to_props(Box::pin(async move {
                    this.flush_properties(side).await;
                    Ok(())
                }));
            }
        }
    }

    /// 去重后批量更新 mtime，失败只记录日志
    async fn flush_properties(&self, side: Side) {
        let files = match self.props.lock() {
            Ok(mut props) => std::mem::take(&mut props[side].files),
            Err(_) => return,
        };
        let mut latest: HashMap<String, i64> = HashMap::new();
        for f in files {
            latest.insert(f.path, f.mtime);
        }
        self.bounded(
            latest
                .into_iter()
                .map(|(path, mtime)| self.set_properties(side, path, mtime))
                .collect(),
        )
        .await;
        info!("{} 属性更新完成", side);
    }

    async fn set_properties(&self, side: Side, path: String, mtime: i64) {
        let result = match side {
            Side::Local => LocalStorage::set_mtime(&self.real_path(&path), mtime)
                .await
                .map_err(SyncError::from),
            Side::Remote => self.remote.set_mtime(&self.sync_path, &path, mtime).await,
        };
        match result {
            Ok(()) => {
                self.state.lock().await.prop_file(side, &path, mtime);
                debug!("{} PROPS - {}", arrow(side), path);
            }
            Err(e) => error!("{} PROPS - {}: {}", arrow(side), path, e),
        }
    }
}

fn arrow(side: Side) -> &'static str {
    match side {
        Side::Local => "<-",
        Side::Remote => "->",
    }
}

fn mk_stat(item: &MkAction) -> FileStat {
    if item.is_dir {
        FileStat::dir(item.mtime, 0)
    } else {
        FileStat::file(0, item.mtime, 0, None)
    }
}

fn move_actions(actions: Vec<Action>) -> Vec<MoveAction> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            Action::Move(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn mk_actions(actions: Vec<Action>) -> Vec<MkAction> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            Action::Mk(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn copy_actions(actions: Vec<Action>) -> Vec<CopyAction> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            Action::Copy(c) => Some(c),
            _ => None,
        })
        .collect()
}
