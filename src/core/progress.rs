//! 传输进度与同步事件
//!
//! `SyncEvents` 是由管理器持有的观察者注册表，各组件通过它发送类型化事件。

use super::snapshot::Side;
use crate::models::{FileAction, SyncTransfer};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 需要跟踪进度（并进入慢队列）的最小文件大小
pub const TRANSFER_MIN_SIZE: u64 = 10 * 1024 * 1024;

/// 同步过程中发送给订阅者的事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    SyncStatus {
        server_id: u64,
        sync_path_id: u64,
        running: bool,
        report_only: bool,
        main_error: Option<String>,
        last_errors: usize,
    },
    #[serde(rename_all = "camelCase")]
    TasksCount {
        server_id: u64,
        sync_path_id: u64,
        remaining: u64,
    },
    #[serde(rename_all = "camelCase")]
    Transfer {
        server_id: u64,
        sync_path_id: u64,
        report_only: bool,
        transfer: SyncTransfer,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        server_id: u64,
        sync_path_id: u64,
        progress: ProgressSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        server_id: u64,
        sync_path_ids: Vec<u64>,
    },
}

/// 观察者注册表
#[derive(Clone, Default)]
pub struct SyncEvents {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>>,
}

impl SyncEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// 发送给所有订阅者，丢弃已关闭的订阅
    pub fn emit(&self, event: SyncEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// 同步路径标识（用于事件与日志）
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub server_id: u64,
    pub server_name: String,
    pub sync_path_id: u64,
    pub sync_path_name: String,
}

/// 大文件传输进度
#[derive(Debug)]
pub struct TransferProgress {
    pub file: String,
    pub side: Side,
    pub action: FileAction,
    pub total_size: u64,
    current_size: AtomicU64,
    transferred_size: AtomicU64,
    started: Instant,
}

/// 某一时刻的进度
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub file: String,
    pub side: Side,
    pub action: FileAction,
    pub percent: String,
    pub current_size: String,
    pub total_size: String,
    pub speed: String,
    pub remaining_time: String,
}

impl TransferProgress {
    pub fn new(file: &str, side: Side, action: FileAction, total_size: u64) -> Self {
        Self {
            file: file.to_string(),
            side,
            action,
            total_size,
            current_size: AtomicU64::new(0),
            transferred_size: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn update(&self, chunk: u64) {
        self.current_size.fetch_add(chunk, Ordering::Relaxed);
        self.transferred_size.fetch_add(chunk, Ordering::Relaxed);
    }

    /// 续传时的起始位置（不计入速度）
    pub fn set_current(&self, size: u64) {
        self.current_size.store(size, Ordering::Relaxed);
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.current_size() >= self.total_size
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let current = self.current_size();
        let transferred = self.transferred_size.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let speed = ((transferred as f64 / elapsed) as u64).max(1);
        let percent = if self.total_size == 0 {
            100.0
        } else {
            100.0 * current as f64 / self.total_size as f64
        };
        ProgressSnapshot {
            file: self.file.clone(),
            side: self.side,
            action: self.action,
            percent: format!("{:.2}", percent),
            current_size: to_human_size(current),
            total_size: to_human_size(self.total_size),
            speed: format!("{}/s", to_human_size(speed)),
            remaining_time: to_human_time(self.total_size.saturating_sub(current) / speed),
        }
    }
}

pub fn to_human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes == 0 {
        return "0KB".to_string();
    }
    let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    format!("{:.2} {}", value, UNITS[exponent])
}

pub fn to_human_time(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// 汇总一个同步路径的完成情况，并提供移动操作屏障
pub struct TransferReporter {
    ctx: SyncContext,
    events: SyncEvents,
    report_only: bool,
    count: AtomicU64,
    done: watch::Sender<u64>,
    store: Mutex<Vec<Arc<TransferProgress>>>,
    min_size: u64,
    throttle: Duration,
}

impl TransferReporter {
    pub fn new(ctx: SyncContext, events: SyncEvents, report_only: bool) -> Self {
        let (done, _) = watch::channel(0);
        Self {
            ctx,
            events,
            report_only,
            count: AtomicU64::new(0),
            done,
            store: Mutex::new(Vec::new()),
            min_size: TRANSFER_MIN_SIZE,
            throttle: Duration::from_millis(500),
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn add_tasks(&self, n: u64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn done_count(&self) -> u64 {
        *self.done.borrow()
    }

    /// 大文件返回进度跟踪对象
    pub fn add(
        &self,
        file: &str,
        side: Side,
        action: FileAction,
        total_size: u64,
    ) -> Option<Arc<TransferProgress>> {
        if total_size < self.min_size {
            return None;
        }
        let tp = Arc::new(TransferProgress::new(file, side, action, total_size));
        if let Ok(mut store) = self.store.lock() {
            store.push(tp.clone());
        }
        Some(tp)
    }

    /// 记录一个完成（或失败）的操作
    pub fn done(&self, tr: SyncTransfer) {
        self.done.send_modify(|d| *d += 1);
        let (done, count) = (self.done_count(), self.count());
        if let Ok(mut store) = self.store.lock() {
            store.retain(|tp| !(tp.file == tr.file && tp.side == tr.side));
        }
        if !tr.ok {
            error!("[{}/{}] {}", done, count, tr.describe());
        } else if self.report_only {
            info!("[report] {}", tr.describe());
        } else {
            info!("[{}/{}] {}", done, count, tr.describe());
        }
        self.events.emit(SyncEvent::Transfer {
            server_id: self.ctx.server_id,
            sync_path_id: self.ctx.sync_path_id,
            report_only: self.report_only,
            transfer: tr,
        });
    }

    /// 报告模式下通知被过滤的路径（不计入任务数）
    pub fn filtered(&self, tr: SyncTransfer) {
        if !self.report_only {
            return;
        }
        debug!("[report] {}", tr.describe());
        self.events.emit(SyncEvent::Transfer {
            server_id: self.ctx.server_id,
            sync_path_id: self.ctx.sync_path_id,
            report_only: true,
            transfer: tr,
        });
    }

    pub fn is_report_only(&self) -> bool {
        self.report_only
    }

    /// 等待已完成的操作数达到 `n`，取消时返回 false
    pub async fn wait_for_done(&self, n: u64, cancel: &CancellationToken) -> bool {
        if self.done_count() >= n {
            return true;
        }
        debug!("等待 {} 个移动操作完成", n);
        let mut rx = self.done.subscribe();
        tokio::select! {
            r = rx.wait_for(|d| *d >= n) => r.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    fn remaining(&self) -> u64 {
        self.count().saturating_sub(self.done_count())
    }

    /// 按节流间隔发送任务数与大文件进度
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut last_remaining = None;
            loop {
                tokio::time::sleep(reporter.throttle).await;
                let remaining = reporter.remaining();
                if last_remaining != Some(remaining) {
                    last_remaining = Some(remaining);
                    reporter.events.emit(SyncEvent::TasksCount {
                        server_id: reporter.ctx.server_id,
                        sync_path_id: reporter.ctx.sync_path_id,
                        remaining,
                    });
                }
                let active: Vec<Arc<TransferProgress>> = match reporter.store.lock() {
                    Ok(mut store) => {
                        store.retain(|tp| !tp.is_done());
                        store.clone()
                    }
                    Err(_) => Vec::new(),
                };
                for tp in active {
                    let snapshot = tp.snapshot();
                    debug!(
                        "{} {} [{}%][{}/{}][{}][{}]",
                        snapshot.action,
                        snapshot.file,
                        snapshot.percent,
                        snapshot.current_size,
                        snapshot.total_size,
                        snapshot.speed,
                        snapshot.remaining_time
                    );
                    reporter.events.emit(SyncEvent::Progress {
                        server_id: reporter.ctx.server_id,
                        sync_path_id: reporter.ctx.sync_path_id,
                        progress: snapshot,
                    });
                }
            }
        })
    }
}
