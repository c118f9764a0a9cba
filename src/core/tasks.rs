//! 任务调度：fast / slow / props 三个队列加一个延后队列
//!
//! - fast：小文件传输、移动、创建，以及延后队列中的复制与删除
//! - slow：大文件传输，避免同时占满带宽
//! - props：属性更新，在 fast 队列全部结束后执行
//! - end：复制与删除先暂存，计划全部提交后一次性转入 fast 队列

use crate::error::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub type Task = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// 队列并发与路由参数
#[derive(Debug, Clone)]
pub struct TasksConfig {
    pub fast: usize,
    pub slow: usize,
    pub props: usize,
    /// 达到该大小的传输进入 slow 队列
    pub large_size: u64,
    /// 空闲时的轮询间隔
    pub poll_interval: Duration,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            fast: 3,
            slow: 1,
            props: 2,
            large_size: super::progress::TRANSFER_MIN_SIZE,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Fast,
    Slow,
    Props,
}

impl QueueKind {
    fn as_str(self) -> &'static str {
        match self {
            QueueKind::Fast => "fast",
            QueueKind::Slow => "slow",
            QueueKind::Props => "props",
        }
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Task>,
    /// 排队中与执行中的任务数
    count: usize,
}

#[derive(Default)]
struct Queues {
    fast: Queue,
    slow: Queue,
    props: Queue,
    end: VecDeque<Task>,
}

impl Queues {
    fn get(&mut self, kind: QueueKind) -> &mut Queue {
        match kind {
            QueueKind::Fast => &mut self.fast,
            QueueKind::Slow => &mut self.slow,
            QueueKind::Props => &mut self.props,
        }
    }
}

enum Step {
    Run(Task),
    Retry,
    Wait,
    Exit,
}

/// 任务管理器
pub struct TasksManager {
    config: TasksConfig,
    queues: Mutex<Queues>,
    filling_done: AtomicBool,
    /// 仍在运行的 slow / fast 工作者数
    slow_workers: AtomicUsize,
    fast_workers: AtomicUsize,
    stop: CancellationToken,
}

impl TasksManager {
    pub fn new(config: TasksConfig, stop: CancellationToken) -> Self {
        Self {
            slow_workers: AtomicUsize::new(config.slow),
            fast_workers: AtomicUsize::new(config.fast),
            config,
            queues: Mutex::new(Queues::default()),
            filling_done: AtomicBool::new(false),
            stop,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        // 队列操作不会在持锁期间 panic
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 按大小进入 fast 或 slow 队列
    pub fn add(&self, task: Task, size: u64) {
        let kind = if size >= self.config.large_size {
            QueueKind::Slow
        } else {
            QueueKind::Fast
        };
        let mut queues = self.lock();
        let queue = queues.get(kind);
        queue.items.push_back(task);
        queue.count += 1;
    }

    /// 暂存到延后队列，`first` 时放在最前
    pub fn add_to_end(&self, task: Task, first: bool) {
        let mut queues = self.lock();
        if first {
            queues.end.push_front(task);
        } else {
            queues.end.push_back(task);
        }
    }

    pub fn add_to_props(&self, task: Task) {
        let mut queues = self.lock();
        queues.props.items.push_back(task);
        queues.props.count += 1;
    }

    /// 计划已全部提交
    pub fn filling_done(&self) {
        self.filling_done.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 运行所有工作者直到队列清空或停止
    pub async fn run(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for (kind, n) in [
            (QueueKind::Fast, self.config.fast),
            (QueueKind::Slow, self.config.slow),
            (QueueKind::Props, self.config.props),
        ] {
            for id in 0..n {
                let manager = self.clone();
                handles.push(tokio::spawn(async move { manager.worker(kind, id).await }));
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("任务队列工作者异常退出: {}", e);
            }
        }
        debug!("所有队列已完成");
    }

    fn next_step(&self, kind: QueueKind) -> Step {
        let mut queues = self.lock();
        if kind == QueueKind::Props && self.fast_workers.load(Ordering::SeqCst) > 0 {
            // 属性更新等待所有传输结束
            return Step::Wait;
        }
        let queue = queues.get(kind);
        if queue.count > 0 {
            if let Some(task) = queue.items.pop_front() {
                return Step::Run(task);
            }
        }
        let filling_done = self.filling_done.load(Ordering::SeqCst);
        if kind == QueueKind::Fast && filling_done && !queues.end.is_empty() {
            let tasks: Vec<Task> = queues.end.drain(..).collect();
            queues.fast.count += tasks.len();
            queues.fast.items.extend(tasks);
            return Step::Retry;
        }
        let queue = queues.get(kind);
        let can_exit = queue.count == 0
            && filling_done
            && (kind != QueueKind::Fast || self.slow_workers.load(Ordering::SeqCst) == 0);
        if can_exit {
            Step::Exit
        } else {
            Step::Wait
        }
    }

    async fn worker(&self, kind: QueueKind, id: usize) {
        while !self.stop.is_cancelled() {
            match self.next_step(kind) {
                Step::Run(task) => {
                    if let Err(e) = task.await {
                        error!("{} 队列任务失败: {}", kind.as_str(), e);
                    }
                    self.lock().get(kind).count -= 1;
                }
                Step::Retry => {}
                Step::Wait => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.stop.cancelled() => {}
                    }
                }
                Step::Exit => break,
            }
        }
        match kind {
            QueueKind::Slow => {
                self.slow_workers.fetch_sub(1, Ordering::SeqCst);
            }
            QueueKind::Fast => {
                self.fast_workers.fetch_sub(1, Ordering::SeqCst);
            }
            QueueKind::Props => {}
        }
        debug!("{} 队列 {} 已完成", kind.as_str(), id);
    }
}
