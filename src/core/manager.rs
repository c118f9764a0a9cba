//! 服务器级别的同步管理：按顺序或并发运行同步路径，记录结果，处理停止请求

use super::engine::SyncEngine;
use super::progress::{SyncContext, SyncEvent, SyncEvents};
use crate::models::{Server, SyncPath};
use crate::storage::RemoteStorage;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 正在运行的同步路径
struct Running {
    cancel: CancellationToken,
    report_only: bool,
}

pub struct SyncManager {
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteStorage>,
    events: SyncEvents,
    /// 服务器级停止信号，同时用于取消进行中的 HTTP 请求
    stop: CancellationToken,
    running: Mutex<HashMap<u64, Running>>,
}

impl SyncManager {
    pub fn new(
        engine: Arc<SyncEngine>,
        remote: Arc<dyn RemoteStorage>,
        events: SyncEvents,
        stop: CancellationToken,
    ) -> Self {
        Self {
            engine,
            remote,
            events,
            stop,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &SyncEvents {
        &self.events
    }

    /// 运行服务器的同步路径；`paths` 为空时运行全部已启用的路径
    pub async fn run(&self, server: &mut Server, paths: &[u64], report_only: bool) -> Result<()> {
        if !server.available {
            anyhow::bail!("服务器 {} 不可用", server.name);
        }
        let selected: Vec<SyncPath> = server
            .sync_paths
            .iter()
            .filter(|p| p.enabled && (paths.is_empty() || paths.contains(&p.id)))
            .cloned()
            .collect();
        if selected.is_empty() {
            info!("{}: 没有需要同步的路径", server.name);
            return Ok(());
        }

        let (server_id, server_name) = (server.id, server.name.clone());
        let results = if server.parallel_sync {
            futures::future::join_all(
                selected
                    .into_iter()
                    .map(|sp| self.run_path(server_id, &server_name, sp, report_only)),
            )
            .await
        } else {
            let mut results = Vec::new();
            for sp in selected {
                if self.stop.is_cancelled() {
                    warn!("{}: 同步已停止，跳过剩余路径", server_name);
                    break;
                }
                results.push(self.run_path(server_id, &server_name, sp, report_only).await);
            }
            results
        };

        if !report_only {
            for sp in results {
                if let Some(target) = server.find_path_mut(sp.id) {
                    *target = sp;
                }
            }
        }
        Ok(())
    }

    /// 运行单个同步路径，返回记录了结果的副本
    async fn run_path(
        &self,
        server_id: u64,
        server_name: &str,
        mut sp: SyncPath,
        report_only: bool,
    ) -> SyncPath {
        let cancel = self.stop.child_token();
        if let Ok(mut running) = self.running.lock() {
            running.insert(
                sp.id,
                Running {
                    cancel: cancel.clone(),
                    report_only,
                },
            );
        }
        self.send_status(server_id, &sp, true, report_only);

        let ctx = SyncContext {
            server_id,
            server_name: server_name.to_string(),
            sync_path_id: sp.id,
            sync_path_name: sp.name.clone(),
        };
        let result = match sp.checks() {
            Ok(()) => {
                self.engine
                    .run(ctx, &sp, self.remote.clone(), report_only, cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Ok(mut running) = self.running.lock() {
            running.remove(&sp.id);
        }
        match result {
            Ok(outcome) if !report_only => {
                sp.last_sync = Some(Utc::now());
                sp.last_errors = outcome.errors;
                if !outcome.aborted {
                    sp.first_sync = false;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("{} [{}]: {}", server_name, sp.name, e);
                sp.main_error = Some(e.to_string());
            }
        }
        self.send_status(server_id, &sp, false, report_only);
        sp
    }

    fn send_status(&self, server_id: u64, sp: &SyncPath, running: bool, report_only: bool) {
        self.events.emit(SyncEvent::SyncStatus {
            server_id,
            sync_path_id: sp.id,
            running,
            report_only,
            main_error: sp.main_error.clone(),
            last_errors: sp.last_errors.len(),
        });
    }

    /// 停止同步：`paths` 为空时停止整个服务器（包括尚未开始的路径）
    pub fn stop(&self, server_id: u64, paths: &[u64], report_only: bool) {
        let stopped: Vec<u64> = match self.running.lock() {
            Ok(running) => running
                .iter()
                .filter(|(id, r)| {
                    paths.is_empty() || (paths.contains(*id) && r.report_only == report_only)
                })
                .map(|(id, r)| {
                    r.cancel.cancel();
                    *id
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        if paths.is_empty() {
            self.stop.cancel();
        }
        warn!("请求停止同步: {:?}", stopped);
        self.events.emit(SyncEvent::Stop {
            server_id,
            sync_path_ids: stopped,
        });
    }

    pub fn is_running(&self, sync_path_id: u64) -> bool {
        self.running
            .lock()
            .map(|r| r.contains_key(&sync_path_id))
            .unwrap_or(false)
    }

    /// 移除同步路径及其快照
    pub fn remove_path(&self, server: &mut Server, sync_path_id: u64) -> Option<SyncPath> {
        if self.is_running(sync_path_id) {
            self.stop(server.id, &[sync_path_id], false);
        }
        let removed = server.remove_path(sync_path_id)?;
        self.engine.store().remove(server.id, sync_path_id);
        info!("已移除同步路径 {} ({})", removed.name, sync_path_id);
        Some(removed)
    }
}

/// 按调度周期筛选到期的同步路径
pub fn due_paths(server: &Server) -> Vec<u64> {
    let now = Utc::now();
    server
        .sync_paths
        .iter()
        .filter(|p| p.is_due(now))
        .map(|p| p.id)
        .collect()
}
