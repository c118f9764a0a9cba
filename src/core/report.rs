//! 报告模式：只输出计划中的操作，不修改任何一侧

use super::action::{Action, ActionKind, ActionPlan};
use super::progress::TransferReporter;
use super::snapshot::{Side, SyncState};
use crate::models::{FileAction, SyncTransfer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Report {
    reporter: Arc<TransferReporter>,
    cancel: CancellationToken,
}

impl Report {
    pub fn new(reporter: Arc<TransferReporter>, cancel: CancellationToken) -> Self {
        Self { reporter, cancel }
    }

    /// 为每个计划操作发送一条结果，来源在快照中存在时为成功
    pub fn run(&self, state: &SyncState, plan: ActionPlan) {
        for batch in plan {
            if self.cancel.is_cancelled() {
                warn!("报告已中止");
                break;
            }
            let kind = batch.kind;
            if kind.is_properties() {
                for action in &batch.actions {
                    debug!("{} PROPS - {}", kind.side(), action.target());
                }
                continue;
            }
            self.reporter.add_tasks(batch.len() as u64);
            let checked = checked_side(kind);
            let snapshot = &state.cur[checked];
            for action in &batch.actions {
                let source = action.source();
                let stat = snapshot.get(source);
                let is_dir = match action {
                    Action::Mk(m) => m.is_dir,
                    _ => stat.map(|s| s.is_dir).unwrap_or(false),
                };
                let mut tr = SyncTransfer::new(kind.side(), file_action(kind, is_dir), source, is_dir);
                if matches!(action, Action::Move(_) | Action::Copy(_)) {
                    tr = tr.with_dst(action.target());
                }
                let tr = if stat.is_some() {
                    tr.succeed()
                } else {
                    warn!("{}: {} 快照中找不到 {}", kind, checked, source);
                    tr.fail(format!("not found in {} snapshot", checked))
                };
                self.reporter.done(tr);
            }
        }
    }
}

/// 检查来源所在的快照：传输与创建读取另一侧，移动、复制、删除读取被修改的一侧
fn checked_side(kind: ActionKind) -> Side {
    if kind.is_transfer() || kind.is_mk() {
        kind.side().inverse()
    } else {
        kind.side()
    }
}

fn file_action(kind: ActionKind, is_dir: bool) -> FileAction {
    match kind {
        ActionKind::Upload | ActionKind::Download => FileAction::New,
        ActionKind::UploadDiff | ActionKind::DownloadDiff => FileAction::Diff,
        ActionKind::LocalMove | ActionKind::RemoteMove => FileAction::Move,
        ActionKind::LocalCopy | ActionKind::RemoteCopy => FileAction::Copy,
        ActionKind::LocalMk | ActionKind::RemoteMk if is_dir => FileAction::Mkdir,
        ActionKind::LocalMk | ActionKind::RemoteMk => FileAction::Mkfile,
        ActionKind::LocalRemove | ActionKind::RemoteRemove if is_dir => FileAction::Rmdir,
        ActionKind::LocalRemove | ActionKind::RemoteRemove => FileAction::Rm,
        ActionKind::LocalProperties | ActionKind::RemoteProperties => FileAction::Props,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{ActionBatch, MkAction, MoveAction, PropsAction};
    use crate::core::progress::{SyncContext, SyncEvent, SyncEvents};
    use crate::core::stat::FileStat;

    #[test]
    fn test_report_checks_source_snapshots() {
        let events = SyncEvents::new();
        let mut rx = events.subscribe();
        let reporter = Arc::new(TransferReporter::new(SyncContext::default(), events, true));
        let report = Report::new(reporter.clone(), CancellationToken::new());

        let mut state = SyncState::default();
        state.cur.local.insert("up.txt", FileStat::file(1, 1, 1, None));
        state.cur.remote.insert("old", FileStat::dir(1, 2));
        state.cur.remote.insert("gone", FileStat::file(1, 1, 3, None));

        let plan = ActionPlan::new(vec![
            ActionBatch {
                kind: ActionKind::RemoteMove,
                actions: vec![Action::Move(MoveAction {
                    src: "old".into(),
                    dst: "new".into(),
                })],
            },
            ActionBatch {
                kind: ActionKind::Upload,
                actions: vec![Action::Path("up.txt".into()), Action::Path("missing".into())],
            },
            ActionBatch {
                kind: ActionKind::LocalMk,
                actions: vec![Action::Mk(MkAction {
                    path: "d".into(),
                    is_dir: true,
                    mtime: 1,
                })],
            },
            ActionBatch {
                kind: ActionKind::RemoteRemove,
                actions: vec![Action::Path("gone".into())],
            },
            ActionBatch {
                kind: ActionKind::RemoteProperties,
                actions: vec![Action::Props(PropsAction {
                    path: "x".into(),
                    mtime: 1,
                })],
            },
        ]);
        report.run(&state, plan);

        let mut transfers = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Transfer {
                report_only,
                transfer,
                ..
            } = event
            {
                assert!(report_only);
                transfers.push(transfer);
            }
        }
        assert_eq!(transfers.len(), 5);
        assert_eq!(reporter.count(), 5);

        let moved = &transfers[0];
        assert!(moved.ok && moved.is_dir);
        assert_eq!(moved.file_dst.as_deref(), Some("new"));
        assert!(transfers[1].ok);
        assert!(!transfers[2].ok);
        assert_eq!(
            transfers[2].error.as_deref(),
            Some("not found in local snapshot")
        );
        // LocalMk 读取远程快照，"d" 不存在
        assert_eq!(transfers[3].action, FileAction::Mkdir);
        assert!(!transfers[3].ok);
        assert_eq!(transfers[4].action, FileAction::Rm);
        assert!(transfers[4].ok);
    }

    #[test]
    fn test_report_stops_when_cancelled() {
        let reporter = Arc::new(TransferReporter::new(
            SyncContext::default(),
            SyncEvents::new(),
            true,
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = ActionPlan::new(vec![ActionBatch {
            kind: ActionKind::Download,
            actions: vec![Action::Path("a".into())],
        }]);
        Report::new(reporter.clone(), cancel).run(&SyncState::default(), plan);
        assert_eq!(reporter.done_count(), 0);
    }
}
