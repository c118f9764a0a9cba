//! 同步计划：操作类型与按批次输出的计划

use super::snapshot::Side;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// 14 种操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Upload,
    UploadDiff,
    Download,
    DownloadDiff,
    LocalMove,
    RemoteMove,
    LocalMk,
    RemoteMk,
    LocalCopy,
    RemoteCopy,
    LocalRemove,
    RemoteRemove,
    LocalProperties,
    RemoteProperties,
}

impl ActionKind {
    /// 先执行的操作，按输出顺序排列
    pub const FIRST: [ActionKind; 10] = [
        ActionKind::RemoteMove,
        ActionKind::LocalMove,
        ActionKind::RemoteMk,
        ActionKind::LocalMk,
        ActionKind::Upload,
        ActionKind::Download,
        ActionKind::UploadDiff,
        ActionKind::DownloadDiff,
        ActionKind::RemoteCopy,
        ActionKind::LocalCopy,
    ];

    /// 最后执行的操作
    pub const LAST: [ActionKind; 4] = [
        ActionKind::RemoteRemove,
        ActionKind::LocalRemove,
        ActionKind::RemoteProperties,
        ActionKind::LocalProperties,
    ];

    /// 被修改的一侧
    pub fn side(self) -> Side {
        match self {
            ActionKind::Download
            | ActionKind::DownloadDiff
            | ActionKind::LocalMove
            | ActionKind::LocalMk
            | ActionKind::LocalCopy
            | ActionKind::LocalRemove
            | ActionKind::LocalProperties => Side::Local,
            _ => Side::Remote,
        }
    }

    pub fn transfer(side: Side, diff: bool) -> Self {
        match (side, diff) {
            (Side::Local, false) => ActionKind::Download,
            (Side::Local, true) => ActionKind::DownloadDiff,
            (Side::Remote, false) => ActionKind::Upload,
            (Side::Remote, true) => ActionKind::UploadDiff,
        }
    }

    pub fn moves(side: Side) -> Self {
        match side {
            Side::Local => ActionKind::LocalMove,
            Side::Remote => ActionKind::RemoteMove,
        }
    }

    pub fn mk(side: Side) -> Self {
        match side {
            Side::Local => ActionKind::LocalMk,
            Side::Remote => ActionKind::RemoteMk,
        }
    }

    pub fn copy(side: Side) -> Self {
        match side {
            Side::Local => ActionKind::LocalCopy,
            Side::Remote => ActionKind::RemoteCopy,
        }
    }

    pub fn remove(side: Side) -> Self {
        match side {
            Side::Local => ActionKind::LocalRemove,
            Side::Remote => ActionKind::RemoteRemove,
        }
    }

    pub fn properties(side: Side) -> Self {
        match side {
            Side::Local => ActionKind::LocalProperties,
            Side::Remote => ActionKind::RemoteProperties,
        }
    }

    /// 某一侧的全部先执行操作
    pub fn first_of(side: Side) -> impl Iterator<Item = ActionKind> {
        Self::FIRST.into_iter().filter(move |k| k.side() == side)
    }

    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            ActionKind::Upload
                | ActionKind::UploadDiff
                | ActionKind::Download
                | ActionKind::DownloadDiff
        )
    }

    pub fn is_diff(self) -> bool {
        matches!(self, ActionKind::UploadDiff | ActionKind::DownloadDiff)
    }

    pub fn is_move(self) -> bool {
        matches!(self, ActionKind::LocalMove | ActionKind::RemoteMove)
    }

    pub fn is_mk(self) -> bool {
        matches!(self, ActionKind::LocalMk | ActionKind::RemoteMk)
    }

    pub fn is_copy(self) -> bool {
        matches!(self, ActionKind::LocalCopy | ActionKind::RemoteCopy)
    }

    pub fn is_remove(self) -> bool {
        matches!(self, ActionKind::LocalRemove | ActionKind::RemoteRemove)
    }

    pub fn is_properties(self) -> bool {
        matches!(
            self,
            ActionKind::LocalProperties | ActionKind::RemoteProperties
        )
    }

    /// 属性更新不计入任务数
    pub fn is_counted(self) -> bool {
        !self.is_properties()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Upload => "upload",
            ActionKind::UploadDiff => "uploadDiff",
            ActionKind::Download => "download",
            ActionKind::DownloadDiff => "downloadDiff",
            ActionKind::LocalMove => "localMove",
            ActionKind::RemoteMove => "remoteMove",
            ActionKind::LocalMk => "localMk",
            ActionKind::RemoteMk => "remoteMk",
            ActionKind::LocalCopy => "localCopy",
            ActionKind::RemoteCopy => "remoteCopy",
            ActionKind::LocalRemove => "localRemove",
            ActionKind::RemoteRemove => "remoteRemove",
            ActionKind::LocalProperties => "localProperties",
            ActionKind::RemoteProperties => "remoteProperties",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveAction {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyAction {
    pub src: String,
    pub dst: String,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MkAction {
    pub path: String,
    pub is_dir: bool,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropsAction {
    pub path: String,
    pub mtime: i64,
}

/// 计划中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Action {
    /// 传输与删除只携带路径
    Path(String),
    Move(MoveAction),
    Copy(CopyAction),
    Mk(MkAction),
    Props(PropsAction),
}

impl Action {
    /// 操作作用的目标路径
    pub fn target(&self) -> &str {
        match self {
            Action::Path(p) => p,
            Action::Move(m) => &m.dst,
            Action::Copy(c) => &c.dst,
            Action::Mk(m) => &m.path,
            Action::Props(p) => &p.path,
        }
    }

    /// 操作读取的路径（移动与复制为来源）
    pub fn source(&self) -> &str {
        match self {
            Action::Move(m) => &m.src,
            Action::Copy(c) => &c.src,
            _ => self.target(),
        }
    }

    pub fn set_target(&mut self, path: String) {
        match self {
            Action::Path(p) => *p = path,
            Action::Move(m) => m.dst = path,
            Action::Copy(c) => c.dst = path,
            Action::Mk(m) => m.path = path,
            Action::Props(p) => p.path = path,
        }
    }
}

/// 同一类型的一批操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionBatch {
    pub kind: ActionKind,
    pub actions: Vec<Action>,
}

impl ActionBatch {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// 有序的同步计划，按批次逐个取出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    batches: VecDeque<ActionBatch>,
}

impl ActionPlan {
    pub fn new(batches: impl IntoIterator<Item = ActionBatch>) -> Self {
        Self {
            batches: batches.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    /// 计入进度的任务总数
    pub fn task_count(&self) -> u64 {
        self.batches
            .iter()
            .filter(|b| b.kind.is_counted())
            .map(|b| b.len() as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> impl Iterator<Item = &ActionBatch> {
        self.batches.iter()
    }

    pub fn get(&self, kind: ActionKind) -> Option<&ActionBatch> {
        self.batches.iter().find(|b| b.kind == kind)
    }
}

impl Iterator for ActionPlan {
    type Item = ActionBatch;

    fn next(&mut self) -> Option<ActionBatch> {
        self.batches.pop_front()
    }
}
