//! 差异归约：把分类结果合并为有序的同步计划
//!
//! - 已删除目录下的子项不再单独删除
//! - 删除 + 新增且 inode/大小（或 checksum）相同时合并为移动
//! - secure 模式下优先复制已有的相同内容
//! - 目录与空文件直接创建
//! - 最后修复移动之间的路径依赖

use super::action::{
    Action, ActionBatch, ActionKind, ActionPlan, CopyAction, MkAction, MoveAction, PropsAction,
};
use super::diff::{Classifier, DiffOptions};
use super::snapshot::{is_child_of, parent_dir, rebase, Side, SidePair, SyncState};
use std::collections::HashMap;
use tracing::debug;

/// 计算同步计划
///
/// 分类阶段只读快照；修复阶段可能为移动后的路径补充快照条目，
/// 便于执行阶段查找。
pub fn reduce(state: &mut SyncState, options: DiffOptions) -> ActionPlan {
    let mut reducer = Reducer::new(options);
    for (kind, path) in Classifier::new(state, options) {
        reducer.push(state, kind, path);
    }
    reducer.find_removed_and_diff_from_moved(state);
    reducer.fix_move_coherence(state);
    reducer.into_plan()
}

/// `src` 与 `dst` 分别位于 `from` 与 `to` 之下，且相对路径相同
fn same_relative(src: &str, from: &str, dst: &str, to: &str) -> bool {
    is_child_of(src, from) && is_child_of(dst, to) && src[from.len()..] == dst[to.len()..]
}

struct Reducer {
    options: DiffOptions,
    actions: HashMap<ActionKind, Vec<Action>>,
    /// 已删除的目录（作为前缀）
    dirs_removed: SidePair<Vec<String>>,
    /// 已移动的目录 (src, dst)
    dirs_moved: SidePair<Vec<(String, String)>>,
    /// 因父目录已删除而省略的删除项，仍可参与移动匹配
    ignore_removed: SidePair<Vec<String>>,
}

impl Reducer {
    fn new(options: DiffOptions) -> Self {
        Self {
            options,
            actions: HashMap::new(),
            dirs_removed: SidePair::default(),
            dirs_moved: SidePair::default(),
            ignore_removed: SidePair::default(),
        }
    }

    fn list(&mut self, kind: ActionKind) -> &mut Vec<Action> {
        self.actions.entry(kind).or_default()
    }

    fn contains_path(&self, kind: ActionKind, path: &str) -> bool {
        self.actions
            .get(&kind)
            .map(|list| list.iter().any(|a| matches!(a, Action::Path(p) if p == path)))
            .unwrap_or(false)
    }

    fn remove_path(&mut self, kind: ActionKind, path: &str) -> bool {
        let list = self.list(kind);
        let before = list.len();
        list.retain(|a| !matches!(a, Action::Path(p) if p == path));
        list.len() != before
    }

    fn push(&mut self, state: &SyncState, kind: ActionKind, path: String) {
        if kind.is_remove() {
            self.reduce_removed(state, kind.side(), path);
            return;
        }
        if !self.options.first_sync
            && matches!(kind, ActionKind::Download | ActionKind::Upload)
            && self.reduce_moved(state, kind.side(), &path)
        {
            return;
        }
        if kind.is_properties() {
            // 以另一侧的 mtime 为准
            if let Some(stat) = state.cur[kind.side().inverse()].get(&path) {
                let mtime = stat.mtime;
                self.list(kind).push(Action::Props(PropsAction { path, mtime }));
            }
            return;
        }
        if kind.is_transfer() {
            if self.options.secure && self.find_copies(state, kind.side(), &path) {
                return;
            }
            if self.find_mk(state, kind.side(), &path) {
                return;
            }
        }
        self.list(kind).push(Action::Path(path));
    }

    fn reduce_removed(&mut self, state: &SyncState, side: Side, path: String) {
        if self.dirs_removed[side].iter().any(|d| is_child_of(&path, d)) {
            self.ignore_removed[side].push(path);
            return;
        }
        if state.cur[side].is_dir(&path) {
            self.dirs_removed[side].insert(0, path.clone());
        }
        self.list(ActionKind::remove(side)).push(Action::Path(path));
    }

    /// 在删除项中寻找 `file_path` 的来源，找到时以移动代替删除 + 传输
    fn reduce_moved(&mut self, state: &SyncState, side: Side, file_path: &str) -> bool {
        // 变化发生在另一侧：snap 为新增项所在的一侧
        let (snap, old_snap, inv_snap, inv_old_snap) = match side {
            Side::Local => (
                &state.cur.remote,
                &state.old.remote,
                &state.cur.local,
                &state.old.local,
            ),
            Side::Remote => (
                &state.cur.local,
                &state.old.local,
                &state.cur.remote,
                &state.old.remote,
            ),
        };
        let remove_kind = ActionKind::remove(side);
        let candidates: Vec<String> = self
            .actions
            .get(&remove_kind)
            .into_iter()
            .flatten()
            .filter_map(|a| match a {
                Action::Path(p) => Some(p.clone()),
                _ => None,
            })
            .chain(self.ignore_removed[side].iter().cloned())
            .collect();

        let mut matches = Vec::new();
        for f in candidates {
            let pair = if let Some(old) = old_snap.get(&f) {
                // 移动发生在同步方向的来源一侧
                snap.get(file_path).map(|new| (new, old))
            } else if !self.options.is_both() && inv_old_snap.contains(file_path) {
                // 单向模式下目标侧被移动，按原路径移回
                inv_old_snap.get(file_path).zip(inv_snap.get(&f))
            } else {
                None
            };
            let Some((new, old)) = pair else {
                continue;
            };
            let same_inode = new.ino != 0 && new.ino == old.ino && new.size == old.size;
            let same_content = self.options.secure && !new.is_dir && new.same_checksum(old);
            if same_inode || same_content {
                matches.push(f);
            }
        }
        if matches.is_empty() {
            return false;
        }

        let dirs_moved = &self.dirs_moved[side];
        let mut already_checked = false;
        let mut found = None;
        if matches.len() > 1 && !dirs_moved.is_empty() {
            // 多个候选：选择与已移动目录一致的那个
            found = matches.iter().find(|src| {
                dirs_moved
                    .iter()
                    .any(|(from, to)| same_relative(src, from, file_path, to))
            });
            already_checked = true;
        }
        let already_matched = found.is_some();
        let src_path = found.unwrap_or(&matches[0]).clone();

        self.remove_path(remove_kind, &src_path);
        self.ignore_removed[side].retain(|p| p != &src_path);

        let dirs_moved = &self.dirs_moved[side];
        if already_matched
            || (!already_checked
                && dirs_moved
                    .iter()
                    .any(|(from, to)| same_relative(&src_path, from, file_path, to)))
        {
            debug!("忽略已随目录移动的子项 ({}): {}", side, file_path);
            return true;
        }

        let action = Action::Move(MoveAction {
            src: src_path.clone(),
            dst: file_path.to_string(),
        });
        // 来源位于已移动目录下时需要先于该目录移动
        let inside_moved = dirs_moved
            .iter()
            .any(|(from, _)| is_child_of(&src_path, from));
        let moves = self.list(ActionKind::moves(side));
        if inside_moved {
            moves.insert(0, action);
        } else {
            moves.push(action);
        }
        if snap.is_dir(file_path) {
            self.dirs_moved[side].insert(0, (src_path, file_path.to_string()));
        }
        true
    }

    /// 同一侧已有相同内容的文件时以复制代替传输
    fn find_copies(&mut self, state: &SyncState, side: Side, file_path: &str) -> bool {
        let Some(stat) = state.cur[side.inverse()].get(file_path) else {
            return false;
        };
        if stat.is_dir || stat.size == 0 {
            return false;
        }
        let src = state.cur[side]
            .iter()
            .find(|(path, s)| path.as_str() != file_path && s.same_checksum(stat))
            .map(|(path, _)| path.clone());
        let Some(src) = src else {
            return false;
        };
        let mtime = stat.mtime;
        self.list(ActionKind::copy(side)).push(Action::Copy(CopyAction {
            src,
            dst: file_path.to_string(),
            mtime,
        }));
        true
    }

    /// 目录与空文件直接创建
    fn find_mk(&mut self, state: &SyncState, side: Side, file_path: &str) -> bool {
        let Some(stat) = state.cur[side.inverse()].get(file_path) else {
            return false;
        };
        let (is_dir, mtime) = (stat.is_dir, stat.mtime);
        if !is_dir && stat.size != 0 {
            return false;
        }
        let list = self.list(ActionKind::mk(side));
        let action = Action::Mk(MkAction {
            path: file_path.to_string(),
            is_dir,
            mtime,
        });
        if is_dir {
            // 目录排在文件之前，并保持父目录在前
            let pos = list
                .iter()
                .take_while(|a| matches!(a, Action::Mk(m) if m.is_dir))
                .count();
            list.insert(pos, action);
        } else {
            list.push(action);
        }
        true
    }

    /// 恢复不属于已移动目录的删除，并把移动后又修改的文件标记为差异传输
    fn find_removed_and_diff_from_moved(&mut self, state: &mut SyncState) {
        for side in Side::BOTH {
            let moves: Vec<(String, String)> = self
                .actions
                .get(&ActionKind::moves(side))
                .into_iter()
                .flatten()
                .filter_map(|a| match a {
                    Action::Move(m) => Some((m.src.clone(), m.dst.clone())),
                    _ => None,
                })
                .collect();
            if moves.is_empty() {
                continue;
            }
            for src_path in self.ignore_removed[side].clone() {
                for (src, dst) in &moves {
                    if parent_dir(&src_path) != Some(src.as_str()) {
                        continue;
                    }
                    let dst_path = rebase(&src_path, src, dst);
                    if state.cur[side.inverse()].contains(&dst_path) {
                        let check = ActionKind::transfer(side, false);
                        if state.cur[side].contains(&src_path)
                            && self.contains_path(check, &dst_path)
                        {
                            let changed = match (
                                state.cur[side].get(&src_path),
                                state.cur[side.inverse()].get(&dst_path),
                            ) {
                                (Some(s), Some(d)) => {
                                    (self.options.secure && s.checksum != d.checksum)
                                        || s.size != d.size
                                }
                                _ => false,
                            };
                            if changed {
                                self.remove_path(check, &dst_path);
                                self.list(ActionKind::transfer(side, true))
                                    .push(Action::Path(dst_path.clone()));
                                debug!("移动后内容已修改 ({}): {} -> {}", side, src_path, dst_path);
                            }
                        }
                        continue;
                    }
                    self.ignore_removed[side].retain(|p| p != &src_path);
                    self.list(ActionKind::remove(side))
                        .push(Action::Path(dst_path.clone()));
                    // 执行阶段按目标路径查找
                    if let Some(stat) = state.cur[side].get(&src_path).cloned() {
                        state.cur[side].insert(&dst_path, stat);
                    }
                    debug!("恢复移动目录中的删除 ({}): {} -> {}", side, src_path, dst_path);
                    break;
                }
            }
        }
    }

    /// 修复互相嵌套的移动，以及双向模式下另一侧落在已移动目录中的操作
    fn fix_move_coherence(&mut self, state: &mut SyncState) {
        for side in Side::BOTH {
            let kind = ActionKind::moves(side);
            let count = self.actions.get(&kind).map(Vec::len).unwrap_or(0);
            for i in 0..count {
                let Some(Action::Move(file)) = self.list(kind).get(i).cloned() else {
                    continue;
                };
                for j in 0..count {
                    let moves = self.list(kind);
                    let Some(Action::Move(other)) = moves.get_mut(j) else {
                        continue;
                    };
                    if other.src == file.src && other.dst == file.dst {
                        continue;
                    }
                    if !(is_child_of(&other.src, &file.src) && is_child_of(&other.dst, &file.dst)) {
                        continue;
                    }
                    if i > j {
                        // 子项先于父目录移动：目标仍在旧父目录下
                        let dst = rebase(&other.dst, &file.dst, &file.src);
                        debug!("修正移动目标 ({}): {} -> {}", side, other.dst, dst);
                        other.dst = dst;
                    } else {
                        // 父目录先移动：来源已在新目录下
                        let src = rebase(&other.src, &file.src, &file.dst);
                        debug!("修正移动来源 ({}): {} -> {}", side, other.src, src);
                        if let Some(stat) = state.cur[side].get(&other.src).cloned() {
                            state.cur[side].insert(&src, stat);
                        }
                        other.src = src;
                    }
                }

                if self.options.is_both() && state.cur[side].is_dir(&file.src) {
                    self.follow_moved_dir(state, side, &file);
                }
            }
        }
    }

    /// 另一侧中目标位于 `moved.src` 之下的操作改写到 `moved.dst`
    fn follow_moved_dir(&mut self, state: &mut SyncState, side: Side, moved: &MoveAction) {
        for kind in ActionKind::first_of(side.inverse()) {
            let Some(list) = self.actions.get_mut(&kind) else {
                continue;
            };
            for action in list.iter_mut() {
                let target = action.target().to_string();
                if !is_child_of(&target, &moved.src) {
                    continue;
                }
                let dst = rebase(&target, &moved.src, &moved.dst);
                debug!("{} 跟随 {} 移动: {} -> {}", kind, side, target, dst);
                if !(kind.is_move() || kind.is_copy()) {
                    if let Some(stat) = state.cur[side].get(&target).cloned() {
                        state.cur[side].insert(&dst, stat);
                    }
                }
                action.set_target(dst);
            }
        }
    }

    fn take(&mut self, kind: ActionKind) -> Vec<Action> {
        self.actions.remove(&kind).unwrap_or_default()
    }

    /// 先输出移动、创建、传输与复制，再输出删除与属性更新
    fn into_plan(mut self) -> ActionPlan {
        let mut batches: Vec<ActionBatch> = ActionKind::FIRST
            .into_iter()
            .map(|kind| ActionBatch {
                kind,
                actions: self.take(kind),
            })
            .collect();

        let removes: SidePair<Vec<Action>> = SidePair {
            local: self.take(ActionKind::LocalRemove),
            remote: self.take(ActionKind::RemoteRemove),
        };
        let mut props: SidePair<Vec<Action>> = SidePair {
            local: self.take(ActionKind::LocalProperties),
            remote: self.take(ActionKind::RemoteProperties),
        };
        // 删除后会更新父目录的属性，这里不再重复
        for side in Side::BOTH {
            let parents: Vec<&str> = removes[side]
                .iter()
                .filter_map(|a| parent_dir(a.target()))
                .collect();
            props[side].retain(|p| !parents.contains(&p.target()));
        }

        let SidePair { local, remote } = removes;
        batches.push(ActionBatch {
            kind: ActionKind::RemoteRemove,
            actions: remote,
        });
        batches.push(ActionBatch {
            kind: ActionKind::LocalRemove,
            actions: local,
        });
        let SidePair { local, remote } = props;
        batches.push(ActionBatch {
            kind: ActionKind::RemoteProperties,
            actions: remote,
        });
        batches.push(ActionBatch {
            kind: ActionKind::LocalProperties,
            actions: local,
        });
        ActionPlan::new(batches)
    }
}
