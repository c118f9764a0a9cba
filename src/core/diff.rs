//! 差异分类：比较本地与远程的当前快照
//!
//! `Classifier` 是一个惰性迭代器，每次产生一个 `(ActionKind, 路径)`，
//! 由 `reduce` 逐个消费。

use super::action::ActionKind;
use super::snapshot::{Side, SidePair, Snapshot, SyncState};
use super::stat::FileStat;
use crate::models::{ConflictMode, SyncMode, SyncPath};
use std::vec;
use tracing::trace;

/// 分类与归约使用的同步路径设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub mode: SyncMode,
    pub secure: bool,
    pub conflict: ConflictMode,
    pub first_sync: bool,
}

impl DiffOptions {
    pub fn new(sync_path: &SyncPath, first_sync: bool) -> Self {
        Self {
            mode: sync_path.mode,
            secure: sync_path.secure_diff(),
            conflict: sync_path.conflict_mode,
            first_sync,
        }
    }

    pub fn is_both(&self) -> bool {
        self.mode == SyncMode::Both
    }
}

/// 原始差异状态
///
/// 单向模式只会出现前四种；双向模式下由冲突策略和旧快照决定权威侧。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta {
    /// 只存在于本地
    Added,
    /// 只存在于远程
    Removed,
    Changed,
    Properties,
    LocalAdded,
    RemoteAdded,
    LocalRemoved,
    RemoteRemoved,
    LocalChanged,
    RemoteChanged,
    LocalProperties,
    RemoteProperties,
}

impl Delta {
    fn changed(side: Side, properties: bool) -> Self {
        match (side, properties) {
            (Side::Local, false) => Delta::LocalChanged,
            (Side::Remote, false) => Delta::RemoteChanged,
            (Side::Local, true) => Delta::LocalProperties,
            (Side::Remote, true) => Delta::RemoteProperties,
        }
    }

    fn action(self, mode: SyncMode) -> ActionKind {
        let download = mode == SyncMode::Download;
        match self {
            Delta::Added if download => ActionKind::LocalRemove,
            Delta::Added => ActionKind::Upload,
            Delta::Removed if download => ActionKind::Download,
            Delta::Removed => ActionKind::RemoteRemove,
            Delta::Changed if download => ActionKind::DownloadDiff,
            Delta::Changed => ActionKind::UploadDiff,
            Delta::Properties if download => ActionKind::LocalProperties,
            Delta::Properties => ActionKind::RemoteProperties,
            Delta::LocalAdded => ActionKind::Upload,
            Delta::RemoteAdded => ActionKind::Download,
            Delta::LocalRemoved => ActionKind::RemoteRemove,
            Delta::RemoteRemoved => ActionKind::LocalRemove,
            Delta::LocalChanged => ActionKind::UploadDiff,
            Delta::RemoteChanged => ActionKind::DownloadDiff,
            Delta::LocalProperties => ActionKind::RemoteProperties,
            Delta::RemoteProperties => ActionKind::LocalProperties,
        }
    }
}

type Deltas<'a> = Box<dyn Iterator<Item = (Delta, String)> + 'a>;

/// 单向比较：本地为源，远程为目标
fn unidirectional<'a>(state: &'a SyncState, options: DiffOptions) -> Deltas<'a> {
    let source = &state.cur.local;
    let destination = &state.cur.remote;
    // 只存在于目标侧的条目；下载模式下放到最后
    let removed = move || {
        destination
            .keys()
            .filter(move |path| !source.contains(path))
            .map(|path| (Delta::Removed, path.clone()))
    };
    let download = options.mode == SyncMode::Download;
    let before = (!download).then(removed);
    let after = download.then(removed);

    let compared = source
        .iter()
        .filter_map(move |(src_path, src)| match destination.get(src_path) {
            None => Some((Delta::Added, src_path.clone())),
            Some(dst) => {
                let dst_path = destination.resolved_key(src_path);
                has_changed(options, src_path, &dst_path, src, dst)
            }
        });

    Box::new(
        before
            .into_iter()
            .flatten()
            .chain(compared)
            .chain(after.into_iter().flatten()),
    )
}

fn has_changed(
    options: DiffOptions,
    src_path: &str,
    dst_path: &str,
    src: &FileStat,
    dst: &FileStat,
) -> Option<(Delta, String)> {
    let content = (options.secure && src.checksum != dst.checksum) || src.size != dst.size;
    let properties = if content {
        false
    } else if src.mtime != dst.mtime {
        true
    } else {
        return None;
    };
    if options.is_both() {
        return Some(resolve_conflict(
            options.conflict,
            properties,
            src_path,
            dst_path,
            src,
            dst,
        ));
    }
    let delta = if properties {
        Delta::Properties
    } else {
        Delta::Changed
    };
    let path = if options.mode == SyncMode::Upload {
        dst_path
    } else {
        src_path
    };
    Some((delta, path.to_string()))
}

/// 双向模式的冲突策略，返回胜出侧的状态与被更新侧的路径
fn resolve_conflict(
    conflict: ConflictMode,
    properties: bool,
    src_path: &str,
    dst_path: &str,
    src: &FileStat,
    dst: &FileStat,
) -> (Delta, String) {
    let winner = match conflict {
        ConflictMode::Recent => {
            let local_is_newer = if src.mtime == dst.mtime {
                src.size >= dst.size
            } else {
                src.mtime >= dst.mtime
            };
            if local_is_newer {
                Side::Local
            } else {
                Side::Remote
            }
        }
        ConflictMode::Local => Side::Local,
        ConflictMode::Remote => Side::Remote,
    };
    let path = match winner {
        Side::Local => dst_path,
        Side::Remote => src_path,
    };
    (Delta::changed(winner, properties), path.to_string())
}

/// 差异分类迭代器
pub struct Classifier<'a> {
    old: &'a SidePair<Snapshot>,
    options: DiffOptions,
    inner: Deltas<'a>,
    /// 双向模式下延后输出的新增项，先本地后远程
    delayed: Vec<(Delta, String)>,
    delayed_remote: Vec<(Delta, String)>,
    drained: Option<vec::IntoIter<(Delta, String)>>,
}

impl<'a> Classifier<'a> {
    pub fn new(state: &'a SyncState, options: DiffOptions) -> Self {
        Self {
            old: &state.old,
            options,
            inner: unidirectional(state, options),
            delayed: Vec::new(),
            delayed_remote: Vec::new(),
            drained: None,
        }
    }

    /// 双向模式：用旧快照区分新增与另一侧的删除，新增项延后以便先匹配移动
    fn bidirectional(&mut self, delta: Delta, path: String) -> Option<(Delta, String)> {
        match delta {
            Delta::Added => {
                if !self.options.first_sync && self.old.local.contains(&path) {
                    // 上次同步时本地已存在，说明远程删除了它
                    return Some((Delta::RemoteRemoved, path));
                }
                self.delayed.push((Delta::LocalAdded, path));
                None
            }
            Delta::Removed => {
                if !self.options.first_sync && self.old.remote.contains(&path) {
                    return Some((Delta::LocalRemoved, path));
                }
                self.delayed_remote.push((Delta::RemoteAdded, path));
                None
            }
            other => Some((other, path)),
        }
    }

    fn next_delta(&mut self) -> Option<(Delta, String)> {
        if let Some(drained) = self.drained.as_mut() {
            return drained.next();
        }
        while let Some((delta, path)) = self.inner.next() {
            if !self.options.is_both() {
                return Some((delta, path));
            }
            if let Some(found) = self.bidirectional(delta, path) {
                return Some(found);
            }
        }
        let mut delayed = std::mem::take(&mut self.delayed);
        delayed.append(&mut self.delayed_remote);
        let drained = self.drained.insert(delayed.into_iter());
        drained.next()
    }
}

impl Iterator for Classifier<'_> {
    type Item = (ActionKind, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (delta, path) = self.next_delta()?;
            let kind = delta.action(self.options.mode);
            // 首次同步不产生删除
            if self.options.first_sync && kind.is_remove() {
                trace!("首次同步，忽略删除: {}", path);
                continue;
            }
            return Some((kind, path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64, mtime: i64, ino: u64) -> FileStat {
        FileStat::file(size, mtime, ino, None)
    }

    fn options(mode: SyncMode) -> DiffOptions {
        DiffOptions {
            mode,
            secure: false,
            conflict: ConflictMode::Recent,
            first_sync: false,
        }
    }

    fn classify(state: &SyncState, options: DiffOptions) -> Vec<(ActionKind, String)> {
        Classifier::new(state, options).collect()
    }

    #[test]
    fn test_upload_mode_removed_first() {
        let mut state = SyncState::default();
        state.cur.local.insert("a", file(1, 10, 1));
        state.cur.local.insert("same", file(1, 10, 2));
        state.cur.remote.insert("same", file(1, 10, 3));
        state.cur.remote.insert("z", file(1, 10, 4));

        let result = classify(&state, options(SyncMode::Upload));
        assert_eq!(
            result,
            vec![
                (ActionKind::RemoteRemove, "z".to_string()),
                (ActionKind::Upload, "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_download_mode_removed_last() {
        let mut state = SyncState::default();
        state.cur.local.insert("a", file(1, 10, 1));
        state.cur.local.insert("c", file(1, 10, 1));
        state.cur.remote.insert("b", file(1, 10, 2));
        state.cur.remote.insert("c", file(5, 10, 2));

        let result = classify(&state, options(SyncMode::Download));
        assert_eq!(
            result,
            vec![
                (ActionKind::LocalRemove, "a".to_string()),
                (ActionKind::DownloadDiff, "c".to_string()),
                (ActionKind::Download, "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_mtime_only_is_properties() {
        let mut state = SyncState::default();
        state.cur.local.insert("f", file(3, 10, 1));
        state.cur.remote.insert("f", file(3, 20, 2));
        let result = classify(&state, options(SyncMode::Upload));
        assert_eq!(result, vec![(ActionKind::RemoteProperties, "f".to_string())]);
    }

    #[test]
    fn test_secure_mode_compares_checksum() {
        let mut state = SyncState::default();
        state
            .cur
            .local
            .insert("f", FileStat::file(3, 10, 1, Some("aaa".into())));
        state
            .cur
            .remote
            .insert("f", FileStat::file(3, 10, 2, Some("bbb".into())));
        let mut opts = options(SyncMode::Upload);
        assert!(classify(&state, opts).is_empty());
        opts.secure = true;
        assert_eq!(
            classify(&state, opts),
            vec![(ActionKind::UploadDiff, "f".to_string())]
        );
    }

    #[test]
    fn test_recent_policy_tie_prefers_larger_size() {
        let mut state = SyncState::default();
        state.cur.local.insert("f", file(50, 100, 1));
        state.cur.remote.insert("f", file(80, 100, 2));
        let result = classify(&state, options(SyncMode::Both));
        assert_eq!(result, vec![(ActionKind::DownloadDiff, "f".to_string())]);

        state.cur.local.insert("f", file(50, 200, 1));
        let result = classify(&state, options(SyncMode::Both));
        assert_eq!(result, vec![(ActionKind::UploadDiff, "f".to_string())]);
    }

    #[test]
    fn test_fixed_conflict_policies() {
        let mut state = SyncState::default();
        state.cur.local.insert("f", file(50, 300, 1));
        state.cur.remote.insert("f", file(80, 100, 2));
        let mut opts = options(SyncMode::Both);
        opts.conflict = ConflictMode::Remote;
        assert_eq!(
            classify(&state, opts),
            vec![(ActionKind::DownloadDiff, "f".to_string())]
        );
        opts.conflict = ConflictMode::Local;
        assert_eq!(
            classify(&state, opts),
            vec![(ActionKind::UploadDiff, "f".to_string())]
        );
    }

    #[test]
    fn test_bidirectional_uses_old_snapshots() {
        let mut state = SyncState::default();
        // 本地新增
        state.cur.local.insert("new_local", file(1, 1, 1));
        // 远程删除（本地旧快照中存在）
        state.cur.local.insert("gone_remote", file(1, 1, 2));
        state.old.local.insert("gone_remote", file(1, 1, 2));
        // 本地删除
        state.cur.remote.insert("gone_local", file(1, 1, 3));
        state.old.remote.insert("gone_local", file(1, 1, 3));
        // 远程新增
        state.cur.remote.insert("new_remote", file(1, 1, 4));

        let result = classify(&state, options(SyncMode::Both));
        assert_eq!(
            result,
            vec![
                (ActionKind::RemoteRemove, "gone_local".to_string()),
                (ActionKind::LocalRemove, "gone_remote".to_string()),
                (ActionKind::Upload, "new_local".to_string()),
                (ActionKind::Download, "new_remote".to_string()),
            ]
        );
    }

    #[test]
    fn test_first_sync_never_removes() {
        let mut state = SyncState::default();
        state.cur.local.insert("only_local", file(1, 1, 1));
        state.old.local.insert("only_local", file(1, 1, 1));
        state.cur.remote.insert("only_remote", file(1, 1, 2));

        let mut opts = options(SyncMode::Both);
        opts.first_sync = true;
        assert_eq!(
            classify(&state, opts),
            vec![
                (ActionKind::Upload, "only_local".to_string()),
                (ActionKind::Download, "only_remote".to_string()),
            ]
        );

        opts.mode = SyncMode::Download;
        assert_eq!(
            classify(&state, opts),
            vec![(ActionKind::Download, "only_remote".to_string())]
        );
    }

    #[test]
    fn test_case_insensitive_local_keys() {
        let mut state = SyncState::default();
        state.cur.local = Snapshot::case_insensitive();
        state.cur.remote = Snapshot::case_insensitive();
        state.cur.local.insert("Docs/A.txt", file(1, 1, 1));
        state.cur.remote.insert("docs/a.txt", file(2, 1, 2));
        let result = classify(&state, options(SyncMode::Upload));
        assert_eq!(result, vec![(ActionKind::UploadDiff, "docs/a.txt".to_string())]);
    }
}
