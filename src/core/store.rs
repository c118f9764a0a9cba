//! 快照持久化
//!
//! 每个 (server, syncPath) 对应三个文件：
//! `l_{server}_{path}.json`、`r_{server}_{path}.json` 与 `i_{server}_{path}.json`（未完成传输）。

use super::snapshot::{SidePair, Snapshot, SyncState};
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum SnapshotKind {
    Local,
    Remote,
    Incomplete,
}

impl SnapshotKind {
    fn prefix(self) -> char {
        match self {
            SnapshotKind::Local => 'l',
            SnapshotKind::Remote => 'r',
            SnapshotKind::Incomplete => 'i',
        }
    }
}

/// 从磁盘读取的上次同步状态
#[derive(Debug, Default)]
pub struct StoredSnapshots {
    /// 本地与远程快照都可读时才存在
    pub old: Option<SidePair<Snapshot>>,
    pub old_inc: SidePair<Snapshot>,
}

impl StoredSnapshots {
    pub fn first_sync(&self) -> bool {
        self.old.is_none()
    }

    /// 填充同步状态，返回是否为首次同步
    pub fn apply(self, state: &mut SyncState) -> bool {
        let first_sync = self.first_sync();
        let local_folding = state.cur.local.is_case_insensitive();
        if let Some(old) = self.old {
            state.old.local = old.local.with_case_folding(local_folding);
            state.old.remote = old.remote;
        } else {
            state.old.local.clear();
            state.old.remote.clear();
        }
        state.old_inc.local = self.old_inc.local.with_case_folding(local_folding);
        state.old_inc.remote = self.old_inc.remote;
        first_sync
    }
}

/// 快照存储
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// 目录在首次保存时创建
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, kind: SnapshotKind, server_id: u64, sync_path_id: u64) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            kind.prefix(),
            server_id,
            sync_path_id
        ))
    }

    fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
        let data = fs::read(path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("快照文件损坏 {:?}: {}", path, e);
                None
            }
        }
    }

    /// 先写临时文件再重命名，中断时不会留下半个快照
    fn write<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(&self, server_id: u64, sync_path_id: u64) -> StoredSnapshots {
        let local = Self::read::<Snapshot>(&self.path(SnapshotKind::Local, server_id, sync_path_id));
        let remote =
            Self::read::<Snapshot>(&self.path(SnapshotKind::Remote, server_id, sync_path_id));
        let old_inc = Self::read::<SidePair<Snapshot>>(&self.path(
            SnapshotKind::Incomplete,
            server_id,
            sync_path_id,
        ))
        .unwrap_or_default();

        let old = match (local, remote) {
            (Some(local), Some(remote)) => {
                debug!(
                    "已加载快照: 本地 {} 项, 远程 {} 项",
                    local.len(),
                    remote.len()
                );
                Some(SidePair { local, remote })
            }
            _ => {
                info!("未找到快照，按首次同步处理");
                None
            }
        };
        StoredSnapshots { old, old_inc }
    }

    /// 中止的运行只保存未完成传输快照
    pub fn save(
        &self,
        server_id: u64,
        sync_path_id: u64,
        state: &SyncState,
        was_stopped: bool,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        if !was_stopped {
            Self::write(
                &self.path(SnapshotKind::Local, server_id, sync_path_id),
                &state.cur.local,
            )?;
            Self::write(
                &self.path(SnapshotKind::Remote, server_id, sync_path_id),
                &state.cur.remote,
            )?;
        }
        Self::write(
            &self.path(SnapshotKind::Incomplete, server_id, sync_path_id),
            &state.cur_inc,
        )?;
        debug!(
            "快照已保存 (server={}, path={}, stopped={})",
            server_id, sync_path_id, was_stopped
        );
        Ok(())
    }

    /// 删除同步路径时一并删除其快照
    pub fn remove(&self, server_id: u64, sync_path_id: u64) {
        for kind in [
            SnapshotKind::Local,
            SnapshotKind::Remote,
            SnapshotKind::Incomplete,
        ] {
            let path = self.path(kind, server_id, sync_path_id);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("删除快照失败 {:?}: {}", path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stat::FileStat;

    fn state_with_files() -> SyncState {
        let mut state = SyncState::default();
        state.cur.local.insert("a", FileStat::dir(10, 1));
        state
            .cur
            .local
            .insert("a/b.txt", FileStat::file(5, 11, 2, Some("ff".into())));
        state.cur.remote.insert("a", FileStat::dir(10, 100));
        let mut inc = FileStat::file(50_000_000, 12, 3, None);
        inc.incomplete_size = Some(1000);
        state.cur_inc.local.insert("a/.sync-in.big", inc);
        state
    }

    #[test]
    fn test_missing_snapshots_mean_first_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let stored = store.load(1, 2);
        assert!(stored.first_sync());
    }

    #[test]
    fn test_persist_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let state = state_with_files();
        store.save(1, 2, &state, false).unwrap();

        let stored = store.load(1, 2);
        assert!(!stored.first_sync());
        let old = stored.old.unwrap();
        assert_eq!(old.local, state.cur.local);
        assert_eq!(old.remote, state.cur.remote);
        assert_eq!(stored.old_inc, state.cur_inc);
        assert_eq!(
            stored.old_inc.local.get("a/.sync-in.big").unwrap().incomplete_size,
            Some(1000)
        );
    }

    #[test]
    fn test_stopped_run_keeps_previous_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let state = state_with_files();
        store.save(1, 2, &state, false).unwrap();

        let mut changed = state.clone();
        changed.cur.local.remove("a/b.txt");
        changed.cur_inc.local.clear();
        store.save(1, 2, &changed, true).unwrap();

        let stored = store.load(1, 2);
        assert!(stored.old.unwrap().local.contains("a/b.txt"));
        assert!(stored.old_inc.local.is_empty());
    }

    #[test]
    fn test_file_names_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        store.save(3, 7, &SyncState::default(), false).unwrap();
        for name in ["l_3_7.json", "r_3_7.json", "i_3_7.json"] {
            assert!(dir.path().join(name).exists(), "{}", name);
        }
        store.remove(3, 7);
        assert!(!dir.path().join("l_3_7.json").exists());
    }

    #[test]
    fn test_save_creates_store_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("profile/snapshots"));
        assert!(!store.dir().exists());
        store.save(1, 1, &SyncState::default(), false).unwrap();
        assert!(store.dir().join("l_1_1.json").exists());
    }

    #[test]
    fn test_unusable_store_dir_fails_save() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("snapshots");
        fs::write(&blocker, b"not a dir").unwrap();
        let store = SnapshotStore::new(blocker);
        assert!(store.save(1, 1, &SyncState::default(), false).is_err());
    }

    #[test]
    fn test_corrupted_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf());
        store.save(1, 1, &state_with_files(), false).unwrap();
        fs::write(dir.path().join("r_1_1.json"), b"{not json").unwrap();
        assert!(store.load(1, 1).first_sync());
    }
}
