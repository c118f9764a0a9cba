//! 快照：相对路径 -> 文件状态
//!
//! 键统一使用 `/` 分隔，按字典序存储，保证父目录总是排在其子项之前。

use super::stat::FileStat;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Index, IndexMut};

/// 同步的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Local, Side::Remote];

    pub fn inverse(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按 Side 索引的一对值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub local: T,
    pub remote: T,
}

impl<T> Index<Side> for SidePair<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

impl<T> IndexMut<Side> for SidePair<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }
}

/// 规范化相对路径：统一分隔符，去掉首尾多余部分
pub fn normalize_path(path: &str) -> String {
    let p = path.replace('\\', "/");
    let p = p.trim_start_matches("./").trim_matches('/');
    p.to_string()
}

/// 父目录，根目录下的条目返回 None
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

/// `path` 是否位于目录 `dir` 之下（不含 `dir` 本身）
pub fn is_child_of(path: &str, dir: &str) -> bool {
    path.len() > dir.len() + 1 && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// 将 `path` 的目录前缀 `from` 替换为 `to`
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        to.to_string()
    } else if is_child_of(path, from) {
        format!("{}{}", to, &path[from.len()..])
    } else {
        path.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, FileStat>,
    /// 大小写不敏感时：小写键 -> 实际键
    folded: Option<HashMap<String, String>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 大小写不敏感的快照（用于 Windows / macOS 本地文件系统）
    pub fn case_insensitive() -> Self {
        Self {
            entries: BTreeMap::new(),
            folded: Some(HashMap::new()),
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.folded.is_some()
    }

    /// 以指定的大小写策略重建快照
    pub fn with_case_folding(self, case_insensitive: bool) -> Self {
        if self.is_case_insensitive() == case_insensitive {
            return self;
        }
        let mut snap = if case_insensitive {
            Snapshot::case_insensitive()
        } else {
            Snapshot::new()
        };
        snap.extend(self.entries);
        snap
    }

    /// 返回快照中实际存储的键；不存在时返回规范化后的路径
    pub fn resolved_key(&self, path: &str) -> String {
        let key = normalize_path(path);
        if self.entries.contains_key(&key) {
            return key;
        }
        self.folded
            .as_ref()
            .and_then(|f| f.get(&key.to_lowercase()).cloned())
            .unwrap_or(key)
    }

    pub fn get(&self, path: &str) -> Option<&FileStat> {
        self.entries.get(&self.resolved_key(path))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut FileStat> {
        let key = self.resolved_key(path);
        self.entries.get_mut(&key)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.get(path).map(|s| s.is_dir).unwrap_or(false)
    }

    pub fn insert(&mut self, path: &str, stat: FileStat) {
        let key = self.resolved_key(path);
        if let Some(folded) = self.folded.as_mut() {
            folded.insert(key.to_lowercase(), key.clone());
        }
        self.entries.insert(key, stat);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileStat> {
        let key = self.resolved_key(path);
        if let Some(folded) = self.folded.as_mut() {
            folded.remove(&key.to_lowercase());
        }
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(folded) = self.folded.as_mut() {
            folded.clear();
        }
    }

    /// 按路径顺序遍历（父目录先于子项）
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileStat)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// `dir` 下所有后代的键
    pub fn descendants(&self, dir: &str) -> Vec<String> {
        let dir = self.resolved_key(dir);
        let prefix = format!("{}/", dir);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// 删除条目；目录（或解析出错的路径）连同后代一起删除
    pub fn remove_tree(&mut self, path: &str, parsing_error: bool) {
        if parsing_error || self.is_dir(path) {
            for child in self.descendants(path) {
                self.remove(&child);
            }
        }
        self.remove(path);
    }

    /// 移动条目及其后代
    pub fn move_tree(&mut self, src: &str, dst: &str) {
        let src = self.resolved_key(src);
        let dst = normalize_path(dst);
        for child in self.descendants(&src) {
            if let Some(stat) = self.remove(&child) {
                self.insert(&rebase(&child, &src, &dst), stat);
            }
        }
        if let Some(stat) = self.remove(&src) {
            self.insert(&dst, stat);
        }
    }

    pub fn set_mtime(&mut self, path: &str, mtime: i64) {
        if let Some(stat) = self.get_mut(path) {
            stat.mtime = mtime;
        }
    }

    pub fn extend<I: IntoIterator<Item = (String, FileStat)>>(&mut self, items: I) {
        for (path, stat) in items {
            self.insert(&path, stat);
        }
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

// 持久化格式：`[[path, stat], ...]`
impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for entry in &self.entries {
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

struct SnapshotVisitor;

impl<'de> Visitor<'de> for SnapshotVisitor {
    type Value = Snapshot;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of [path, stat] pairs")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Snapshot, A::Error> {
        let mut snapshot = Snapshot::new();
        while let Some((path, stat)) = seq.next_element::<(String, FileStat)>()? {
            snapshot.insert(&path, stat);
        }
        Ok(snapshot)
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(SnapshotVisitor)
    }
}

/// 一次同步运行中的全部快照
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// 本次遍历得到的状态，执行过程中持续更新
    pub cur: SidePair<Snapshot>,
    /// 上次成功同步后持久化的状态
    pub old: SidePair<Snapshot>,
    pub cur_inc: SidePair<Snapshot>,
    pub old_inc: SidePair<Snapshot>,
    /// 遍历时出错的路径
    pub errors: SidePair<Vec<String>>,
}

impl SyncState {
    pub fn remove_file(&mut self, side: Side, path: &str, parsing_error: bool) {
        self.cur[side].remove_tree(path, parsing_error);
    }

    pub fn move_file(&mut self, side: Side, src: &str, dst: &str) {
        self.cur[side].move_tree(src, dst);
    }

    pub fn add_file(&mut self, side: Side, path: &str, stat: FileStat) {
        self.cur[side].insert(path, stat);
    }

    pub fn prop_file(&mut self, side: Side, path: &str, mtime: i64) {
        self.cur[side].set_mtime(path, mtime);
    }

    pub fn add_incomplete(&mut self, side: Side, tmp_path: &str, stat: FileStat) {
        self.cur_inc[side].insert(tmp_path, stat);
    }

    pub fn remove_incomplete(&mut self, side: Side, tmp_path: &str) {
        self.cur_inc[side].remove(tmp_path);
    }

    /// 一侧遍历出错的路径从另一侧的当前快照中移除，避免被误判为删除
    pub fn ignore_snapshot_errors(&mut self) {
        for side in Side::BOTH {
            let errors = std::mem::take(&mut self.errors[side]);
            for path in &errors {
                self.cur[side.inverse()].remove_tree(path, true);
            }
            self.errors[side] = errors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64) -> FileStat {
        FileStat::file(size, 100, size, None)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(normalize_path("./a/b/"), "a/b");
        assert_eq!(parent_dir("a/b/c"), Some("a/b"));
        assert_eq!(parent_dir("c"), None);
    }

    #[test]
    fn test_is_child_of() {
        assert!(is_child_of("a/b", "a"));
        assert!(!is_child_of("ab/c", "a"));
        assert!(!is_child_of("a", "a"));
        assert_eq!(rebase("a/x/y", "a/x", "b"), "b/y");
        assert_eq!(rebase("a/x", "a/x", "b"), "b");
    }

    #[test]
    fn test_separator_variants_share_a_key() {
        let mut snap = Snapshot::new();
        snap.insert("dir\\file.txt", file(1));
        assert!(snap.contains("dir/file.txt"));
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut snap = Snapshot::case_insensitive();
        snap.insert("Docs/Readme.md", file(3));
        assert_eq!(snap.resolved_key("docs/readme.md"), "Docs/Readme.md");
        assert!(snap.contains("DOCS/README.MD"));
        snap.insert("docs/readme.md", file(4));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("Docs/Readme.md").unwrap().size, 4);
    }

    #[test]
    fn test_parents_iterate_first() {
        let mut snap = Snapshot::new();
        snap.insert("a/x", file(1));
        snap.insert("a-b", file(1));
        snap.insert("a", FileStat::dir(1, 1));
        let keys: Vec<_> = snap.keys().cloned().collect();
        let a = keys.iter().position(|k| k == "a").unwrap();
        let ax = keys.iter().position(|k| k == "a/x").unwrap();
        assert!(a < ax);
    }

    #[test]
    fn test_remove_tree_and_move_tree() {
        let mut snap = Snapshot::new();
        snap.insert("a", FileStat::dir(1, 1));
        snap.insert("a/x", file(1));
        snap.insert("a/y/z", file(2));
        snap.insert("ab", file(3));

        snap.move_tree("a", "b");
        assert!(snap.contains("b/x"));
        assert!(snap.contains("b/y/z"));
        assert!(!snap.contains("a/x"));
        assert!(snap.contains("ab"));

        snap.remove_tree("b", false);
        assert_eq!(snap.keys().cloned().collect::<Vec<_>>(), vec!["ab"]);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snap = Snapshot::new();
        snap.insert("f", file(2));
        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(json, r#"[["f",[false,2,100,2,null]]]"#);
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_ignore_snapshot_errors() {
        let mut state = SyncState::default();
        state.cur.remote.insert("d", FileStat::dir(1, 1));
        state.cur.remote.insert("d/f", file(1));
        state.cur.remote.insert("g", file(1));
        state.errors.local.push("d".into());
        state.ignore_snapshot_errors();
        assert!(!state.cur.remote.contains("d"));
        assert!(!state.cur.remote.contains("d/f"));
        assert!(state.cur.remote.contains("g"));
    }
}
