//! 文件状态记录
//!
//! 持久化时使用紧凑的数组格式 `[isDir, size, mtime, ino, checksum, incompleteSize?]`，
//! 内存中使用具名字段。

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// 单个文件/目录的状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileStat {
    pub is_dir: bool,
    /// 目录恒为 0
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub mtime: i64,
    pub ino: u64,
    /// 仅在 secure diff 模式下存在（SHA-512/256，hex）
    pub checksum: Option<String>,
    /// 仅存在于未完成传输快照中，记录已传输的字节数
    pub incomplete_size: Option<u64>,
}

impl FileStat {
    pub fn dir(mtime: i64, ino: u64) -> Self {
        Self {
            is_dir: true,
            mtime,
            ino,
            ..Default::default()
        }
    }

    pub fn file(size: u64, mtime: i64, ino: u64, checksum: Option<String>) -> Self {
        Self {
            is_dir: false,
            size,
            mtime,
            ino,
            checksum,
            incomplete_size: None,
        }
    }

    /// 两个状态的 checksum 是否都存在且相同
    pub fn same_checksum(&self, other: &FileStat) -> bool {
        self.checksum.is_some() && self.checksum == other.checksum
    }

    /// `[isDir, size, mtime, ino, checksum?, incompleteSize?]`，checksum 可省略
    fn from_values(values: Vec<Value>) -> Result<Self, String> {
        if values.len() < 4 {
            return Err(format!("状态字段数量不足: {}", values.len()));
        }
        let mut it = values.into_iter();
        let is_dir = it
            .next()
            .and_then(|v| v.as_bool())
            .ok_or("isDir 字段无效")?;
        let size = it.next().and_then(|v| as_u64(&v)).ok_or("size 字段无效")?;
        let mtime = it.next().and_then(|v| as_i64(&v)).ok_or("mtime 字段无效")?;
        let ino = it.next().and_then(|v| as_u64(&v)).ok_or("ino 字段无效")?;
        let checksum = match it.next() {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => return Err(format!("checksum 字段无效: {}", other)),
        };
        let incomplete_size = it.next().as_ref().and_then(as_u64);
        Ok(Self {
            is_dir,
            size,
            mtime,
            ino,
            checksum,
            incomplete_size,
        })
    }
}

// 远程可能返回浮点数（如毫秒精度的 mtime）
fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0).floor() as u64))
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f.floor() as i64))
}

impl Serialize for FileStat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.incomplete_size.is_some() { 6 } else { 5 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.is_dir)?;
        seq.serialize_element(&self.size)?;
        seq.serialize_element(&self.mtime)?;
        seq.serialize_element(&self.ino)?;
        seq.serialize_element(&self.checksum)?;
        if let Some(n) = self.incomplete_size {
            seq.serialize_element(&n)?;
        }
        seq.end()
    }
}

struct FileStatVisitor;

impl<'de> Visitor<'de> for FileStatVisitor {
    type Value = FileStat;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("[isDir, size, mtime, ino, checksum, incompleteSize?]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<FileStat, A::Error> {
        let mut values = Vec::with_capacity(6);
        while let Some(v) = seq.next_element::<Value>()? {
            values.push(v);
        }
        FileStat::from_values(values).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for FileStat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(FileStatVisitor)
    }
}

/// 远程 diff 流中的特殊记录 `[kind, value]`
#[derive(Debug, Clone, PartialEq)]
pub enum SpecialStat {
    Error(String),
    Filtered { is_dir: bool },
}

/// 遍历过程中产生的一条记录
#[derive(Debug, Clone, PartialEq)]
pub enum StatRecord {
    Stat(FileStat),
    Special(SpecialStat),
}

impl StatRecord {
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Array(values) = value else {
            return Err(format!("状态记录不是数组: {}", value));
        };
        if values.len() == 2 {
            let kind = values[0].as_str().unwrap_or_default();
            return match kind {
                "error" => Ok(StatRecord::Special(SpecialStat::Error(
                    values[1]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| values[1].to_string()),
                ))),
                "filtered" => Ok(StatRecord::Special(SpecialStat::Filtered {
                    is_dir: values[1].as_bool().unwrap_or(false),
                })),
                other => Err(format!("未知的特殊记录类型: {}", other)),
            };
        }
        FileStat::from_values(values).map(StatRecord::Stat)
    }
}
