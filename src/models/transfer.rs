use crate::core::snapshot::Side;
use serde::{Deserialize, Serialize};

/// 对文件执行的操作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileAction {
    New,
    Diff,
    Rm,
    Rmdir,
    Move,
    Copy,
    Mkdir,
    Mkfile,
    Props,
    Filtered,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileAction::New => "NEW",
            FileAction::Diff => "DIFF",
            FileAction::Rm => "RM",
            FileAction::Rmdir => "RMDIR",
            FileAction::Move => "MOVE",
            FileAction::Copy => "COPY",
            FileAction::Mkdir => "MKDIR",
            FileAction::Mkfile => "MKFILE",
            FileAction::Props => "PROPS",
            FileAction::Filtered => "FILTERED",
        };
        f.write_str(s)
    }
}

/// 单个操作的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncTransfer {
    pub ok: bool,
    pub side: Side,
    pub action: FileAction,
    pub file: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncTransfer {
    pub fn new(side: Side, action: FileAction, file: impl Into<String>, is_dir: bool) -> Self {
        Self {
            ok: false,
            side,
            action,
            file: file.into(),
            is_dir,
            file_dst: None,
            error: None,
        }
    }

    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.file_dst = Some(dst.into());
        self
    }

    pub fn succeed(mut self) -> Self {
        self.ok = true;
        self.error = None;
        self
    }

    pub fn fail(mut self, error: impl ToString) -> Self {
        self.ok = false;
        self.error = Some(error.to_string());
        self
    }

    /// 日志中使用的单行描述
    pub fn describe(&self) -> String {
        let arrow = match self.side {
            Side::Local => "<-",
            Side::Remote => "->",
        };
        let target = match &self.file_dst {
            Some(dst) => format!("{} => {}", self.file, dst),
            None => self.file.clone(),
        };
        match &self.error {
            Some(e) => format!("{} {} {} ({})", arrow, self.action, target, e),
            None => format!("{} {} {}", arrow, self.action, target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_json() {
        let tr = SyncTransfer::new(Side::Remote, FileAction::Move, "a", true)
            .with_dst("b")
            .succeed();
        let json = serde_json::to_value(&tr).unwrap();
        assert_eq!(json["action"], "MOVE");
        assert_eq!(json["side"], "remote");
        assert_eq!(json["fileDst"], "b");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_describe() {
        let tr = SyncTransfer::new(Side::Local, FileAction::New, "f.txt", false)
            .fail("size does not match");
        assert_eq!(tr.describe(), "<- NEW f.txt (size does not match)");
    }
}
