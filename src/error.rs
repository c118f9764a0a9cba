//! 同步错误类型

use thiserror::Error;

/// 同步过程中的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 用户或服务器要求停止
    #[error("同步已中止")]
    Aborted,

    /// 首次同步保护：一侧为空而另一侧非空
    #[error("{0}")]
    SafetyGuard(String),

    #[error("远程位置不存在")]
    LocationNotFound,

    /// 远程 diff 流在 "done" 之前结束
    #[error("远程解析不完整 ({0} 个文件)")]
    IncompleteRemote(usize),

    /// 远程 diff 流中的非法数据
    #[error("无法解析远程数据: {0}")]
    Protocol(String),

    #[error("[{status}] {message}")]
    Http { status: u16, message: String },

    /// 重试耗尽后的连接错误
    #[error("连接失败: {0}")]
    Connection(String),

    /// 传输后校验失败（checksum / size）
    #[error("{0} does not match")]
    Verification(&'static str),

    #[error("{0}")]
    Transfer(String),

    #[error("本地目录不可访问: {0}")]
    LocalRoot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    /// 是否为整个同步路径级别的错误（需要中止）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Aborted
                | SyncError::SafetyGuard(_)
                | SyncError::LocationNotFound
                | SyncError::IncompleteRemote(_)
                | SyncError::Protocol(_)
                | SyncError::Connection(_)
                | SyncError::LocalRoot(_)
        )
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        SyncError::Transfer(msg.into())
    }
}
