//! 日志模块 - 控制台输出与按大小轮转的文件日志

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "sync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件的最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 保留的轮转文件数
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_max_files() -> u32 {
    3
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            max_files: default_max_files(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 默认过滤规则，`RUST_LOG` 优先
    pub fn env_filter(&self) -> Result<EnvFilter> {
        let level = self.tracing_level().to_string().to_lowercase();
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new(format!("syncin={}", level)),
        };
        Ok(filter
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?))
    }
}

/// 带大小限制的日志写入器
///
/// 超过大小时 `sync.log` 轮转为 `sync.log.1`，已有的编号依次后移，
/// 超出 `max_files` 的文件被删除。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    max_files: u32,
    writer: Option<BufWriter<File>>,
    size: u64,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32, max_files: u32) -> io::Result<Self> {
        Self::with_max_bytes(log_dir, (max_size_mb as u64) * 1024 * 1024, max_files)
    }

    pub fn with_max_bytes(log_dir: &Path, max_size: u64, max_files: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let mut writer = Self {
            file_path: log_dir.join(LOG_FILE),
            max_size: max_size.max(1),
            max_files: max_files.max(1),
            writer: None,
            size: 0,
        };
        writer.open()?;
        if writer.size > writer.max_size {
            writer.rotate()?;
        }
        Ok(writer)
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn rotated_path(&self, n: u32) -> PathBuf {
        let mut name = self.file_path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// 轮转日志文件
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        let oldest = self.rotated_path(self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files).rev() {
            let from = self.rotated_path(n);
            if from.exists() {
                fs::rename(&from, self.rotated_path(n + 1))?;
            }
        }
        if self.file_path.exists() {
            fs::rename(&self.file_path, self.rotated_path(1))?;
        }
        self.open()
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return Err(io::Error::other("日志文件不可用")),
        };
        let n = writer.write(buf)?;
        writer.flush()?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// 初始化日志：控制台 + `sync.log`
///
/// 返回的 guard 在程序退出前必须保持存活，否则缓冲中的日志会丢失。
pub fn init(log_dir: &Path, config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);
    let registry = tracing_subscriber::registry()
        .with(config.env_filter()?)
        .with(console_layer);

    if !config.enabled {
        registry.try_init()?;
        return Ok(None);
    }

    let writer = SizeRotatingWriter::new(log_dir, config.max_size_mb, config.max_files)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);
    registry.with(file_layer).try_init()?;
    Ok(Some(guard))
}
