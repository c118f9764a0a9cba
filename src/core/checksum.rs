//! SHA-512/256 内容校验

use sha2::{Digest, Sha512_256};
use std::io::{self, Read};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// 读取缓冲区大小
pub const READ_CHUNK_SIZE: usize = 512 * 1024;

/// 增量计算 checksum
#[derive(Default, Clone)]
pub struct Checksum {
    hasher: Sha512_256,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    pub fn of_bytes(data: &[u8]) -> String {
        let mut c = Self::new();
        c.update(data);
        c.finalize()
    }

    /// 同步读取整个文件（在阻塞线程中调用）
    pub fn of_file(path: &Path) -> io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut c = Self::new();
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            c.update(&buffer[..n]);
        }
        Ok(c.finalize())
    }

    /// 将已存在文件的内容计入校验（断点续传时使用）
    pub async fn update_from_file(&mut self, path: &Path) -> io::Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n]);
            total += n as u64;
        }
        Ok(total)
    }
}
