//! Sync-in 服务器的 HTTP 接口

use super::{
    DiffRequest, Download, LineStream, RemoteCopy, RemoteStorage, UploadRequest, API_DIFF,
    API_OPERATION,
};
use crate::core::checksum::READ_CHUNK_SIZE;
use crate::core::progress::TransferProgress;
use crate::error::{Result, SyncError};
use crate::models::SyncPath;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::error::Error as StdError;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("syncin/", env!("CARGO_PKG_VERSION"));

/// 连接被拒绝或重置时的重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// 第 n 次重试前等待 `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }
}

#[derive(Deserialize)]
struct InoResponse {
    ino: u64,
}

#[derive(Deserialize)]
struct CopyResponse {
    ino: u64,
    mtime: i64,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<serde_json::Value>,
    error: Option<String>,
}

/// 一个服务器的 HTTP 客户端
///
/// 重试耗尽时会取消 `stop` 令牌，整个服务器的同步随之停止。
pub struct HttpRemote {
    client: Client,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
    stop: CancellationToken,
    name: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, access_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(25)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            name: base_url.clone(),
            base_url,
            access_token: access_token.into(),
            retry: RetryPolicy::default(),
            stop: CancellationToken::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// 检查服务器是否可访问
    pub async fn check_connection(&self) -> bool {
        let resp = self
            .client
            .get(&self.base_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        match resp {
            Ok(r) if r.status() == StatusCode::OK => true,
            Ok(r) => {
                warn!("连接 {} 返回 {}", self.base_url, r.status());
                false
            }
            Err(e) => {
                warn!("连接 {} 失败: {}", self.base_url, e);
                false
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
    }

    /// 发送请求：连接错误按策略重试，非 2xx 转为 `SyncError::Http`
    ///
    /// `build` 在每次尝试时重新构造请求（上传需要重新打开文件流）。
    async fn send<F, Fut>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RequestBuilder>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.stop.is_cancelled() {
                return Err(SyncError::Aborted);
            }
            let req = build().await?;
            let result = tokio::select! {
                r = req.send() => r,
                _ = self.stop.cancelled() => return Err(SyncError::Aborted),
            };
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => return Err(Self::http_error(resp).await),
                Err(e) if is_connection_error(&e) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        warn!("连接被拒绝次数过多，停止服务器 {} 的同步", self.name);
                        self.stop.cancel();
                        return Err(SyncError::Connection(e.to_string()));
                    }
                    let delay = self.retry.delay(attempt);
                    debug!(
                        "请求重试 [{}] [{}/{}] 等待 {:?}",
                        url, attempt, self.retry.max_retries, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.cancelled() => return Err(SyncError::Aborted),
                    }
                }
                Err(e) => return Err(SyncError::Request(e)),
            }
        }
    }

    async fn send_simple(&self, method: Method, url: &str, body: Option<serde_json::Value>) -> Result<Response> {
        self.send(url, || {
            let mut req = self.request(method.clone(), url);
            if let Some(body) = &body {
                req = req.json(body);
            }
            async move { Ok(req) }
        })
        .await
    }

    /// 从响应体中提取服务器的错误信息
    async fn http_error(resp: Response) -> SyncError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| {
                let msg = match b.message {
                    Some(serde_json::Value::String(s)) => Some(s),
                    Some(serde_json::Value::Array(items)) => Some(
                        items
                            .iter()
                            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                    _ => None,
                };
                msg.or(b.error)
            })
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            });
        SyncError::Http {
            status: status.as_u16(),
            message,
        }
    }
}

/// 连接被拒绝或被重置
fn is_connection_error(e: &reqwest::Error) -> bool {
    if e.is_connect() {
        return true;
    }
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn gzip_json(body: &impl serde::Serialize) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, body)?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

#[async_trait]
impl RemoteStorage for HttpRemote {
    async fn diff(&self, sync_path: &SyncPath, request: DiffRequest) -> Result<LineStream> {
        let url = format!("{}/{}", API_DIFF, sync_path.id);
        let compressed = if request.is_compressed() {
            Some(gzip_json(&request)?)
        } else {
            None
        };
        let resp = self
            .send(&url, || {
                let req = self.request(Method::POST, &url);
                let req = match &compressed {
                    Some(body) => req
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .header(CONTENT_ENCODING, "gzip")
                        .body(body.clone()),
                    None => req.json(&request),
                };
                async move { Ok(req) }
            })
            .await
            .map_err(|e| match e {
                SyncError::Http { status: 404, .. } => SyncError::LocationNotFound,
                e => e,
            })?;

        let reader = StreamReader::new(resp.bytes_stream().map_err(io::Error::other));
        let lines = LinesStream::new(tokio::io::AsyncBufReadExt::lines(reader));
        Ok(Box::pin(lines.map_err(SyncError::Io)))
    }

    async fn download(&self, sync_path: &SyncPath, path: &str, offset: u64) -> Result<Download> {
        let url = sync_path.api_from_path(API_OPERATION, path);
        let resp = self
            .send(&url, || {
                let mut req = self.request(Method::GET, &url);
                if offset > 0 {
                    req = req.header(RANGE, format!("bytes={}-", offset));
                }
                async move { Ok(req) }
            })
            .await?;
        let resumed = offset > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
        let stream = resp.bytes_stream().map_err(SyncError::Request);
        Ok(Download {
            stream: Box::pin(stream),
            resumed,
        })
    }

    async fn upload(
        &self,
        sync_path: &SyncPath,
        path: &str,
        request: UploadRequest,
        progress: Option<Arc<TransferProgress>>,
    ) -> Result<u64> {
        let url = sync_path.api_from_path(API_OPERATION, path);
        let method = if request.diff { Method::PUT } else { Method::POST };
        let resp = self
            .send(&url, || {
                let req = self.request(method.clone(), &url);
                let request = request.clone();
                let progress = progress.clone();
                async move {
                    let mut file = tokio::fs::File::open(&request.source).await?;
                    if request.offset > 0 {
                        file.seek(SeekFrom::Start(request.offset)).await?;
                    }
                    if let Some(tp) = &progress {
                        tp.set_current(request.offset);
                    }
                    let reader = file.take(request.content_length());
                    let stream = ReaderStream::with_capacity(reader, READ_CHUNK_SIZE).inspect_ok(
                        move |chunk| {
                            if let Some(tp) = &progress {
                                tp.update(chunk.len() as u64);
                            }
                        },
                    );
                    let mut query = vec![
                        ("size", request.size.to_string()),
                        ("mtime", request.mtime.to_string()),
                    ];
                    if let Some(checksum) = &request.checksum {
                        query.push(("checksum", checksum.clone()));
                    }
                    let mut req = req
                        .query(&query)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .header(CONTENT_LENGTH, request.content_length());
                    if let Some(range) = request.content_range() {
                        req = req.header("Content-Range", range);
                    }
                    Ok(req.body(reqwest::Body::wrap_stream(stream)))
                }
            })
            .await?;
        let body: InoResponse = resp.json().await?;
        Ok(body.ino)
    }

    async fn delete(&self, sync_path: &SyncPath, path: &str) -> Result<()> {
        let url = sync_path.api_from_path(API_OPERATION, path);
        self.send_simple(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn make(&self, sync_path: &SyncPath, path: &str, is_dir: bool, mtime: i64) -> Result<u64> {
        let url = sync_path.api_from_path(&format!("{}/make", API_OPERATION), path);
        let body = json!({
            "type": if is_dir { "directory" } else { "file" },
            "mtime": mtime,
        });
        let resp = self.send_simple(Method::POST, &url, Some(body)).await?;
        let body: InoResponse = resp.json().await?;
        Ok(body.ino)
    }

    async fn rename(&self, sync_path: &SyncPath, src: &str, dst: &str) -> Result<()> {
        let url = sync_path.api_from_path(API_OPERATION, src);
        let body = json!({ "destination": sync_path.remote_full_path(dst) });
        self.send_simple(custom_method(b"MOVE")?, &url, Some(body))
            .await?;
        Ok(())
    }

    async fn copy(&self, sync_path: &SyncPath, src: &str, dst: &str, mtime: i64) -> Result<RemoteCopy> {
        let url = sync_path.api_from_path(API_OPERATION, src);
        let body = json!({ "destination": sync_path.remote_full_path(dst), "mtime": mtime });
        let resp = self
            .send_simple(custom_method(b"COPY")?, &url, Some(body))
            .await?;
        let body: CopyResponse = resp.json().await?;
        Ok(RemoteCopy {
            ino: body.ino,
            mtime: body.mtime,
        })
    }

    async fn set_mtime(&self, sync_path: &SyncPath, path: &str, mtime: i64) -> Result<()> {
        let url = sync_path.api_from_path(API_OPERATION, path);
        self.send_simple(custom_method(b"PROPPATCH")?, &url, Some(json!({ "mtime": mtime })))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn custom_method(name: &[u8]) -> Result<Method> {
    Method::from_bytes(name).map_err(|e| SyncError::Protocol(e.to_string()))
}
