use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{ArchiveKey, RawKline, Resolution};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument};

/// Bybit 公共REST端点
pub const DEFAULT_REST_URL: &str = "https://api.bybit.com";
/// Bybit 月度归档根地址
pub const DEFAULT_ARCHIVE_URL: &str = "https://public.bybit.com";

/// 分页请求参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub symbol: String,
    pub resolution: Resolution,
    /// 起始时间（毫秒），交易所返回该时间之后的K线，最新的在前
    pub start: i64,
    pub limit: usize,
}

/// 月度归档下载源
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// 下载归档到 dest，归档不存在时返回 Ok(false)
    async fn download_archive(&self, key: &ArchiveKey, dest: &Path) -> Result<bool>;
}

/// 分页K线源
#[async_trait]
pub trait KlinePageSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawKline>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<RawKline>,
}

/// Bybit API客户端（REST分页 + 月度归档）
#[derive(Clone, Debug)]
pub struct BybitApi {
    rest_url: String,
    archive_url: String,
    client: Client,
}

impl BybitApi {
    #[instrument(skip_all, fields(rest_url = %rest_url), err)]
    pub fn new(rest_url: String, archive_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", log_type = "module", "🌐 初始化Bybit API客户端，端点: {}", rest_url);
        Ok(Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            archive_url: archive_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn archive_url_for(&self, key: &ArchiveKey) -> String {
        format!("{}/{}", self.archive_url, key.relative_path())
    }
}

#[async_trait]
impl ArchiveSource for BybitApi {
    #[instrument(skip(self, dest), fields(symbol = %key.symbol, year = key.year, month = key.month), err)]
    async fn download_archive(&self, key: &ArchiveKey, dest: &Path) -> Result<bool> {
        let url = self.archive_url_for(key);
        debug!(target: "api", "下载归档: {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            let http_error = AppError::from(e);
            tracing::error!(
                message = "归档下载请求失败",
                url = %url,
                error.summary = http_error.get_error_type_summary(),
                error.details = %http_error
            );
            http_error
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(decision = "archive_missing", url = %url, "交易所没有该月归档");
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let api_error = AppError::ApiError(format!("下载归档失败: {} - {}", status, url));
            error!(
                target: "api",
                message = "归档下载状态错误",
                status = %status,
                error.summary = api_error.get_error_type_summary(),
                error.details = %api_error
            );
            return Err(api_error);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(decision = "archive_downloaded", url = %url, bytes = written, "归档下载完成");
        Ok(true)
    }
}

#[async_trait]
impl KlinePageSource for BybitApi {
    #[instrument(skip(self), fields(symbol = %request.symbol, start = request.start, limit = request.limit), err)]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawKline>> {
        let url = format!("{}/v5/market/kline", self.rest_url);
        let start = request.start.to_string();
        let limit = request.limit.to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("category", "linear"),
                ("symbol", request.symbol.as_str()),
                ("interval", request.resolution.bybit_interval()),
                ("start", start.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(AppError::ApiError(format!("获取K线失败: {} - {}", status, text)));
        }

        let body: KlineResponse = response.json().await?;
        if body.ret_code != 0 {
            let api_error = AppError::ApiError(format!("Bybit返回错误 retCode={} retMsg={}", body.ret_code, body.ret_msg));
            tracing::error!(
                message = "REST接口返回错误码",
                ret_code = body.ret_code,
                error.summary = api_error.get_error_type_summary(),
                error.details = %api_error
            );
            return Err(api_error);
        }

        let list = body.result.map(|r| r.list).unwrap_or_default();
        tracing::debug!(decision = "page_received", rows = list.len(), "收到K线分页");
        Ok(list)
    }
}
