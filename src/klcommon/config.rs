//! K线补齐与VWAP服务配置模块

use crate::klcommon::api::{DEFAULT_ARCHIVE_URL, DEFAULT_REST_URL};
use crate::klcommon::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 默认配置文件路径，可通过 CONFIG_PATH 环境变量覆盖
pub const DEFAULT_CONFIG_PATH: &str = "config/KlineVwapConfig.toml";

/// 服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub exchange: ExchangeConfig,
    pub backfill: BackfillConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,
}

/// 交易所配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub archive_url: String,
    pub websocket_url: String,

    /// 每页K线数量上限
    pub page_limit: usize,

    /// 每分钟最多REST调用次数
    pub max_calls_per_minute: u32,

    pub request_timeout_secs: u64,
}

/// 补齐配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// 每个批次覆盖的天数
    pub batch_days: u32,

    /// 归档解析时每次写库的行数
    pub archive_batch_rows: usize,
}

/// 实时流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 启动时加载的历史天数
    pub history_days: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 滚动日志文件目录
    pub log_dir: String,

    /// 是否启用控制台输出
    pub enable_console_output: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/klines.db".to_string(),
            pool_size: 4,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            websocket_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            page_limit: 1000,
            max_calls_per_minute: 10,
            request_timeout_secs: 30,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_days: 7,
            archive_batch_rows: 500,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { history_days: 14 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            enable_console_output: true,
        }
    }
}

impl ServiceConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 按 CONFIG_PATH 或默认路径加载；文件不存在时使用默认配置
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.database.database_path.trim().is_empty() {
            return Err(AppError::ConfigError("数据库路径不能为空".to_string()));
        }
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }
        if self.exchange.page_limit == 0 || self.exchange.page_limit > 1000 {
            return Err(AppError::ConfigError(format!(
                "每页K线数量必须在1到1000之间: {}",
                self.exchange.page_limit
            )));
        }
        if self.exchange.max_calls_per_minute == 0 {
            return Err(AppError::ConfigError("每分钟调用次数必须大于0".to_string()));
        }
        if self.exchange.request_timeout_secs == 0 {
            return Err(AppError::ConfigError("请求超时必须大于0".to_string()));
        }
        for url in [&self.exchange.rest_url, &self.exchange.archive_url, &self.exchange.websocket_url] {
            url::Url::parse(url).map_err(|e| AppError::ConfigError(format!("无效的URL {}: {}", url, e)))?;
        }
        if self.backfill.batch_days == 0 {
            return Err(AppError::ConfigError("批次天数必须大于0".to_string()));
        }
        if self.backfill.archive_batch_rows == 0 {
            return Err(AppError::ConfigError("归档写库批量必须大于0".to_string()));
        }
        if self.stream.history_days == 0 {
            return Err(AppError::ConfigError("历史加载天数必须大于0".to_string()));
        }
        Ok(())
    }
}
