use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// 输入校验失败（时间窗口、交易对、周期等），在任何I/O之前拒绝
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    /// 补齐任务失败，携带失败时所在的批次窗口，调用方可据此只重试剩余区间
    #[error("Backfill failed in window [{start}, {end}): {source}")]
    BackfillError {
        start: i64,
        end: i64,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于结构化日志中的错误分类
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "kline_request_invalid",

            // K线数据获取相关
            AppError::ApiError(_) => "kline_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::UrlParseError(_) => "market_endpoint_invalid",
            AppError::WebSocketError(_) => "realtime_market_data_failed",

            // K线数据解析相关
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::CsvError(_) => "kline_archive_parsing_failed",
            AppError::ParseError(_) => "market_data_format_invalid",

            // K线数据存储相关
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",

            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::ConfigError(_) => "kline_service_configuration_invalid",
            AppError::TaskError(_) => "kline_worker_task_failed",

            AppError::BackfillError { .. } => "kline_backfill_failed",
        }
    }

    /// 是否属于传输类错误（下载、REST、推送流）
    ///
    /// 归档行解析失败视同传输失败：数据损坏不能被静默跳过
    pub fn is_transport(&self) -> bool {
        match self {
            AppError::ApiError(_)
            | AppError::HttpError(_)
            | AppError::UrlParseError(_)
            | AppError::WebSocketError(_)
            | AppError::ParseError(_)
            | AppError::CsvError(_)
            | AppError::JsonError(_) => true,
            AppError::BackfillError { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// 是否属于存储类错误
    pub fn is_storage(&self) -> bool {
        match self {
            AppError::DatabaseError(_) | AppError::SqliteError(_) => true,
            AppError::BackfillError { source, .. } => source.is_storage(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_error_keeps_window_and_cause() {
        let err = AppError::BackfillError {
            start: 1_000,
            end: 2_000,
            source: Box::new(AppError::ParseError("bad row".to_string())),
        };

        assert!(err.is_transport());
        assert!(!err.is_storage());
        assert_eq!(err.get_error_type_summary(), "kline_backfill_failed");
        let text = err.to_string();
        assert!(text.contains("[1000, 2000)"));
        assert!(text.contains("bad row"));
    }

    #[test]
    fn database_errors_are_storage() {
        assert!(AppError::DatabaseError("locked".into()).is_storage());
        assert!(!AppError::ValidationError("x".into()).is_transport());
    }
}
