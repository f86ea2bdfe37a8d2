//! 日志系统初始化
//!
//! 滚动文件层总是启用，控制台层由配置决定

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::error::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志文件名前缀（按天滚动）
pub const LOG_FILE_PREFIX: &str = "kline_vwap.log";

/// 业务日志过滤串：配置级别，且把噪声较大的依赖库压到 warn
pub fn business_filter(log_level: &str) -> String {
    format!(
        "{},hyper=warn,reqwest=warn,rusqlite=warn,r2d2=warn,tungstenite=warn,tokio_tungstenite=warn",
        log_level
    )
}

fn build_filter(log_level: &str) -> EnvFilter {
    // RUST_LOG 优先于配置文件
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(business_filter(log_level)))
}

/// 初始化日志系统，返回的 guard 必须由 main 持有到进程结束
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(build_filter(&config.log_level));

    let console_layer = config.enable_console_output.then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_filter(build_filter(&config.log_level))
    });

    Registry::default()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("初始化日志系统失败: {}", e)))?;

    tracing::info!(
        target: "logging",
        log_type = "module",
        log_level = %config.log_level,
        log_dir = %config.log_dir,
        console = config.enable_console_output,
        "日志系统初始化完成"
    );
    Ok(guard)
}
