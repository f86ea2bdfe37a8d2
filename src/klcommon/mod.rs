// 导出共享模块
pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;

// 重新导出常用类型，方便使用
pub use api::{ArchiveSource, BybitApi, KlinePageSource, PageRequest};
pub use config::ServiceConfig;
pub use db::Database;
pub use error::{AppError, Result};
pub use models::{BackfillProgress, BackfillStatus, Candle, Gap, RawKline, Resolution, VwapPoint};
