// 导出数据服务相关模块
pub mod archive;
pub mod backfill;
pub mod live;
pub mod streamer;

// 重新导出常用模块，方便使用
pub use archive::{ArchiveCache, ArchiveFetcher};
pub use backfill::{BackfillOrchestrator, BackfillRequest};
pub use live::{LiveFetcher, RateLimiter};
pub use streamer::{ChartDataHandler, KlineFeed, StreamingAggregator, VwapCalculator};
