use crate::klcommon::api::{KlinePageSource, PageRequest};
use crate::klcommon::context::run_blocking;
use crate::klcommon::db::Database;
use crate::klcommon::error::Result;
use crate::klcommon::models::{format_ts, Candle, Resolution};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// 每页默认K线数量（Bybit上限）
pub const DEFAULT_PAGE_LIMIT: usize = 1000;
/// 默认每分钟最多调用次数
pub const DEFAULT_MAX_CALLS_PER_MINUTE: u32 = 10;

/// 闭区间 [start, end] 内预计的K线数量 (end - start) / period + 1，只用作提前结束的参考
pub fn expected_candle_count(start: i64, end: i64, period_ms: i64) -> usize {
    if end < start || period_ms <= 0 {
        return 0;
    }
    ((end - start) / period_ms + 1) as usize
}

/// 下一页的起始时间
pub fn next_cursor(oldest_valid: i64, valid_count: usize, period_ms: i64) -> i64 {
    oldest_valid + valid_count as i64 * period_ms
}

/// 协作式限速器：两次调用之间至少间隔 60s / max_calls_per_minute
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn per_minute(max_calls: u32) -> Self {
        Self {
            min_interval: Duration::from_secs(60) / max_calls.max(1),
            last_call: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 等待到允许下一次调用
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(target: "live", decision = "rate_limited", wait_ms = wait.as_millis() as u64, "等待限速窗口");
                tokio::time::sleep(wait).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

/// 一次REST补齐的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveFetchSummary {
    pub calls: usize,
    pub processed: usize,
    pub expected: usize,
}

/// REST分页补齐器：覆盖归档之后的尾部数据
pub struct LiveFetcher {
    source: Arc<dyn KlinePageSource>,
    db: Arc<Database>,
    page_limit: usize,
    limiter: Mutex<RateLimiter>,
}

impl LiveFetcher {
    pub fn new(source: Arc<dyn KlinePageSource>, db: Arc<Database>, max_calls_per_minute: u32) -> Self {
        Self {
            source,
            db,
            page_limit: DEFAULT_PAGE_LIMIT,
            limiter: Mutex::new(RateLimiter::per_minute(max_calls_per_minute)),
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    /// 拉取 [start, end] 区间（两端包含）的基础周期K线并逐页写库
    #[instrument(skip(self), err)]
    pub async fn fetch_range(&self, symbol: &str, start: i64, end: i64) -> Result<LiveFetchSummary> {
        let resolution = Resolution::BASE;
        let period = resolution.period_ms();
        let expected = expected_candle_count(start, end, period);
        let mut summary = LiveFetchSummary { expected, ..Default::default() };
        let mut cursor = start;

        info!(target: "live", log_type = "module", "{}: REST补齐 {} ~ {}，预计 {} 根K线", symbol, format_ts(start), format_ts(end), expected);

        while cursor <= end {
            self.limiter.lock().await.acquire().await;

            let request = PageRequest {
                symbol: symbol.to_string(),
                resolution,
                start: cursor,
                limit: self.page_limit,
            };
            let page = self.source.fetch_page(&request).await?;
            summary.calls += 1;

            if page.is_empty() {
                debug!(target: "live", decision = "empty_page", cursor, "没有更多数据");
                break;
            }

            let mut candles: Vec<Candle> = Vec::with_capacity(page.len());
            for raw in &page {
                let ts = raw.open_time()?;
                if ts < start || ts > end {
                    continue;
                }
                candles.push(raw.to_candle()?);
            }
            if candles.is_empty() {
                debug!(target: "live", decision = "no_valid_rows", cursor, page_rows = page.len(), "本页没有区间内的K线");
                break;
            }

            candles.sort_by_key(|c| c.open_time);
            let oldest = candles[0].open_time;
            let valid_count = candles.len();
            let db = self.db.clone();
            let owned_symbol = symbol.to_string();
            run_blocking(move || db.upsert_many(&owned_symbol, resolution, &candles)).await?;
            summary.processed += valid_count;

            if summary.processed >= expected {
                debug!(target: "live", decision = "expected_reached", processed = summary.processed, expected, "已达到预计数量");
                break;
            }

            let next = next_cursor(oldest, valid_count, period);
            if next <= cursor {
                debug!(target: "live", decision = "cursor_stalled", cursor, next, "游标没有前进，停止");
                break;
            }
            cursor = next;
        }

        info!(target: "live", log_type = "module", "{}: REST补齐完成，调用 {} 次，写入 {} 根K线", symbol, summary.calls, summary.processed);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_count_includes_both_ends() {
        let p = 300_000;
        assert_eq!(expected_candle_count(0, 10 * p, p), 11);
        assert_eq!(expected_candle_count(0, 10 * p + 1, p), 11);
        assert_eq!(expected_candle_count(5, 5, p), 1);
        assert_eq!(expected_candle_count(10, 5, p), 0);
    }

    #[test]
    fn cursor_moves_past_received_rows() {
        let t0 = 1_704_067_200_000;
        assert_eq!(next_cursor(t0, 1000, 300_000), t0 + 1000 * 300_000);
        assert_eq!(next_cursor(t0, 1, 300_000), t0 + 300_000);
    }

    #[test]
    fn limiter_interval_from_calls_per_minute() {
        assert_eq!(RateLimiter::per_minute(10).min_interval(), Duration::from_secs(6));
        assert_eq!(RateLimiter::per_minute(0).min_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn first_acquire_does_not_wait() {
        let mut limiter = RateLimiter::per_minute(1);
        let begin = Instant::now();
        limiter.acquire().await;
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
