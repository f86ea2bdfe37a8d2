use crate::klcommon::api::{ArchiveSource, KlinePageSource};
use crate::klcommon::config::ServiceConfig;
use crate::klcommon::context::run_blocking;
use crate::klcommon::db::Database;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{
    format_ts, validate_symbol, BackfillProgress, BackfillStatus, Candle, Gap, Resolution, DAY_MS,
};
use crate::kldata::archive::ArchiveFetcher;
use crate::kldata::live::LiveFetcher;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// 默认每批次天数
pub const DEFAULT_BATCH_DAYS: u32 = 7;

/// 补齐请求，时间为半开区间 [start, end)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub symbol: String,
    pub start: i64,
    pub end: i64,
    pub batch_days: Option<u32>,
}

/// 批次总数 ceil(ceil(天数) / batch_days)
pub fn batch_count(start: i64, end: i64, batch_days: u32) -> usize {
    if end <= start || batch_days == 0 {
        return 0;
    }
    let days = (end - start + DAY_MS - 1) / DAY_MS;
    let batch_days = batch_days as i64;
    ((days + batch_days - 1) / batch_days) as usize
}

/// 按 batch_days 切分 [start, end)，最后一个批次截断到 end
pub fn batch_windows(start: i64, end: i64, batch_days: u32) -> Vec<(i64, i64)> {
    let span = batch_days as i64 * DAY_MS;
    (0..batch_count(start, end, batch_days))
        .map(|i| {
            let window_start = start + i as i64 * span;
            (window_start, (window_start + span).min(end))
        })
        .collect()
}

/// 历史K线补齐编排：先按批次加载月度归档，再用REST补齐归档之后的尾部，最后刷新派生周期
pub struct BackfillOrchestrator {
    db: Arc<Database>,
    archive: ArchiveFetcher,
    live: LiveFetcher,
    default_batch_days: u32,
    progress_tx: watch::Sender<BackfillProgress>,
}

impl BackfillOrchestrator {
    pub fn new(db: Arc<Database>, archive: ArchiveFetcher, live: LiveFetcher) -> Self {
        let (progress_tx, _) = watch::channel(BackfillProgress::pending(0, 0));
        Self {
            db,
            archive,
            live,
            default_batch_days: DEFAULT_BATCH_DAYS,
            progress_tx,
        }
    }

    /// 按配置组装归档和REST两个数据源
    pub fn from_config(
        db: Arc<Database>,
        archive_source: Arc<dyn ArchiveSource>,
        page_source: Arc<dyn KlinePageSource>,
        config: &ServiceConfig,
    ) -> Self {
        let archive = ArchiveFetcher::new(archive_source, db.clone())
            .with_batch_rows(config.backfill.archive_batch_rows);
        let live = LiveFetcher::new(page_source, db.clone(), config.exchange.max_calls_per_minute)
            .with_page_limit(config.exchange.page_limit);
        Self::new(db, archive, live).with_batch_days(config.backfill.batch_days)
    }

    pub fn with_batch_days(mut self, batch_days: u32) -> Self {
        self.default_batch_days = batch_days;
        self
    }

    /// 订阅进度，每个批次边界更新一次
    pub fn subscribe_progress(&self) -> watch::Receiver<BackfillProgress> {
        self.progress_tx.subscribe()
    }

    pub fn progress(&self) -> BackfillProgress {
        self.progress_tx.borrow().clone()
    }

    fn publish(&self, progress: &BackfillProgress) {
        self.progress_tx.send_replace(progress.clone());
    }

    fn validate(request: &BackfillRequest, batch_days: u32) -> Result<()> {
        validate_symbol(&request.symbol)?;
        if request.start >= request.end {
            return Err(AppError::ValidationError(format!(
                "起始时间必须早于结束时间: {} >= {}",
                format_ts(request.start),
                format_ts(request.end)
            )));
        }
        let base = Resolution::BASE;
        if !base.is_aligned(request.start) || !base.is_aligned(request.end) {
            return Err(AppError::ValidationError(format!(
                "补齐区间必须对齐到 {} 周期: [{}, {})",
                base, request.start, request.end
            )));
        }
        if batch_days == 0 {
            return Err(AppError::ValidationError("批次天数必须大于0".to_string()));
        }
        Ok(())
    }

    /// 执行一次补齐
    ///
    /// 失败时进度状态置为 Failed，返回的错误携带失败批次的窗口
    #[instrument(skip(self), fields(symbol = %request.symbol), err)]
    pub async fn start_backfill(&self, request: BackfillRequest) -> Result<BackfillProgress> {
        let batch_days = request.batch_days.unwrap_or(self.default_batch_days);
        Self::validate(&request, batch_days)?;

        let mut progress = BackfillProgress {
            total: batch_count(request.start, request.end, batch_days),
            current: 0,
            start_time: request.start,
            end_time: request.end,
            status: BackfillStatus::Running,
            error: None,
        };
        self.publish(&progress);
        info!(
            target: "backfill",
            log_type = "module",
            "开始补齐 {}: {} ~ {}，共 {} 个批次",
            request.symbol,
            format_ts(request.start),
            format_ts(request.end),
            progress.total
        );

        match self.run(&request, batch_days, &mut progress).await {
            Ok(()) => {
                progress.status = BackfillStatus::Completed;
                self.publish(&progress);
                info!(target: "backfill", log_type = "module", "补齐完成 {}", request.symbol);
                Ok(progress)
            }
            Err(e) => {
                progress.status = BackfillStatus::Failed;
                progress.error = Some(e.to_string());
                self.publish(&progress);
                tracing::error!(
                    message = "补齐失败",
                    symbol = %request.symbol,
                    window_start = progress.start_time,
                    window_end = progress.end_time,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e
                );
                Err(AppError::BackfillError {
                    start: progress.start_time,
                    end: progress.end_time,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run(&self, request: &BackfillRequest, batch_days: u32, progress: &mut BackfillProgress) -> Result<()> {
        let symbol = request.symbol.as_str();
        let base = Resolution::BASE;
        let (range_start, range_end) = (request.start, request.end);

        // 先清空区间内已有的基础K线，再整体重新加载
        let db = self.db.clone();
        let owned_symbol = request.symbol.clone();
        run_blocking(move || db.delete_range(&owned_symbol, base, range_start, range_end)).await?;

        // 同一个月的归档在本次运行内只下载一次
        let mut cache = self.archive.open_cache()?;
        let mut latest_archive: Option<i64> = None;
        for (idx, (window_start, window_end)) in batch_windows(request.start, request.end, batch_days)
            .into_iter()
            .enumerate()
        {
            progress.current = idx + 1;
            progress.start_time = window_start;
            progress.end_time = window_end;
            self.publish(progress);
            info!(
                target: "backfill",
                log_type = "module",
                "批次 {}/{}: {} ~ {}",
                progress.current,
                progress.total,
                format_ts(window_start),
                format_ts(window_end)
            );

            if let Some(ts) = self.archive.fetch_window(&mut cache, symbol, window_start, window_end).await? {
                latest_archive = Some(latest_archive.map_or(ts, |l| l.max(ts)));
            }
        }
        debug!(target: "backfill", decision = "archive_downloads", downloads = cache.downloads(), "归档下载次数");
        drop(cache);

        // 归档没有覆盖到区间末尾时，用REST补齐剩余部分
        let period = base.period_ms();
        let needs_live = match latest_archive {
            None => true,
            Some(ts) => ts + period < request.end,
        };
        if needs_live {
            let live_start = latest_archive.unwrap_or(request.start);
            progress.start_time = live_start;
            progress.end_time = request.end;
            self.publish(progress);
            info!(target: "backfill", log_type = "module", "归档覆盖到 {:?}，REST补齐 {} ~ {}", latest_archive.map(format_ts), format_ts(live_start), format_ts(request.end));
            self.live.fetch_range(symbol, live_start, request.end - period).await?;
        }

        let db = self.db.clone();
        let owned_symbol = request.symbol.clone();
        let gaps = run_blocking(move || {
            let derived: Vec<Resolution> = Resolution::derived().collect();
            db.refresh_aggregates(&owned_symbol, &derived, range_start, range_end)?;
            db.find_gaps(&owned_symbol, base, range_start, range_end)
        })
        .await?;
        if !gaps.is_empty() {
            let missing: i64 = gaps.iter().map(|g| (g.end - g.start) / period).sum();
            warn!(
                target: "backfill",
                log_type = "module",
                "{}: 补齐后仍有 {} 个缺口，共缺 {} 根K线，首个缺口 {} ~ {}",
                symbol,
                gaps.len(),
                missing,
                format_ts(gaps[0].start),
                format_ts(gaps[0].end)
            );
        }
        Ok(())
    }

    /// 查找基础周期在 [start, end) 内的缺口（只读）
    pub fn find_data_gaps(&self, symbol: &str, start: i64, end: i64) -> Result<Vec<Gap>> {
        if start >= end {
            return Err(AppError::ValidationError(format!("时间区间非法: {} >= {}", start, end)));
        }
        self.db.find_gaps(symbol, Resolution::BASE, start, end).map_err(|e| {
            error!(target: "backfill", "缺口扫描失败 {}: {}", symbol, e);
            e
        })
    }

    /// 读取任意周期的K线
    pub fn get_klines(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>> {
        self.db.get_klines(symbol, resolution, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_days_in_weekly_batches() {
        let start = 1_704_067_200_000;
        let end = start + 10 * DAY_MS;
        assert_eq!(batch_count(start, end, 7), 2);
        assert_eq!(
            batch_windows(start, end, 7),
            vec![(start, start + 7 * DAY_MS), (start + 7 * DAY_MS, end)]
        );
    }

    #[test]
    fn partial_days_round_up() {
        let start = 1_704_067_200_000;
        assert_eq!(batch_count(start, start + 5 * 60_000, 7), 1);
        assert_eq!(batch_count(start, start + 7 * DAY_MS + 5 * 60_000, 7), 2);
        assert_eq!(batch_count(start, start, 7), 0);
    }
}
