use crate::klcommon::api::ArchiveSource;
use crate::klcommon::context::run_blocking;
use crate::klcommon::db::Database;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{format_ts, to_datetime, ArchiveKey, Candle, Resolution};
use chrono::{Datelike, NaiveDateTime, TimeZone, Utc};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// 归档解析后每次写库的默认行数
pub const DEFAULT_ARCHIVE_BATCH_ROWS: usize = 500;

/// 归档行的时间格式，例如 2024.01.01 00:05
const ARCHIVE_TIME_FORMAT: &str = "%Y.%m.%d %H:%M";

/// 日历月
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonthRange {
    pub year: i32,
    pub month: u32,
}

/// 列出 [start, end) 覆盖的所有日历月（UTC）
pub fn month_ranges(start: i64, end: i64) -> Result<Vec<MonthRange>> {
    if start >= end {
        return Ok(Vec::new());
    }
    let first = to_datetime(start)
        .ok_or_else(|| AppError::ValidationError(format!("无效的起始时间: {}", start)))?;
    let last = to_datetime(end - 1)
        .ok_or_else(|| AppError::ValidationError(format!("无效的结束时间: {}", end)))?;

    let last_month = MonthRange { year: last.year(), month: last.month() };
    let mut current = MonthRange { year: first.year(), month: first.month() };
    let mut months = Vec::new();
    while current <= last_month {
        months.push(current);
        current = if current.month == 12 {
            MonthRange { year: current.year + 1, month: 1 }
        } else {
            MonthRange { year: current.year, month: current.month + 1 }
        };
    }
    Ok(months)
}

/// 解析一行归档数据：`YYYY.MM.DD HH:MM,open,high,low,close,volume`
pub fn parse_archive_row(record: &csv::StringRecord) -> std::result::Result<Candle, String> {
    if record.len() < 6 {
        return Err(format!("字段数量不足: 期望6个，实际{}个", record.len()));
    }
    let time_field = record[0].trim();
    let naive = NaiveDateTime::parse_from_str(time_field, ARCHIVE_TIME_FORMAT)
        .map_err(|e| format!("时间字段 {:?} 无法解析: {}", time_field, e))?;
    let open_time = Utc.from_utc_datetime(&naive).timestamp_millis();

    let number = |idx: usize| -> std::result::Result<f64, String> {
        let field = record[idx].trim();
        field
            .parse::<f64>()
            .map_err(|e| format!("第{}列 {:?} 无法解析: {}", idx + 1, field, e))
    };

    let candle = Candle {
        open_time,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
    };
    candle.validate().map_err(|e| e.to_string())?;
    Ok(candle)
}

/// 一次补齐运行内的归档缓存
///
/// 每个月的归档只下载、解压一次，后续批次直接读取已解压的CSV。
/// 批次按时间顺序推进，早于当前批次的月份会被清理；缓存被丢弃时临时目录随之删除。
pub struct ArchiveCache {
    dir: tempfile::TempDir,
    months: BTreeMap<MonthRange, Option<PathBuf>>,
    downloads: usize,
}

impl ArchiveCache {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// 当前保留的已解压月份数
    pub fn cached_months(&self) -> usize {
        self.months.values().filter(|m| m.is_some()).count()
    }

    /// 本次运行实际发起的下载次数
    pub fn downloads(&self) -> usize {
        self.downloads
    }

    /// 删除早于 first 的月份
    fn evict_before(&mut self, first: MonthRange) -> Result<()> {
        let kept = self.months.split_off(&first);
        for path in std::mem::replace(&mut self.months, kept).into_values().flatten() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            debug!(target: "backfill", decision = "archive_evicted", file = %path.display(), "清理已用完的归档");
        }
        Ok(())
    }
}

/// 月度归档下载器：下载、解压、逐行解析并分批写入基础周期表
pub struct ArchiveFetcher {
    source: Arc<dyn ArchiveSource>,
    db: Arc<Database>,
    batch_rows: usize,
    temp_root: Option<PathBuf>,
}

impl ArchiveFetcher {
    pub fn new(source: Arc<dyn ArchiveSource>, db: Arc<Database>) -> Self {
        Self {
            source,
            db,
            batch_rows: DEFAULT_ARCHIVE_BATCH_ROWS,
            temp_root: None,
        }
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    /// 临时目录创建在指定目录下（默认系统临时目录）
    pub fn with_temp_root<P: Into<PathBuf>>(mut self, temp_root: P) -> Self {
        self.temp_root = Some(temp_root.into());
        self
    }

    /// 为一次补齐运行创建归档缓存
    pub fn open_cache(&self) -> Result<ArchiveCache> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kline_archive_");
        let dir = match &self.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(ArchiveCache {
            dir,
            months: BTreeMap::new(),
            downloads: 0,
        })
    }

    /// 加载 [start, end) 窗口覆盖的所有月度归档
    ///
    /// 返回窗口内最后一根归档K线的时间；没有任何归档数据时返回 None
    #[instrument(skip(self, cache), err)]
    pub async fn fetch_window(&self, cache: &mut ArchiveCache, symbol: &str, start: i64, end: i64) -> Result<Option<i64>> {
        let months = month_ranges(start, end)?;
        if let Some(first) = months.first() {
            cache.evict_before(*first)?;
        }

        let mut latest: Option<i64> = None;
        for month in months {
            let key = ArchiveKey {
                symbol: symbol.to_string(),
                resolution: Resolution::BASE,
                year: month.year,
                month: month.month,
            };
            let Some(csv_path) = self.extracted_month(cache, month, &key).await? else {
                continue;
            };

            let db = self.db.clone();
            let batch_rows = self.batch_rows;
            let load_key = key.clone();
            let loaded = run_blocking(move || load_csv(&db, &load_key, &csv_path, start, end, batch_rows)).await?;

            match loaded {
                Some(ts) => {
                    info!(target: "backfill", log_type = "module", "{} {}-{:02} 归档加载完成，最后一根K线 {}", key.symbol, key.year, key.month, format_ts(ts));
                    latest = Some(latest.map_or(ts, |l| l.max(ts)));
                }
                None => debug!(target: "backfill", decision = "archive_outside_window", file = %key.file_name(), "归档内没有窗口内的K线"),
            }
        }

        Ok(latest)
    }

    /// 返回该月已解压的CSV路径，第一次用到时下载并解压；交易所没有该月归档时返回 None
    async fn extracted_month(&self, cache: &mut ArchiveCache, month: MonthRange, key: &ArchiveKey) -> Result<Option<PathBuf>> {
        if let Some(cached) = cache.months.get(&month) {
            debug!(target: "backfill", decision = "archive_cache_hit", year = month.year, month = month.month, "复用已解压的归档");
            return Ok(cached.clone());
        }

        let file_name = key.file_name();
        let gz_path = cache.path().join(&file_name);
        let csv_path = cache.path().join(file_name.trim_end_matches(".gz"));

        cache.downloads += 1;
        if !self.source.download_archive(key, &gz_path).await? {
            info!(target: "backfill", log_type = "module", "{} {}-{:02} 没有月度归档，跳过", key.symbol, key.year, key.month);
            cache.months.insert(month, None);
            return Ok(None);
        }

        let (gz, csv) = (gz_path.clone(), csv_path.clone());
        run_blocking(move || {
            let result = decompress(&gz, &csv);
            std::fs::remove_file(&gz)?;
            result
        })
        .await?;

        cache.months.insert(month, Some(csv_path.clone()));
        Ok(Some(csv_path))
    }
}

/// 逐行解析已解压的归档，只保留 [start, end) 内的K线并分批写库
fn load_csv(db: &Database, key: &ArchiveKey, csv_path: &Path, start: i64, end: i64, batch_rows: usize) -> Result<Option<i64>> {
    let file_name = csv_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(csv_path)?;

    let mut batch: Vec<Candle> = Vec::with_capacity(batch_rows);
    let mut latest: Option<i64> = None;
    let mut loaded = 0usize;

    for (idx, record) in reader.records().enumerate() {
        let line = idx + 1;
        let record = record.map_err(|e| AppError::ParseError(format!("{} 第{}行读取失败: {}", file_name, line, e)))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let candle = parse_archive_row(&record)
            .map_err(|reason| AppError::ParseError(format!("{} 第{}行格式错误: {}", file_name, line, reason)))?;

        if candle.open_time < start || candle.open_time >= end {
            continue;
        }
        latest = Some(latest.map_or(candle.open_time, |l| l.max(candle.open_time)));
        batch.push(candle);

        if batch.len() >= batch_rows {
            loaded += db.upsert_many(&key.symbol, key.resolution, &batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        loaded += db.upsert_many(&key.symbol, key.resolution, &batch)?;
    }

    debug!(target: "backfill", decision = "archive_rows_loaded", file = %file_name, loaded, "归档写库完成");
    Ok(latest)
}

/// 解压 .csv.gz 到同目录下的 .csv
fn decompress(gz_path: &Path, csv_path: &Path) -> Result<()> {
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(gz_path)?));
    let mut writer = BufWriter::new(File::create(csv_path)?);
    std::io::copy(&mut decoder, &mut writer)
        .map_err(|e| AppError::ParseError(format!("解压 {} 失败: {}", gz_path.display(), e)))?;
    writer.flush()?;
    Ok(())
}
