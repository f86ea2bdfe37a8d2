// 集成测试共用的假数据源
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use kline_vwap::klcommon::models::{to_datetime, ArchiveKey, MINUTE_MS};
use kline_vwap::klcommon::{AppError, ArchiveSource, Candle, Database, KlinePageSource, PageRequest, RawKline, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const P: i64 = 5 * MINUTE_MS;

pub fn ts(y: i32, m: u32, d: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
}

/// 每个测试使用独立的数据库文件
pub fn setup_test_db(name: &str) -> Database {
    let db_path = PathBuf::from(format!("./target/test_{}.db", name));
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if path.exists() {
            fs::remove_file(&path).unwrap();
        }
    }
    Database::new(&db_path, 2).unwrap()
}

/// 从 start 开始连续 count 根5分钟K线
pub fn candle_series(start: i64, count: usize) -> Vec<Candle> {
    (0..count as i64)
        .map(|i| {
            let price = 100.0 + (i % 50) as f64;
            Candle::new(start + i * P, price, price + 2.0, price - 1.0, price + 1.0, 1.0 + (i % 7) as f64)
        })
        .collect()
}

fn month_of(open_time: i64) -> (i32, u32) {
    let dt = to_datetime(open_time).unwrap();
    (dt.year(), dt.month())
}

/// 把K线写成 .csv.gz 归档，trailer 追加在末尾
fn write_archive(dest: &Path, candles: &[Candle], trailer: Option<&str>) -> Result<()> {
    let file = fs::File::create(dest)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    for c in candles {
        let time = to_datetime(c.open_time).unwrap().format("%Y.%m.%d %H:%M");
        writeln!(encoder, "{},{},{},{},{},{}", time, c.open, c.high, c.low, c.close, c.volume)?;
    }
    if let Some(line) = trailer {
        writeln!(encoder, "{}", line)?;
    }
    encoder.finish()?;
    Ok(())
}

/// 内存中的月度归档
#[derive(Default)]
pub struct FakeArchiveSource {
    months: HashMap<(i32, u32), Vec<Candle>>,
    corrupt: HashSet<(i32, u32)>,
    pub requests: Mutex<Vec<ArchiveKey>>,
}

impl FakeArchiveSource {
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut months: HashMap<(i32, u32), Vec<Candle>> = HashMap::new();
        for c in candles {
            months.entry(month_of(c.open_time)).or_default().push(*c);
        }
        Self { months, ..Default::default() }
    }

    /// 该月归档含有一行格式错误的数据
    pub fn with_corrupt_month(mut self, year: i32, month: u32) -> Self {
        self.corrupt.insert((year, month));
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ArchiveSource for FakeArchiveSource {
    async fn download_archive(&self, key: &ArchiveKey, dest: &Path) -> Result<bool> {
        self.requests.lock().unwrap().push(key.clone());
        let month = (key.year, key.month);
        if self.corrupt.contains(&month) {
            let mut candles = self.months.get(&month).cloned().unwrap_or_default();
            candles.truncate(3);
            write_archive(dest, &candles, Some("not-a-date,1,2,3"))?;
            return Ok(true);
        }
        match self.months.get(&month) {
            Some(candles) => {
                write_archive(dest, candles, None)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// 内存中的REST分页源，按交易所习惯返回最新在前的分页
#[derive(Default)]
pub struct FakePageSource {
    candles: Vec<Candle>,
    fail_on_call: Option<usize>,
    pub requests: Mutex<Vec<PageRequest>>,
}

impl FakePageSource {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.open_time);
        Self { candles, ..Default::default() }
    }

    /// 第 n 次调用（从1开始）返回传输错误
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn request_starts(&self) -> Vec<i64> {
        self.requests.lock().unwrap().iter().map(|r| r.start).collect()
    }
}

#[async_trait]
impl KlinePageSource for FakePageSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawKline>> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if self.fail_on_call == Some(call) {
            return Err(AppError::ApiError("模拟的限流错误".to_string()));
        }

        let mut rows: Vec<RawKline> = self
            .candles
            .iter()
            .filter(|c| c.open_time >= request.start)
            .take(request.limit)
            .map(|c| {
                RawKline(vec![
                    c.open_time.to_string(),
                    c.open.to_string(),
                    c.high.to_string(),
                    c.low.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                    (c.close * c.volume).to_string(),
                ])
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }
}
