use crate::klcommon::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 一分钟的毫秒数
pub const MINUTE_MS: i64 = 60 * 1000;
/// 一天的毫秒数
pub const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// K线 - 存储与内存共用的表示形式
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// K线开盘时间 (UTC毫秒时间戳)，同一交易对+周期内唯一
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { open_time, open, high, low, close, volume }
    }

    /// 典型价格 (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// 校验OHLCV取值：全部有限、非负，且 low ≤ {open, close} ≤ high
    pub fn validate(&self) -> Result<()> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AppError::ValidationError(format!(
                "K线 {} 含有非法数值: {:?}",
                format_ts(self.open_time),
                self
            )));
        }
        if self.low > self.open.min(self.close) || self.high < self.open.max(self.close) {
            return Err(AppError::ValidationError(format!(
                "K线 {} 价格区间不一致: open={} high={} low={} close={}",
                format_ts(self.open_time),
                self.open,
                self.high,
                self.low,
                self.close
            )));
        }
        Ok(())
    }
}

/// K线周期
///
/// 5m 是从交易所直接获取的基础周期，其余周期都由基础周期聚合得到
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Resolution {
    pub const BASE: Resolution = Resolution::M5;

    pub const ALL: [Resolution; 7] = [
        Resolution::M5,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
        Resolution::H4,
        Resolution::H12,
        Resolution::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
            Resolution::H4 => "4h",
            Resolution::H12 => "12h",
            Resolution::D1 => "1d",
        }
    }

    pub fn period_ms(&self) -> i64 {
        match self {
            Resolution::M5 => 5 * MINUTE_MS,
            Resolution::M15 => 15 * MINUTE_MS,
            Resolution::M30 => 30 * MINUTE_MS,
            Resolution::H1 => 60 * MINUTE_MS,
            Resolution::H4 => 4 * 60 * MINUTE_MS,
            Resolution::H12 => 12 * 60 * MINUTE_MS,
            Resolution::D1 => DAY_MS,
        }
    }

    /// Bybit 的 interval 参数（REST 与 WebSocket 相同）
    pub fn bybit_interval(&self) -> &'static str {
        match self {
            Resolution::M5 => "5",
            Resolution::M15 => "15",
            Resolution::M30 => "30",
            Resolution::H1 => "60",
            Resolution::H4 => "240",
            Resolution::H12 => "720",
            Resolution::D1 => "D",
        }
    }

    pub fn is_base(&self) -> bool {
        *self == Self::BASE
    }

    /// 所有需要由基础周期聚合得到的周期
    pub fn derived() -> impl Iterator<Item = Resolution> {
        Self::ALL.into_iter().filter(|r| !r.is_base())
    }

    pub fn is_aligned(&self, timestamp_ms: i64) -> bool {
        timestamp_ms.rem_euclid(self.period_ms()) == 0
    }

    /// 向下对齐到周期起点
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.period_ms())
    }

    /// 向上对齐到周期起点
    pub fn align_up(&self, timestamp_ms: i64) -> i64 {
        let floor = self.align(timestamp_ms);
        if floor == timestamp_ms {
            floor
        } else {
            floor + self.period_ms()
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| AppError::ValidationError(format!("未知的K线周期: {}", s)))
    }
}

/// 补齐任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }
}

/// 补齐进度，每个批次边界更新一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillProgress {
    /// 批次总数
    pub total: usize,
    /// 当前批次序号（从1开始）
    pub current: usize,
    /// 当前批次窗口起点
    pub start_time: i64,
    /// 当前批次窗口终点
    pub end_time: i64,
    pub status: BackfillStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackfillProgress {
    pub fn pending(start_time: i64, end_time: i64) -> Self {
        Self {
            total: 0,
            current: 0,
            start_time,
            end_time,
            status: BackfillStatus::Pending,
            error: None,
        }
    }
}

/// 数据缺口：基础周期日历上缺失K线的半开区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: i64,
    pub end: i64,
}

/// VWAP 曲线上的一个点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VwapPoint {
    pub time: i64,
    pub value: f64,
}

/// REST 接口返回的原始K线: [startTime, open, high, low, close, volume, turnover]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawKline(pub Vec<String>);

impl RawKline {
    pub fn open_time(&self) -> Result<i64> {
        let field = self
            .0
            .first()
            .ok_or_else(|| AppError::ParseError("REST K线缺少时间字段".to_string()))?;
        field
            .parse::<i64>()
            .map_err(|e| AppError::ParseError(format!("REST K线时间字段 {:?} 无法解析: {}", field, e)))
    }

    pub fn to_candle(&self) -> Result<Candle> {
        if self.0.len() < 6 {
            return Err(AppError::ParseError(format!(
                "REST K线字段数量不足: {:?}",
                self.0
            )));
        }
        let number = |idx: usize| -> Result<f64> {
            self.0[idx].parse::<f64>().map_err(|e| {
                AppError::ParseError(format!("REST K线第{}个字段 {:?} 无法解析: {}", idx, self.0[idx], e))
            })
        };
        Ok(Candle {
            open_time: self.open_time()?,
            open: number(1)?,
            high: number(2)?,
            low: number(3)?,
            close: number(4)?,
            volume: number(5)?,
        })
    }
}

/// 月度归档文件的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey {
    pub symbol: String,
    pub resolution: Resolution,
    pub year: i32,
    pub month: u32,
}

impl ArchiveKey {
    /// 该月最后一天（日期号）
    pub fn last_day(&self) -> u32 {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .and_then(|d| d.pred_opt())
            .map(|d| chrono::Datelike::day(&d))
            .unwrap_or(28)
    }

    /// 归档文件名，例如 BTCUSDT_5_2024-01-01_2024-01-31.csv.gz
    pub fn file_name(&self) -> String {
        let interval = self.resolution.bybit_interval();
        format!(
            "{sym}_{interval}_{y}-{m:02}-01_{y}-{m:02}-{d:02}.csv.gz",
            sym = self.symbol,
            y = self.year,
            m = self.month,
            d = self.last_day()
        )
    }

    /// 相对于归档根地址的路径
    pub fn relative_path(&self) -> String {
        format!("kline_for_metatrader4/{}/{}/{}", self.symbol, self.year, self.file_name())
    }
}

/// 校验交易对名称：只允许ASCII字母和数字（会被用作表名的一部分）
pub fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::ValidationError(format!("非法的交易对名称: {:?}", symbol)));
    }
    Ok(())
}

/// 毫秒时间戳转换为 DateTime<Utc>
pub fn to_datetime(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(timestamp_ms).single()
}

/// 毫秒时间戳格式化为 RFC 3339，用于日志
pub fn format_ts(timestamp_ms: i64) -> String {
    to_datetime(timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_round_trips_through_strings() {
        for r in Resolution::ALL {
            assert_eq!(r.as_str().parse::<Resolution>().unwrap(), r);
        }
        assert!("2m".parse::<Resolution>().is_err());
        assert_eq!(Resolution::derived().count(), 6);
    }

    #[test]
    fn alignment_helpers() {
        let r = Resolution::M5;
        assert!(r.is_aligned(1_704_067_200_000));
        assert!(!r.is_aligned(1_704_067_200_000 + 1_000));
        assert_eq!(r.align(1_704_067_200_000 + 61_000), 1_704_067_200_000);
        assert_eq!(r.align_up(1_704_067_200_000 + 61_000), 1_704_067_200_000 + 300_000);
        assert_eq!(r.align_up(1_704_067_200_000), 1_704_067_200_000);
    }

    #[test]
    fn candle_validation() {
        assert!(Candle::new(0, 10.0, 12.0, 9.0, 11.0, 5.0).validate().is_ok());
        assert!(Candle::new(0, 10.0, 10.5, 9.0, 11.0, 5.0).validate().is_err());
        assert!(Candle::new(0, 10.0, 12.0, 9.0, 11.0, -1.0).validate().is_err());
        assert!(Candle::new(0, f64::NAN, 12.0, 9.0, 11.0, 1.0).validate().is_err());
    }

    #[test]
    fn raw_kline_conversion() {
        let raw = RawKline(
            ["1704067200000", "42000.5", "42100", "41900", "42050", "12.5", "525000"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let candle = raw.to_candle().unwrap();
        assert_eq!(candle.open_time, 1_704_067_200_000);
        assert_eq!(candle.high, 42100.0);
        assert_eq!(candle.volume, 12.5);

        let broken = RawKline(vec!["1704067200000".into(), "x".into()]);
        assert!(matches!(broken.to_candle(), Err(AppError::ParseError(_))));
    }

    #[test]
    fn archive_key_layout() {
        let key = ArchiveKey {
            symbol: "BTCUSDT".to_string(),
            resolution: Resolution::M5,
            year: 2024,
            month: 2,
        };
        assert_eq!(key.last_day(), 29);
        assert_eq!(
            key.relative_path(),
            "kline_for_metatrader4/BTCUSDT/2024/BTCUSDT_5_2024-02-01_2024-02-29.csv.gz"
        );
    }

    #[test]
    fn symbol_validation() {
        assert!(validate_symbol("BTCUSDT").is_ok());
        assert!(validate_symbol("").is_err());
        assert!(validate_symbol("BTC; DROP TABLE").is_err());
    }
}
