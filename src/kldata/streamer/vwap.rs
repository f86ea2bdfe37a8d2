use crate::klcommon::models::{format_ts, to_datetime, Candle, VwapPoint};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::warn;

/// 一个UTC自然日的VWAP累计状态
#[derive(Debug, Clone, Default)]
pub struct Session {
    cumulative_tpv: f64,
    cumulative_volume: f64,
    candles: Vec<Candle>,
    points: Vec<VwapPoint>,
}

impl Session {
    pub fn cumulative_tpv(&self) -> f64 {
        self.cumulative_tpv
    }

    pub fn cumulative_volume(&self) -> f64 {
        self.cumulative_volume
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn points(&self) -> &[VwapPoint] {
        &self.points
    }

    fn accumulate(&mut self, candle: &Candle) -> VwapPoint {
        let typical = candle.typical_price();
        self.cumulative_tpv += typical * candle.volume;
        self.cumulative_volume += candle.volume;
        let value = if self.cumulative_volume > 0.0 {
            self.cumulative_tpv / self.cumulative_volume
        } else {
            typical
        };
        VwapPoint { time: candle.open_time, value }
    }

    /// 从第 from 根K线开始重新累计
    fn recompute_from(&mut self, from: usize) {
        self.points.truncate(from);
        let prefix = &self.candles[..from];
        self.cumulative_tpv = prefix.iter().map(|c| c.typical_price() * c.volume).sum();
        self.cumulative_volume = prefix.iter().map(|c| c.volume).sum();
        for idx in from..self.candles.len() {
            let candle = self.candles[idx];
            let point = self.accumulate(&candle);
            self.points.push(point);
        }
    }

    /// 插入或替换一根K线，返回第一个发生变化的点的下标
    fn upsert(&mut self, candle: Candle) -> usize {
        match self.candles.last() {
            None => {
                self.candles.push(candle);
                let point = self.accumulate(&candle);
                self.points.push(point);
                0
            }
            Some(last) if candle.open_time > last.open_time => {
                self.candles.push(candle);
                let point = self.accumulate(&candle);
                self.points.push(point);
                self.points.len() - 1
            }
            Some(_) => {
                let idx = match self.candles.binary_search_by_key(&candle.open_time, |c| c.open_time) {
                    Ok(idx) => {
                        self.candles[idx] = candle;
                        idx
                    }
                    Err(idx) => {
                        self.candles.insert(idx, candle);
                        idx
                    }
                };
                self.recompute_from(idx);
                idx
            }
        }
    }
}

/// 按UTC日分段的累计VWAP
#[derive(Debug, Clone, Default)]
pub struct VwapCalculator {
    sessions: BTreeMap<NaiveDate, Session>,
}

/// K线所属的交易时段（UTC日期）
pub fn session_key(open_time: i64) -> Option<NaiveDate> {
    to_datetime(open_time).map(|dt| dt.date_naive())
}

impl VwapCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 批量加载历史K线（用于启动时的种子数据）
    pub fn add_candles(&mut self, candles: &[Candle]) {
        let mut sorted = candles.to_vec();
        sorted.sort_by_key(|c| c.open_time);
        for candle in sorted {
            match session_key(candle.open_time) {
                Some(key) => {
                    self.sessions.entry(key).or_default().upsert(candle);
                }
                None => warn!(target: "vwap", "忽略时间戳非法的K线: {}", candle.open_time),
            }
        }
    }

    /// 处理一根实时K线，返回发生变化的VWAP点（所在时段的尾部）
    ///
    /// 已经有更新时段开始之后，旧时段的K线不再修订
    pub fn add_candle(&mut self, candle: Candle) -> Vec<VwapPoint> {
        let Some(key) = session_key(candle.open_time) else {
            warn!(target: "vwap", "忽略时间戳非法的K线: {}", candle.open_time);
            return Vec::new();
        };
        if let Some(newest) = self.sessions.keys().next_back() {
            if key < *newest {
                warn!(target: "vwap", "忽略已结束时段的K线: {} (最新时段 {})", format_ts(candle.open_time), newest);
                return Vec::new();
            }
        }

        let session = self.sessions.entry(key).or_default();
        let from = session.upsert(candle);
        session.points[from..].to_vec()
    }

    /// 所有时段的VWAP点，按时间升序
    pub fn series(&self) -> Vec<VwapPoint> {
        self.sessions.values().flat_map(|s| s.points.iter().copied()).collect()
    }

    pub fn latest(&self) -> Option<VwapPoint> {
        self.sessions.values().next_back().and_then(|s| s.points.last().copied())
    }

    pub fn session(&self, date: NaiveDate) -> Option<&Session> {
        self.sessions.get(&date)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }
}
