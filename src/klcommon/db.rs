use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{validate_symbol, Candle, Gap, Resolution, DAY_MS};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, ToSql};
use std::path::Path;
use tracing::{debug, error, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 单条 UPSERT 语句携带的最大行数（每行6个参数，远低于SQLite的参数上限）
pub const UPSERT_CHUNK_ROWS: usize = 200;

/// 根据交易对和周期生成表名，例如 k_btcusdt_5m
pub fn table_name(symbol: &str, resolution: Resolution) -> Result<String> {
    validate_symbol(symbol)?;
    Ok(format!("k_{}_{}", symbol.to_lowercase(), resolution.as_str()))
}

/// 聚合刷新窗口：对齐到整周期；日线额外向两侧各扩展一天，
/// 否则跨越午夜的日线会因为缺少相邻的基础K线而被截断
pub fn refresh_window(resolution: Resolution, start: i64, end: i64) -> (i64, i64) {
    let (start, end) = if resolution == Resolution::D1 {
        (start - DAY_MS, end + DAY_MS)
    } else {
        (start, end)
    };
    (resolution.align(start), resolution.align_up(end))
}

/// 把升序排列的缺失时间点合并成连续的半开区间
pub fn merge_missing_slots(slots: &[i64], period_ms: i64) -> Vec<Gap> {
    let mut gaps: Vec<Gap> = Vec::new();
    for &slot in slots {
        match gaps.last_mut() {
            Some(last) if last.end == slot => last.end = slot + period_ms,
            _ => gaps.push(Gap { start: slot, end: slot + period_ms }),
        }
    }
    gaps
}

/// K线时序存储
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// 创建数据库连接池（WAL模式）
    #[instrument(skip(db_path), fields(db_path = %db_path.as_ref().display()), err)]
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", log_type = "module", "使用SQLite数据库: {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("
                PRAGMA journal_mode = WAL;          -- WAL模式，读写互不阻塞
                PRAGMA synchronous = NORMAL;        -- 平衡性能和安全性
                PRAGMA cache_size = -102400;        -- 100MB缓存 (负数表示KB)
                PRAGMA temp_store = MEMORY;         -- 临时表存储在内存中
                PRAGMA busy_timeout = 5000;         -- 5秒忙等待超时
            ")
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
                error!(
                    target: "db",
                    message = "创建连接池失败",
                    db_path = %db_path.display(),
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error
                );
                pool_error
            })?;

        Ok(Self { pool })
    }

    fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    /// 检查数据库连接是否可用
    pub fn check_connection(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        debug!(target: "db", decision = "connection_ok", "数据库连接正常");
        Ok(())
    }

    fn ensure_table(conn: &rusqlite::Connection, table_name: &str) -> Result<()> {
        let create_table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                open_time INTEGER PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL
            )",
            table_name
        );
        conn.execute(&create_table_sql, [])
            .map_err(|e| AppError::DatabaseError(format!("创建表 {} 失败: {}", table_name, e)))?;
        Ok(())
    }

    fn table_exists(conn: &rusqlite::Connection, table_name: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
            params![table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 批量写入K线（按开盘时间 UPSERT，后写覆盖先写）
    ///
    /// 整个调用在一个事务内完成，要么全部落库要么全部回滚；
    /// 语句按 UPSERT_CHUNK_ROWS 分片。时间未对齐周期的K线直接拒绝，不做截断。
    #[instrument(skip(self, candles), fields(symbol = %symbol, resolution = %resolution, kline_count = candles.len()), err)]
    pub fn upsert_many(&self, symbol: &str, resolution: Resolution, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Err(AppError::ValidationError("写入的K线列表不能为空".to_string()));
        }
        let table = table_name(symbol, resolution)?;

        for candle in candles {
            if !resolution.is_aligned(candle.open_time) {
                return Err(AppError::ValidationError(format!(
                    "{}/{}: K线时间 {} 未对齐到周期边界",
                    symbol, resolution, candle.open_time
                )));
            }
            candle.validate()?;
        }

        let mut conn = self.get_connection()?;
        Self::ensure_table(&conn, &table)?;

        let tx = conn.transaction()?;
        let mut written = 0;
        for chunk in candles.chunks(UPSERT_CHUNK_ROWS) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO {table} (open_time, open, high, low, close, volume)
                 VALUES {placeholders}
                 ON CONFLICT(open_time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume"
            );

            let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 6);
            for candle in chunk {
                values.push(&candle.open_time);
                values.push(&candle.open);
                values.push(&candle.high);
                values.push(&candle.low);
                values.push(&candle.close);
                values.push(&candle.volume);
            }

            written += tx.execute(&sql, values.as_slice()).map_err(|e| {
                let write_error = AppError::DatabaseError(format!("写入表 {} 失败: {}", table, e));
                error!(
                    target: "db",
                    message = "批量写入K线失败",
                    table_name = %table,
                    error.summary = write_error.get_error_type_summary(),
                    error.details = %write_error
                );
                write_error
            })?;
        }
        tx.commit()?;

        debug!(target: "db", decision = "upsert_complete", table_name = %table, written, "K线批量写入完成");
        Ok(written)
    }

    /// 写入单根K线
    pub fn upsert_one(&self, symbol: &str, resolution: Resolution, candle: &Candle) -> Result<usize> {
        self.upsert_many(symbol, resolution, std::slice::from_ref(candle))
    }

    /// 读取 [start, end] 区间的K线（两端包含），按时间升序
    #[instrument(skip(self), err)]
    pub fn range(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>> {
        let table = table_name(symbol, resolution)?;
        if start > end {
            debug!(target: "db", decision = "empty_range", start, end, "起始时间晚于结束时间，没有K线");
            return Ok(Vec::new());
        }
        let conn = self.get_connection()?;
        if !Self::table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT open_time, open, high, low, close, volume FROM {}
             WHERE open_time BETWEEN ?1 AND ?2
             ORDER BY open_time ASC",
            table
        ))?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(Candle {
                open_time: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;

        let candles = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(candles)
    }

    /// 按周期读取K线：5m 读基础表，其余周期读聚合表
    pub fn get_klines(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>> {
        self.range(symbol, resolution, start, end)
    }

    /// 删除 [start, end) 区间的K线，返回删除行数
    #[instrument(skip(self), err)]
    pub fn delete_range(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<usize> {
        let table = table_name(symbol, resolution)?;
        let conn = self.get_connection()?;
        if !Self::table_exists(&conn, &table)? {
            return Ok(0);
        }
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE open_time >= ?1 AND open_time < ?2", table),
            params![start, end],
        )?;
        info!(target: "db", log_type = "module", "{}/{}: 清理区间内已有K线 {} 条", symbol, resolution, deleted);
        Ok(deleted)
    }

    /// 查找 [start, end) 区间内的数据缺口
    ///
    /// 用递归CTE生成完整的周期日历，再与已存储的K线做反连接
    #[instrument(skip(self), err)]
    pub fn find_gaps(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Gap>> {
        let table = table_name(symbol, resolution)?;
        let period = resolution.period_ms();
        let first_slot = resolution.align_up(start);
        if first_slot >= end {
            return Ok(Vec::new());
        }

        let conn = self.get_connection()?;
        Self::ensure_table(&conn, &table)?;

        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE calendar(ts) AS (
                SELECT ?1
                UNION ALL
                SELECT ts + ?3 FROM calendar WHERE ts + ?3 < ?2
            )
            SELECT calendar.ts FROM calendar
            LEFT JOIN {} k ON k.open_time = calendar.ts
            WHERE k.open_time IS NULL
            ORDER BY calendar.ts",
            table
        ))?;
        let missing = stmt
            .query_map(params![first_slot, end, period], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let gaps = merge_missing_slots(&missing, period);
        debug!(target: "db", decision = "gap_scan_complete", table_name = %table, missing_slots = missing.len(), gap_count = gaps.len(), "缺口扫描完成");
        Ok(gaps)
    }

    /// 由基础周期重新计算派生周期在窗口内的聚合K线
    #[instrument(skip(self, resolutions), fields(resolution_count = resolutions.len()), err)]
    pub fn refresh_aggregates(&self, symbol: &str, resolutions: &[Resolution], start: i64, end: i64) -> Result<()> {
        if let Some(base) = resolutions.iter().find(|r| r.is_base()) {
            return Err(AppError::ValidationError(format!("基础周期 {} 不需要聚合刷新", base)));
        }
        let base_table = table_name(symbol, Resolution::BASE)?;

        let mut conn = self.get_connection()?;
        Self::ensure_table(&conn, &base_table)?;

        for &resolution in resolutions {
            let agg_table = table_name(symbol, resolution)?;
            Self::ensure_table(&conn, &agg_table)?;
            let (refresh_start, refresh_end) = refresh_window(resolution, start, end);

            let tx = conn.transaction()?;
            tx.execute(
                &format!("DELETE FROM {} WHERE open_time >= ?1 AND open_time < ?2", agg_table),
                params![refresh_start, refresh_end],
            )?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO {agg} (open_time, open, high, low, close, volume)
                     SELECT b.bucket,
                            (SELECT open FROM {base} WHERE open_time = b.first_ts),
                            b.high,
                            b.low,
                            (SELECT close FROM {base} WHERE open_time = b.last_ts),
                            b.volume
                     FROM (
                        SELECT (open_time / ?3) * ?3 AS bucket,
                               MIN(open_time) AS first_ts,
                               MAX(open_time) AS last_ts,
                               MAX(high) AS high,
                               MIN(low) AS low,
                               SUM(volume) AS volume
                        FROM {base}
                        WHERE open_time >= ?1 AND open_time < ?2
                        GROUP BY bucket
                     ) AS b",
                    agg = agg_table,
                    base = base_table
                ),
                params![refresh_start, refresh_end, resolution.period_ms()],
            )?;
            tx.commit()?;

            info!(target: "db", log_type = "module", "刷新聚合表 {}: 窗口 [{}, {}) 共 {} 根K线", agg_table, refresh_start, refresh_end, inserted);
        }
        Ok(())
    }

    /// 最后一根K线的开盘时间
    pub fn latest_timestamp(&self, symbol: &str, resolution: Resolution) -> Result<Option<i64>> {
        let table = table_name(symbol, resolution)?;
        let conn = self.get_connection()?;
        if !Self::table_exists(&conn, &table)? {
            return Ok(None);
        }
        let latest: Option<i64> = conn
            .query_row(&format!("SELECT MAX(open_time) FROM {}", table), [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(latest)
    }

    /// K线数量
    pub fn count(&self, symbol: &str, resolution: Resolution) -> Result<i64> {
        let table = table_name(symbol, resolution)?;
        let conn = self.get_connection()?;
        if !Self::table_exists(&conn, &table)? {
            return Ok(0);
        }
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::models::MINUTE_MS;

    #[test]
    fn merge_groups_consecutive_slots() {
        let p = 5 * MINUTE_MS;
        let gaps = merge_missing_slots(&[0, p, 2 * p, 5 * p, 7 * p, 8 * p], p);
        assert_eq!(
            gaps,
            vec![
                Gap { start: 0, end: 3 * p },
                Gap { start: 5 * p, end: 6 * p },
                Gap { start: 7 * p, end: 9 * p },
            ]
        );
        assert!(merge_missing_slots(&[], p).is_empty());
    }

    #[test]
    fn daily_refresh_window_is_padded() {
        let day = DAY_MS;
        let start = 10 * day + 3 * 60 * MINUTE_MS;
        let end = 12 * day;
        assert_eq!(refresh_window(Resolution::D1, start, end), (9 * day, 13 * day));
        assert_eq!(
            refresh_window(Resolution::H4, start, end),
            (10 * day, 12 * day)
        );
    }

    #[test]
    fn table_names_reject_bad_symbols() {
        assert_eq!(table_name("BTCUSDT", Resolution::H1).unwrap(), "k_btcusdt_1h");
        assert!(table_name("btc-usdt", Resolution::H1).is_err());
    }
}
