// K线补齐 / 缺口检查 / VWAP实时流 命令行入口
use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use kline_vwap::klcommon::logging_setup::init_logging;
use kline_vwap::klcommon::models::format_ts;
use kline_vwap::klcommon::{BybitApi, Candle, Database, Resolution, ServiceConfig, VwapPoint};
use kline_vwap::kldata::streamer::BybitKlineFeed;
use kline_vwap::kldata::{BackfillOrchestrator, BackfillRequest, ChartDataHandler, StreamingAggregator};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bybit kline backfill, gap check and streaming session VWAP.", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill base candles for [start, end) and refresh derived resolutions.
    Backfill {
        #[arg(long)]
        symbol: String,
        /// RFC 3339, e.g. 2024-01-01T00:00:00Z
        #[arg(long, value_parser = parse_time)]
        start: i64,
        #[arg(long, value_parser = parse_time)]
        end: i64,
        #[arg(long)]
        batch_days: Option<u32>,
    },
    /// List missing base candles in [start, end).
    Gaps {
        #[arg(long)]
        symbol: String,
        #[arg(long, value_parser = parse_time)]
        start: i64,
        #[arg(long, value_parser = parse_time)]
        end: i64,
    },
    /// Print stored candles as JSON lines.
    Klines {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "5m")]
        resolution: Resolution,
        #[arg(long, value_parser = parse_time)]
        start: i64,
        #[arg(long, value_parser = parse_time)]
        end: i64,
    },
    /// Stream live candles and log session VWAP until Ctrl+C.
    Stream {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "5m")]
        resolution: Resolution,
    },
}

fn parse_time(value: &str) -> std::result::Result<i64, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("无法解析时间 {:?}: {}", value, e))
}

/// 把实时数据写进日志
struct LogChartHandler;

impl ChartDataHandler for LogChartHandler {
    fn on_history(&mut self, candles: &[Candle], vwap: &[VwapPoint]) {
        info!(target: "chart", history = candles.len(), vwap_points = vwap.len(), "历史数据已加载");
    }

    fn on_candle_update(&mut self, candle: &Candle) {
        tracing::debug!(target: "chart", open_time = candle.open_time, close = candle.close, volume = candle.volume, "K线更新");
    }

    fn on_new_candle(&mut self, candle: &Candle) {
        info!(target: "chart", "新K线 {} open={}", format_ts(candle.open_time), candle.open);
    }

    fn on_vwap_point(&mut self, point: &VwapPoint) {
        info!(target: "chart", "VWAP {} = {:.4}", format_ts(point.time), point.value);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load().context("加载配置失败")?;
    // 持有 guard，直到 main 函数结束，确保日志被完整写入
    let _log_guard = init_logging(&config.logging).context("初始化日志失败")?;

    let db = Arc::new(Database::new(&config.database.database_path, config.database.pool_size)?);
    db.check_connection()?;

    let api = Arc::new(BybitApi::new(
        config.exchange.rest_url.clone(),
        config.exchange.archive_url.clone(),
        config.exchange.request_timeout_secs,
    )?);
    let orchestrator = BackfillOrchestrator::from_config(db.clone(), api.clone(), api, &config);

    match args.command {
        Command::Backfill { symbol, start, end, batch_days } => {
            let mut progress_rx = orchestrator.subscribe_progress();
            let watcher = tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let progress = progress_rx.borrow().clone();
                    info!(target: "backfill", "进度 {}/{} {:?}", progress.current, progress.total, progress.status);
                    if progress.status.is_terminal() {
                        break;
                    }
                }
            });

            let result = orchestrator
                .start_backfill(BackfillRequest { symbol, start, end, batch_days })
                .await;
            watcher.abort();
            let progress = result?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Gaps { symbol, start, end } => {
            let gaps = orchestrator.find_data_gaps(&symbol, start, end)?;
            for gap in &gaps {
                println!("{} ~ {}", format_ts(gap.start), format_ts(gap.end));
            }
            info!(target: "backfill", "{}: 共 {} 个缺口", symbol, gaps.len());
        }
        Command::Klines { symbol, resolution, start, end } => {
            for candle in orchestrator.get_klines(&symbol, resolution, start, end)? {
                println!("{}", serde_json::to_string(&candle)?);
            }
        }
        Command::Stream { symbol, resolution } => {
            let feed = BybitKlineFeed::connect(&config.exchange.websocket_url).await?;
            let mut aggregator = StreamingAggregator::new(feed, db, LogChartHandler, &symbol, resolution)?
                .with_history_days(config.stream.history_days);
            aggregator.start().await?;

            tokio::select! {
                result = aggregator.run() => result?,
                _ = tokio::signal::ctrl_c() => info!(target: "stream", "收到中断信号，正在关闭"),
            }
            aggregator.shutdown().await?;
        }
    }

    Ok(())
}
