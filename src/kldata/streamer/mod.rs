// K线实时流与会话VWAP
mod config;
mod connection;
mod message;
mod vwap;

pub use config::{
    kline_topic, BYBIT_WS_URL, DEFAULT_HISTORY_DAYS, MAX_RECONNECT_ATTEMPTS, RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY,
};
pub use connection::BybitKlineFeed;
pub use message::{parse_push_message, FeedUpdate, PushMessage};
pub use vwap::{session_key, Session, VwapCalculator};

use crate::klcommon::context::run_blocking;
use crate::klcommon::db::Database;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{format_ts, validate_symbol, Candle, Resolution, VwapPoint, DAY_MS};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 实时K线推送源
#[async_trait]
pub trait KlineFeed: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;
    /// 下一条K线更新，推送源关闭时返回 None
    async fn next_update(&mut self) -> Result<Option<FeedUpdate>>;
    async fn close(&mut self) -> Result<()>;

    /// 断线后重新建立连接，订阅由调用方恢复
    ///
    /// 返回 false 表示推送源已正常结束，不再重连
    async fn reconnect(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// 历史K线查询接口（启动和切换周期时用于种子数据）
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load_history(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>>;
}

#[async_trait]
impl HistorySource for Database {
    async fn load_history(&self, symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>> {
        let db = self.clone();
        let symbol = symbol.to_string();
        run_blocking(move || db.get_klines(&symbol, resolution, start, end)).await
    }
}

/// 图表数据回调
pub trait ChartDataHandler: Send {
    /// 历史数据加载完成（启动或切换周期后）
    fn on_history(&mut self, _candles: &[Candle], _vwap: &[VwapPoint]) {}
    fn on_candle_update(&mut self, candle: &Candle);
    fn on_new_candle(&mut self, candle: &Candle);
    fn on_vwap_point(&mut self, point: &VwapPoint);
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 订阅实时K线，维护当前K线和按日累计的VWAP，并把变化推给回调
pub struct StreamingAggregator<F: KlineFeed, S: HistorySource, H: ChartDataHandler> {
    feed: F,
    history: Arc<S>,
    handler: H,
    symbol: String,
    resolution: Resolution,
    history_days: u32,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    vwap: VwapCalculator,
    last_open_time: Option<i64>,
    current: Option<Candle>,
    topic: Option<String>,
}

impl<F: KlineFeed, S: HistorySource, H: ChartDataHandler> StreamingAggregator<F, S, H> {
    pub fn new(feed: F, history: Arc<S>, handler: H, symbol: &str, resolution: Resolution) -> Result<Self> {
        validate_symbol(symbol)?;
        Ok(Self {
            feed,
            history,
            handler,
            symbol: symbol.to_string(),
            resolution,
            history_days: DEFAULT_HISTORY_DAYS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_INITIAL_DELAY,
            vwap: VwapCalculator::new(),
            last_open_time: None,
            current: None,
            topic: None,
        })
    }

    pub fn with_history_days(mut self, history_days: u32) -> Self {
        self.history_days = history_days.max(1);
        self
    }

    /// 断线重连策略：最多重试次数和首次重试前的等待
    pub fn with_reconnect(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay = initial_delay;
        self
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn vwap(&self) -> &VwapCalculator {
        &self.vwap
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// 正在形成的K线
    pub fn current_candle(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// 当前K线距离收盘的毫秒数
    pub fn time_remaining(&self, now: i64) -> Option<i64> {
        self.current
            .map(|c| (c.open_time + self.resolution.period_ms() - now).max(0))
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_at(now_ms()).await
    }

    /// 以 now 为终点加载历史并订阅
    #[instrument(skip(self), fields(symbol = %self.symbol, resolution = %self.resolution), err)]
    pub async fn start_at(&mut self, now: i64) -> Result<()> {
        self.seed_history(now).await?;
        self.subscribe().await
    }

    async fn seed_history(&mut self, now: i64) -> Result<()> {
        // 从UTC零点开始加载，最早一天的VWAP才是完整交易日的累计值
        let start = Resolution::D1.align(now - self.history_days as i64 * DAY_MS);
        let candles = self
            .history
            .load_history(&self.symbol, self.resolution, start, now)
            .await?;

        self.vwap.reset();
        self.vwap.add_candles(&candles);
        self.current = candles.last().copied();
        self.last_open_time = self.current.map(|c| c.open_time);

        info!(
            target: "stream",
            log_type = "module",
            "{}/{}: 加载历史 {} 根K线，自 {}",
            self.symbol,
            self.resolution,
            candles.len(),
            format_ts(start)
        );
        let series = self.vwap.series();
        self.handler.on_history(&candles, &series);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        let topic = kline_topic(self.resolution, &self.symbol);
        self.feed.subscribe(&topic).await?;
        self.topic = Some(topic);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if let Some(topic) = self.topic.take() {
            self.feed.unsubscribe(&topic).await?;
        }
        Ok(())
    }

    /// 处理一根推送来的K线
    pub fn handle_candle(&mut self, candle: Candle) {
        self.handler.on_candle_update(&candle);

        if self.last_open_time != Some(candle.open_time) {
            debug!(target: "stream", decision = "new_candle", open_time = candle.open_time, "新K线开始");
            self.last_open_time = Some(candle.open_time);
            self.handler.on_new_candle(&candle);
        }
        self.current = Some(candle);

        for point in self.vwap.add_candle(candle) {
            self.handler.on_vwap_point(&point);
        }
    }

    /// 持续消费推送；连接断开时重连并恢复当前订阅，推送源正常结束时返回
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.feed.next_update().await {
                Ok(Some(update)) => {
                    if self.topic.as_deref() != Some(update.topic.as_str()) {
                        debug!(target: "stream", decision = "stale_topic", topic = %update.topic, "忽略非当前订阅的推送");
                        continue;
                    }
                    self.handle_candle(update.candle);
                }
                Ok(None) => {
                    if !self.recover_feed().await? {
                        info!(target: "stream", log_type = "module", "{}/{}: 推送流已结束", self.symbol, self.resolution);
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(
                        target: "stream",
                        log_type = "module",
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "{}/{}: 推送流出错，准备重连",
                        self.symbol,
                        self.resolution
                    );
                    if !self.recover_feed().await? {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// 按指数退避重连，成功后重新订阅当前主题
    async fn recover_feed(&mut self) -> Result<bool> {
        let mut delay = self.reconnect_delay;
        let mut last_error = None;

        for attempt in 1..=self.max_reconnect_attempts {
            match self.feed.reconnect().await {
                Ok(false) => return Ok(false),
                Ok(true) => {
                    if let Some(topic) = self.topic.clone() {
                        self.feed.subscribe(&topic).await?;
                    }
                    info!(target: "stream", log_type = "module", "{}/{}: 第{}次重连成功，已恢复订阅", self.symbol, self.resolution, attempt);
                    return Ok(true);
                }
                Err(e) => {
                    error!(
                        target: "stream",
                        log_type = "module",
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "第{}/{}次重连失败",
                        attempt,
                        self.max_reconnect_attempts
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.max_reconnect_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }

        Err(AppError::WebSocketError(format!(
            "重连{}次均失败: {}",
            self.max_reconnect_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub async fn change_resolution(&mut self, resolution: Resolution) -> Result<()> {
        self.change_resolution_at(resolution, now_ms()).await
    }

    /// 切换周期：取消旧订阅，清空全部状态，重新加载历史后订阅新周期
    #[instrument(skip(self), fields(symbol = %self.symbol, from = %self.resolution), err)]
    pub async fn change_resolution_at(&mut self, resolution: Resolution, now: i64) -> Result<()> {
        self.unsubscribe().await?;
        self.vwap.reset();
        self.current = None;
        self.last_open_time = None;
        self.resolution = resolution;
        self.seed_history(now).await?;
        self.subscribe().await
    }

    /// 取消订阅并关闭推送源
    pub async fn shutdown(&mut self) -> Result<()> {
        self.unsubscribe().await?;
        self.feed.close().await
    }
}
