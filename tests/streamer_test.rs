mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use async_trait::async_trait;
    use kline_vwap::klcommon::models::DAY_MS;
    use kline_vwap::klcommon::{Candle, Resolution, Result, VwapPoint};
    use kline_vwap::kldata::streamer::{kline_topic, FeedUpdate, HistorySource};
    use kline_vwap::kldata::{ChartDataHandler, KlineFeed, StreamingAggregator};
    use kline_vwap::klcommon::AppError;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// 由测试直接推送更新的假推送源
    ///
    /// reconnects 依次给出每次重连的结果：Some(rx) 为连接成功，None 为连接失败；队列为空时推送源结束
    struct ChannelFeed {
        updates: mpsc::UnboundedReceiver<FeedUpdate>,
        ops: Arc<Mutex<Vec<String>>>,
        reconnects: VecDeque<Option<mpsc::UnboundedReceiver<FeedUpdate>>>,
    }

    #[async_trait]
    impl KlineFeed for ChannelFeed {
        async fn subscribe(&mut self, topic: &str) -> Result<()> {
            self.ops.lock().unwrap().push(format!("subscribe {}", topic));
            Ok(())
        }

        async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
            self.ops.lock().unwrap().push(format!("unsubscribe {}", topic));
            Ok(())
        }

        async fn next_update(&mut self) -> Result<Option<FeedUpdate>> {
            Ok(self.updates.recv().await)
        }

        async fn close(&mut self) -> Result<()> {
            self.ops.lock().unwrap().push("close".to_string());
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<bool> {
            match self.reconnects.pop_front() {
                None => Ok(false),
                Some(None) => {
                    self.ops.lock().unwrap().push("reconnect failed".to_string());
                    Err(AppError::WebSocketError("连接被拒绝".to_string()))
                }
                Some(Some(updates)) => {
                    self.ops.lock().unwrap().push("reconnect".to_string());
                    self.updates = updates;
                    Ok(true)
                }
            }
        }
    }

    /// 内存历史数据
    struct MemoryHistory {
        candles: Vec<(Resolution, Candle)>,
    }

    #[async_trait]
    impl HistorySource for MemoryHistory {
        async fn load_history(&self, _symbol: &str, resolution: Resolution, start: i64, end: i64) -> Result<Vec<Candle>> {
            Ok(self
                .candles
                .iter()
                .filter(|(r, c)| *r == resolution && c.open_time >= start && c.open_time <= end)
                .map(|(_, c)| *c)
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        history: Vec<(usize, usize)>,
        updates: Vec<Candle>,
        new_candles: Vec<i64>,
        vwap: Vec<VwapPoint>,
    }

    impl ChartDataHandler for RecordingHandler {
        fn on_history(&mut self, candles: &[Candle], vwap: &[VwapPoint]) {
            self.history.push((candles.len(), vwap.len()));
        }

        fn on_candle_update(&mut self, candle: &Candle) {
            self.updates.push(*candle);
        }

        fn on_new_candle(&mut self, candle: &Candle) {
            self.new_candles.push(candle.open_time);
        }

        fn on_vwap_point(&mut self, point: &VwapPoint) {
            self.vwap.push(*point);
        }
    }

    type Aggregator = StreamingAggregator<ChannelFeed, MemoryHistory, RecordingHandler>;

    fn bar(open_time: i64, close: f64, volume: f64) -> Candle {
        Candle::new(open_time, close, close + 1.0, close - 1.0, close, volume)
    }

    fn setup(history: Vec<(Resolution, Candle)>) -> (Aggregator, mpsc::UnboundedSender<FeedUpdate>, Arc<Mutex<Vec<String>>>) {
        setup_with_reconnects(history, VecDeque::new())
    }

    fn setup_with_reconnects(
        history: Vec<(Resolution, Candle)>,
        reconnects: VecDeque<Option<mpsc::UnboundedReceiver<FeedUpdate>>>,
    ) -> (Aggregator, mpsc::UnboundedSender<FeedUpdate>, Arc<Mutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let feed = ChannelFeed { updates: rx, ops: ops.clone(), reconnects };
        let aggregator = StreamingAggregator::new(
            feed,
            Arc::new(MemoryHistory { candles: history }),
            RecordingHandler::default(),
            "BTCUSDT",
            Resolution::M5,
        )
        .unwrap();
        (aggregator, tx, ops)
    }

    fn update(resolution: Resolution, candle: Candle) -> FeedUpdate {
        FeedUpdate {
            topic: kline_topic(resolution, "BTCUSDT"),
            candle,
            confirmed: false,
        }
    }

    #[tokio::test]
    async fn test_start_seeds_history_and_subscribes() {
        let t0 = ts(2024, 1, 2);
        let history: Vec<(Resolution, Candle)> =
            (0..3).map(|i| (Resolution::M5, bar(t0 + i * P, 100.0, 1.0))).collect();
        let (mut aggregator, _tx, ops) = setup(history);

        aggregator.start_at(t0 + 3 * P).await.unwrap();

        assert_eq!(*ops.lock().unwrap(), vec!["subscribe kline.5.BTCUSDT".to_string()]);
        assert_eq!(aggregator.handler().history, vec![(3, 3)]);
        assert_eq!(aggregator.current_candle().map(|c| c.open_time), Some(t0 + 2 * P));
        assert_eq!(aggregator.vwap().series().len(), 3);
    }

    #[tokio::test]
    async fn test_new_candle_detection() {
        let t0 = ts(2024, 1, 2);
        let (mut aggregator, _tx, _ops) = setup(vec![(Resolution::M5, bar(t0, 100.0, 1.0))]);
        aggregator.start_at(t0 + P).await.unwrap();

        // 与历史最后一根同一时间：只是更新
        aggregator.handle_candle(bar(t0, 101.0, 2.0));
        aggregator.handle_candle(bar(t0 + P, 102.0, 1.0));
        aggregator.handle_candle(bar(t0 + P, 103.0, 2.0));
        aggregator.handle_candle(bar(t0 + 2 * P, 104.0, 1.0));

        let handler = aggregator.handler();
        assert_eq!(handler.updates.len(), 4, "每次推送都转发K线更新");
        assert_eq!(handler.new_candles, vec![t0 + P, t0 + 2 * P], "每个新时间只触发一次新K线");
        assert_eq!(handler.vwap.len(), 4);
        assert_eq!(aggregator.vwap().series().len(), 3);
    }

    #[tokio::test]
    async fn test_vwap_points_follow_sessions() {
        let t0 = ts(2024, 1, 2);
        let (mut aggregator, _tx, _ops) = setup(Vec::new());
        aggregator.start_at(t0).await.unwrap();

        aggregator.handle_candle(bar(t0 + DAY_MS - P, 200.0, 5.0));
        aggregator.handle_candle(bar(t0 + DAY_MS, 100.0, 0.0));

        let vwap = &aggregator.handler().vwap;
        assert_eq!(vwap.len(), 2);
        assert!((vwap[0].value - 200.0).abs() < 1e-9);
        assert!((vwap[1].value - 100.0).abs() < 1e-9, "新的一天从典型价格重新开始");
        assert_eq!(aggregator.vwap().session_count(), 2);
    }

    #[tokio::test]
    async fn test_change_resolution_resets_state() {
        let t0 = ts(2024, 1, 2);
        let history = vec![
            (Resolution::M5, bar(t0, 100.0, 1.0)),
            (Resolution::M5, bar(t0 + P, 100.0, 1.0)),
            (Resolution::H1, bar(t0, 300.0, 10.0)),
        ];
        let (mut aggregator, _tx, ops) = setup(history);
        aggregator.start_at(t0 + 2 * P).await.unwrap();
        aggregator.handle_candle(bar(t0 + 2 * P, 110.0, 1.0));

        aggregator.change_resolution_at(Resolution::H1, t0 + 2 * P).await.unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                "subscribe kline.5.BTCUSDT".to_string(),
                "unsubscribe kline.5.BTCUSDT".to_string(),
                "subscribe kline.60.BTCUSDT".to_string(),
            ]
        );
        assert_eq!(aggregator.resolution(), Resolution::H1);
        let series = aggregator.vwap().series();
        assert_eq!(series.len(), 1, "切换周期后VWAP只包含新周期的历史");
        assert!((series[0].value - 300.0).abs() < 1e-9);
        assert_eq!(aggregator.handler().history.last(), Some(&(1, 1)));
        assert_eq!(aggregator.current_candle().map(|c| c.open_time), Some(t0));

        aggregator.handle_candle(bar(t0 + 12 * P, 301.0, 1.0));
        assert_eq!(aggregator.handler().new_candles.last(), Some(&(t0 + 12 * P)));
        assert_eq!(aggregator.time_remaining(t0 + 12 * P), Some(Resolution::H1.period_ms()));
    }

    #[tokio::test]
    async fn test_run_ignores_stale_topics_until_closed() {
        let t0 = ts(2024, 1, 2);
        let (mut aggregator, tx, _ops) = setup(Vec::new());
        aggregator.start_at(t0).await.unwrap();

        tx.send(update(Resolution::H1, bar(t0, 100.0, 1.0))).unwrap();
        tx.send(update(Resolution::M5, bar(t0, 100.0, 1.0))).unwrap();
        tx.send(update(Resolution::M5, bar(t0 + P, 101.0, 1.0))).unwrap();
        drop(tx);

        aggregator.run().await.unwrap();

        assert_eq!(aggregator.handler().updates.len(), 2, "非当前订阅的推送应被忽略");
        assert_eq!(aggregator.time_remaining(t0 + P + 60_000), Some(4 * 60_000));
        assert_eq!(aggregator.time_remaining(t0 + 10 * P), Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_and_closes() {
        let (mut aggregator, _tx, ops) = setup(Vec::new());
        aggregator.start_at(ts(2024, 1, 2)).await.unwrap();

        aggregator.shutdown().await.unwrap();

        let ops = ops.lock().unwrap();
        assert_eq!(ops[1], "unsubscribe kline.5.BTCUSDT");
        assert_eq!(ops[2], "close");
    }

    #[tokio::test]
    async fn test_database_seeds_history() {
        let db = Arc::new(setup_test_db("stream_history"));
        let t0 = ts(2024, 1, 2);
        db.upsert_many("BTCUSDT", Resolution::M5, &candle_series(t0, 12)).unwrap();

        let (_tx, rx) = mpsc::unbounded_channel();
        let feed = ChannelFeed { updates: rx, ops: Arc::new(Mutex::new(Vec::new())), reconnects: VecDeque::new() };
        let mut aggregator =
            StreamingAggregator::new(feed, db, RecordingHandler::default(), "BTCUSDT", Resolution::M5)
                .unwrap()
                .with_history_days(1);
        aggregator.start_at(t0 + 12 * P).await.unwrap();

        assert_eq!(aggregator.handler().history, vec![(12, 12)]);
        assert_eq!(aggregator.vwap().session_count(), 1);
    }

    #[tokio::test]
    async fn test_seed_starts_at_utc_midnight() {
        let day = ts(2024, 1, 2);
        let history: Vec<(Resolution, Candle)> = [100.0, 200.0, 300.0, 400.0]
            .iter()
            .enumerate()
            .map(|(i, close)| (Resolution::M5, bar(day + i as i64 * P, *close, 1.0)))
            .collect();
        let (aggregator, _tx, _ops) = setup(history);
        let mut aggregator = aggregator.with_history_days(1);

        // 回看一天落在 day + 2P，加载仍应从当天零点开始
        aggregator.start_at(day + DAY_MS + 2 * P).await.unwrap();

        assert_eq!(aggregator.handler().history, vec![(4, 4)], "最早一天的K线应全部加载");
        let series = aggregator.vwap().series();
        assert!((series[0].value - 100.0).abs() < 1e-9);
        assert!((series[3].value - 250.0).abs() < 1e-9, "VWAP应从当天第一根K线开始累计");
    }

    #[tokio::test]
    async fn test_dropped_feed_reconnects_and_resubscribes() {
        let t0 = ts(2024, 1, 2);
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (aggregator, tx, ops) = setup_with_reconnects(Vec::new(), VecDeque::from(vec![Some(rx2)]));
        let mut aggregator = aggregator.with_reconnect(3, Duration::from_millis(1));
        aggregator.start_at(t0).await.unwrap();

        tx.send(update(Resolution::M5, bar(t0, 100.0, 1.0))).unwrap();
        drop(tx);
        tx2.send(update(Resolution::M5, bar(t0 + P, 101.0, 1.0))).unwrap();
        drop(tx2);

        aggregator.run().await.unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                "subscribe kline.5.BTCUSDT".to_string(),
                "reconnect".to_string(),
                "subscribe kline.5.BTCUSDT".to_string(),
            ],
            "断线后应重连并恢复当前订阅"
        );
        assert_eq!(aggregator.handler().new_candles, vec![t0, t0 + P], "重连后的推送继续处理");
    }

    #[tokio::test]
    async fn test_reconnect_retries_after_failure() {
        let t0 = ts(2024, 1, 2);
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (aggregator, tx, ops) = setup_with_reconnects(Vec::new(), VecDeque::from(vec![None, Some(rx2)]));
        let mut aggregator = aggregator.with_reconnect(3, Duration::from_millis(1));
        aggregator.start_at(t0).await.unwrap();

        drop(tx);
        tx2.send(update(Resolution::M5, bar(t0, 100.0, 1.0))).unwrap();
        drop(tx2);

        aggregator.run().await.unwrap();

        let ops = ops.lock().unwrap();
        assert_eq!(ops[1], "reconnect failed");
        assert_eq!(ops[2], "reconnect");
        assert_eq!(ops[3], "subscribe kline.5.BTCUSDT");
        assert_eq!(aggregator.handler().updates.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let (aggregator, tx, ops) = setup_with_reconnects(Vec::new(), VecDeque::from(vec![None, None, None, None]));
        let mut aggregator = aggregator.with_reconnect(3, Duration::from_millis(1));
        aggregator.start_at(ts(2024, 1, 2)).await.unwrap();
        drop(tx);

        let err = aggregator.run().await.unwrap_err();

        assert!(matches!(err, AppError::WebSocketError(_)), "重连失败应返回错误而不是静默结束: {:?}", err);
        let failures = ops.lock().unwrap().iter().filter(|op| *op == "reconnect failed").count();
        assert_eq!(failures, 3);
    }
}
