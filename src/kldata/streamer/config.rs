use crate::klcommon::models::Resolution;
use serde_json::json;
use std::time::Duration;

/// Bybit 线性合约公共推送地址
pub const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// 心跳间隔
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

/// 连接任务命令通道容量
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// K线推送通道容量
pub const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// 断线后最多连续重连次数
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// 首次重连失败后的等待时间，之后每次翻倍
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// 重连等待上限
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// 启动时默认加载的历史天数
pub const DEFAULT_HISTORY_DAYS: u32 = 14;

/// K线主题，例如 kline.5.BTCUSDT
pub fn kline_topic(resolution: Resolution, symbol: &str) -> String {
    format!("kline.{}.{}", resolution.bybit_interval(), symbol)
}

/// 创建订阅消息
pub fn create_subscribe_message(topics: &[String]) -> String {
    json!({ "op": "subscribe", "args": topics }).to_string()
}

/// 创建取消订阅消息
pub fn create_unsubscribe_message(topics: &[String]) -> String {
    json!({ "op": "unsubscribe", "args": topics }).to_string()
}

pub fn create_ping_message() -> String {
    json!({ "op": "ping" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_and_messages() {
        assert_eq!(kline_topic(Resolution::H4, "BTCUSDT"), "kline.240.BTCUSDT");
        assert_eq!(kline_topic(Resolution::D1, "ETHUSDT"), "kline.D.ETHUSDT");
        let msg: serde_json::Value =
            serde_json::from_str(&create_subscribe_message(&["kline.5.BTCUSDT".to_string()])).unwrap();
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0], "kline.5.BTCUSDT");
    }
}
