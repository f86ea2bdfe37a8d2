use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::Candle;
use serde::Deserialize;
use serde_json::Value;

/// 推送流中的一次K线更新
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub topic: String,
    pub candle: Candle,
    /// K线是否已收盘
    pub confirmed: bool,
}

/// 解析后的推送消息
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Kline(FeedUpdate),
    /// subscribe / unsubscribe / ping 的应答
    OpResponse { op: String, success: bool, ret_msg: String },
    Other,
}

#[derive(Debug, Deserialize)]
struct KlinePush {
    topic: String,
    data: Vec<KlinePushData>,
}

#[derive(Debug, Deserialize)]
struct KlinePushData {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    #[serde(default)]
    confirm: bool,
}

fn number(field: &str, name: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .map_err(|e| AppError::ParseError(format!("推送K线字段 {} = {:?} 无法解析: {}", name, field, e)))
}

/// 解析WebSocket文本消息
pub fn parse_push_message(text: &str) -> Result<PushMessage> {
    let json: Value = serde_json::from_str(text)?;

    let is_kline = json
        .get("topic")
        .and_then(|t| t.as_str())
        .map_or(false, |t| t.starts_with("kline."));
    if is_kline {
        let push: KlinePush = serde_json::from_value(json)?;
        let data = push
            .data
            .first()
            .ok_or_else(|| AppError::ParseError(format!("推送消息 {} 没有K线数据", push.topic)))?;
        let candle = Candle {
            open_time: data.start,
            open: number(&data.open, "open")?,
            high: number(&data.high, "high")?,
            low: number(&data.low, "low")?,
            close: number(&data.close, "close")?,
            volume: number(&data.volume, "volume")?,
        };
        candle
            .validate()
            .map_err(|e| AppError::ParseError(format!("推送K线数值非法: {}", e)))?;
        return Ok(PushMessage::Kline(FeedUpdate {
            topic: push.topic,
            candle,
            confirmed: data.confirm,
        }));
    }

    if let Some(op) = json.get("op").and_then(|o| o.as_str()) {
        return Ok(PushMessage::OpResponse {
            op: op.to_string(),
            success: json.get("success").and_then(|s| s.as_bool()).unwrap_or(false),
            ret_msg: json.get("ret_msg").and_then(|m| m.as_str()).unwrap_or_default().to_string(),
        });
    }

    Ok(PushMessage::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kline_push() {
        let text = r#"{"topic":"kline.5.BTCUSDT","type":"snapshot","ts":1704067260000,
            "data":[{"start":1704067200000,"end":1704067499999,"interval":"5",
                     "open":"42000","close":"42010.5","high":"42020","low":"41990",
                     "volume":"12.3","turnover":"516000","confirm":false,"timestamp":1704067260000}]}"#;
        match parse_push_message(text).unwrap() {
            PushMessage::Kline(update) => {
                assert_eq!(update.topic, "kline.5.BTCUSDT");
                assert_eq!(update.candle.open_time, 1_704_067_200_000);
                assert_eq!(update.candle.close, 42010.5);
                assert!(!update.confirmed);
            }
            other => panic!("意外的消息类型: {:?}", other),
        }
    }

    #[test]
    fn parses_op_response() {
        let text = r#"{"success":true,"ret_msg":"","conn_id":"abc","op":"subscribe"}"#;
        assert_eq!(
            parse_push_message(text).unwrap(),
            PushMessage::OpResponse { op: "subscribe".into(), success: true, ret_msg: String::new() }
        );
    }

    #[test]
    fn malformed_kline_is_parse_error() {
        let text = r#"{"topic":"kline.5.BTCUSDT","data":[{"start":1704067200000,"open":"x","close":"1","high":"1","low":"1","volume":"1"}]}"#;
        assert!(matches!(parse_push_message(text), Err(AppError::ParseError(_))));
        assert!(parse_push_message("not json").is_err());
    }
}
