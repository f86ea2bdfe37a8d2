use crate::klcommon::error::{AppError, Result};
use crate::kldata::streamer::config::{
    create_ping_message, create_subscribe_message, create_unsubscribe_message, COMMAND_CHANNEL_CAPACITY,
    PING_INTERVAL, UPDATE_CHANNEL_CAPACITY,
};
use crate::kldata::streamer::message::{parse_push_message, FeedUpdate, PushMessage};
use crate::kldata::streamer::KlineFeed;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum FeedCommand {
    Send(String),
    Close,
}

/// Bybit 公共K线推送连接
///
/// 后台任务独占socket，订阅命令和K线更新都经由mpsc通道传递。
/// socket断开后后台任务退出，由 `reconnect` 建立新的连接。
pub struct BybitKlineFeed {
    url: Url,
    commands: mpsc::Sender<FeedCommand>,
    updates: mpsc::Receiver<Result<FeedUpdate>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

type SocketChannels = (mpsc::Sender<FeedCommand>, mpsc::Receiver<Result<FeedUpdate>>, JoinHandle<()>);

/// 建立连接并启动后台读写任务
async fn open_socket(url: &Url) -> Result<SocketChannels> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| AppError::WebSocketError(format!("WebSocket连接失败: {}", e)))?;
    info!(target: "stream", log_type = "module", "WebSocket连接已建立: {}", url);

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let task = tokio::spawn(run_socket(ws_stream, command_rx, update_tx));
    Ok((command_tx, update_rx, task))
}

impl BybitKlineFeed {
    /// 连接到WebSocket服务器
    #[instrument(err)]
    pub async fn connect(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        info!(target: "stream", log_type = "module", "连接到WebSocket: {}", url);

        let (commands, updates, task) = open_socket(&url).await?;
        Ok(Self {
            url,
            commands,
            updates,
            task: Some(task),
            closed: false,
        })
    }

    async fn send_command(&self, command: FeedCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::WebSocketError("WebSocket连接已关闭".to_string()))
    }
}

#[async_trait]
impl KlineFeed for BybitKlineFeed {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        info!(target: "stream", log_type = "module", "订阅 {}", topic);
        self.send_command(FeedCommand::Send(create_subscribe_message(&[topic.to_string()]))).await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        info!(target: "stream", log_type = "module", "取消订阅 {}", topic);
        self.send_command(FeedCommand::Send(create_unsubscribe_message(&[topic.to_string()]))).await
    }

    async fn next_update(&mut self) -> Result<Option<FeedUpdate>> {
        match self.updates.recv().await {
            Some(Ok(update)) => Ok(Some(update)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn reconnect(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(target: "stream", log_type = "module", "重新连接WebSocket: {}", self.url);
        let (commands, updates, task) = open_socket(&self.url).await?;
        self.commands = commands;
        self.updates = updates;
        self.task = Some(task);
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        // 后台任务可能已经退出，忽略发送失败
        let _ = self.commands.send(FeedCommand::Close).await;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| AppError::WebSocketError(format!("WebSocket任务异常退出: {}", e)))?;
        }
        Ok(())
    }
}

/// socket读写循环，退出时丢弃 update_tx 使接收端结束
async fn run_socket(
    ws_stream: WsStream,
    mut commands: mpsc::Receiver<FeedCommand>,
    updates: mpsc::Sender<Result<FeedUpdate>>,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(FeedCommand::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        let _ = updates.send(Err(AppError::WebSocketError(format!("发送消息失败: {}", e)))).await;
                        break;
                    }
                }
                Some(FeedCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text(create_ping_message())).await {
                    let _ = updates.send(Err(AppError::WebSocketError(format!("发送心跳失败: {}", e)))).await;
                    break;
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_push_message(&text) {
                    Ok(PushMessage::Kline(update)) => {
                        if updates.send(Ok(update)).await.is_err() {
                            break;
                        }
                    }
                    Ok(PushMessage::OpResponse { op, success, ret_msg }) => {
                        if success {
                            debug!(target: "stream", decision = "op_ack", op = %op, "收到操作应答");
                        } else {
                            warn!(target: "stream", log_type = "module", "操作 {} 失败: {}", op, ret_msg);
                        }
                    }
                    Ok(PushMessage::Other) => {}
                    Err(e) => {
                        warn!(target: "stream", log_type = "module", "解析推送消息失败，已跳过: {}", e);
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        error!(target: "stream", "发送Pong失败: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(target: "stream", log_type = "module", "收到关闭消息: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = updates.send(Err(AppError::WebSocketError(format!("WebSocket错误: {}", e)))).await;
                    break;
                }
                None => break,
            },
        }
    }

    info!(target: "stream", log_type = "module", "WebSocket连接已关闭");
}
