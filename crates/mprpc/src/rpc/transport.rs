/// WebSocket 传输
///
/// 把 [`RpcClient`] 接到一条 WebSocket 连接上：发送任务把出站字节写成
/// Binary（文本编解码器时写成 Text）消息，接收任务按到达顺序把每条消息交给客户端。
/// 任一方向结束后连接即视为关闭。

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::client::{ClientConfig, RpcClient};
use super::codec::Codec;
use crate::errors::Result;

/// 连接到服务端并完成握手
///
/// 返回的任务句柄在连接关闭后结束。
pub async fn connect(
    url: &str,
    config: ClientConfig,
    codec: impl Codec + 'static,
) -> Result<(RpcClient, JoinHandle<()>)> {
    info!("尝试连接到服务端: {}", url);
    let (ws_stream, _) = connect_async(url).await?;
    info!("✅ WebSocket 连接成功");

    let (client, task) = attach(ws_stream, config, codec);
    if let Err(e) = client.handshake().await {
        task.abort();
        return Err(e.into());
    }
    Ok((client, task))
}

/// 在已建立的 WebSocket 上创建客户端并启动收发任务
///
/// 不会自动握手，调用方需要自行调用 [`RpcClient::handshake`]。
pub fn attach<S>(
    ws_stream: WebSocketStream<S>,
    config: ClientConfig,
    codec: impl Codec + 'static,
) -> (RpcClient, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, outbound) = RpcClient::new(config, codec);
    let task = tokio::spawn(run(ws_stream, client.clone(), outbound));
    (client, task)
}

async fn run<S>(
    ws_stream: WebSocketStream<S>,
    client: RpcClient,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let text = client.codec().is_text();

    // 启动发送任务
    let mut send_task = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            let msg = if text {
                match String::from_utf8(bytes) {
                    Ok(s) => Message::Text(s),
                    Err(e) => {
                        error!("文本帧不是合法的 UTF-8: {}", e);
                        continue;
                    }
                }
            } else {
                Message::Binary(bytes)
            };

            if let Err(e) = ws_sender.send(msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("发送任务结束");
    });

    // 接收任务：按到达顺序逐帧处理
    let receiver_client = client.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Binary(data)) => receiver_client.handle_incoming(&data).await,
                Ok(Message::Text(text)) => receiver_client.handle_incoming(text.as_bytes()).await,
                Ok(Message::Close(frame)) => {
                    info!("收到连接关闭消息: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("接收消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("接收任务结束");
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务已结束");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务已结束");
            send_task.abort();
        }
    }

    client.handle_close().await;
    info!("连接已关闭");
}
