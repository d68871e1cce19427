/// 错误处理

use thiserror::Error;

use crate::rpc::RpcError;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("RPC 错误: {0}")]
    Rpc(RpcError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket 错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
