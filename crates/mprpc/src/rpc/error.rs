/// RPC 调用错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 调用方使用错误（同步返回，不发送任何帧）
    UnknownMethod,
    RequestStreamRequired,
    UnexpectedRequestStream,
    MethodInFlight,
    MsgIdExhausted,
    NotResponseStreaming,
    NotEstablished,

    // 服务端错误
    ServerError,

    // 本地取消
    Cancelled,

    // 连接 / 握手
    ConnectionClosed,
    HandshakeFailed,

    // 编解码
    SerializationError,
    MalformedFrame,
}

/// 错误大类，方便调用方按类型分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    Usage,
    Server,
    Cancelled,
    Connection,
    Handshake,
    Decode,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::RequestStreamRequired => "REQUEST_STREAM_REQUIRED",
            Self::UnexpectedRequestStream => "UNEXPECTED_REQUEST_STREAM",
            Self::MethodInFlight => "METHOD_IN_FLIGHT",
            Self::MsgIdExhausted => "MSGID_EXHAUSTED",
            Self::NotResponseStreaming => "NOT_RESPONSE_STREAMING",
            Self::NotEstablished => "NOT_ESTABLISHED",

            Self::ServerError => "SERVER_ERROR",

            Self::Cancelled => "CANCELLED",

            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::HandshakeFailed => "HANDSHAKE_FAILED",

            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::MalformedFrame => "MALFORMED_FRAME",
        }
    }

    /// 错误所属大类
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            Self::UnknownMethod
            | Self::RequestStreamRequired
            | Self::UnexpectedRequestStream
            | Self::MethodInFlight
            | Self::MsgIdExhausted
            | Self::NotResponseStreaming
            | Self::NotEstablished => RpcErrorKind::Usage,
            Self::ServerError => RpcErrorKind::Server,
            Self::Cancelled => RpcErrorKind::Cancelled,
            Self::ConnectionClosed => RpcErrorKind::Connection,
            Self::HandshakeFailed => RpcErrorKind::Handshake,
            Self::SerializationError | Self::MalformedFrame => RpcErrorKind::Decode,
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    /// 服务端原样返回的错误负载
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    /// 创建新的 RPC 错误
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// 创建带详情的 RPC 错误
    pub fn with_details(
        code: RpcErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn kind(&self) -> RpcErrorKind {
        self.code.kind()
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == RpcErrorCode::Cancelled
    }

    /// 方法不存在
    pub fn unknown_method(method: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::UnknownMethod,
            format!("未知的 RPC 方法: {}", method),
        )
    }

    /// 请求流式方法未提供 request_stream
    pub fn request_stream_required(method: &str) -> Self {
        Self::new(
            RpcErrorCode::RequestStreamRequired,
            format!("{} 必须提供 request_stream", method),
        )
    }

    /// 非请求流式方法却提供了 request_stream
    pub fn unexpected_request_stream(method: &str) -> Self {
        Self::new(
            RpcErrorCode::UnexpectedRequestStream,
            format!("{} 不是请求流式方法", method),
        )
    }

    /// msgid_eq_mthid 模式下同一方法重复调用
    pub fn method_in_flight(method: &str) -> Self {
        Self::new(
            RpcErrorCode::MethodInFlight,
            format!("RPC {} 正在执行中", method),
        )
    }

    /// 消息 ID 空间已耗尽
    pub fn msgid_exhausted(min: u32, max: u32) -> Self {
        Self::new(
            RpcErrorCode::MsgIdExhausted,
            format!("消息 ID 空间 [{}, {}] 已全部占用", min, max),
        )
    }

    /// 非响应流式方法
    pub fn not_response_streaming(method: &str) -> Self {
        Self::new(
            RpcErrorCode::NotResponseStreaming,
            format!("{} 不是响应流式方法", method),
        )
    }

    /// 握手尚未完成
    pub fn not_established() -> Self {
        Self::new(RpcErrorCode::NotEstablished, "握手尚未完成")
    }

    /// 服务端返回的错误，保留原始负载
    pub fn server(details: serde_json::Value) -> Self {
        let message = match &details {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::with_details(RpcErrorCode::ServerError, message, details)
    }

    /// 调用已取消
    pub fn cancelled() -> Self {
        Self::new(RpcErrorCode::Cancelled, "调用已取消")
    }

    /// 连接关闭错误
    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "连接已关闭")
    }

    /// 握手失败
    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::HandshakeFailed, message)
    }

    /// 序列化错误
    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }

    /// 帧格式错误
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MalformedFrame, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        crate::Error::Rpc(err)
    }
}
