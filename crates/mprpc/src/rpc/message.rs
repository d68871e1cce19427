/// RPC 帧定义
///
/// 所有帧在线路上都是数组，第一个元素为消息类型：
/// `[type, msgid, ...]`

use serde_json::{json, Map, Value};

use super::RpcError;

/// RPC 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// 通知（保留，不跟踪 msgid）
    Notify = 1,
    Request = 2,
    Response = 3,
    RequestStreamChunk = 4,
    ResponseStreamChunk = 5,
    RequestStreamEnd = 6,
    ResponseStreamEnd = 7,
    RequestCancel = 8,
    /// 服务端取消确认（保留）
    ResponseCancel = 9,
}

impl MessageType {
    pub fn from_u64(v: u64) -> Option<Self> {
        let ty = match v {
            1 => Self::Notify,
            2 => Self::Request,
            3 => Self::Response,
            4 => Self::RequestStreamChunk,
            5 => Self::ResponseStreamChunk,
            6 => Self::RequestStreamEnd,
            7 => Self::ResponseStreamEnd,
            8 => Self::RequestCancel,
            9 => Self::ResponseCancel,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 线路上的方法标识：名称或数字 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodRef {
    Name(String),
    Id(u32),
}

impl MethodRef {
    fn to_value(&self) -> Value {
        match self {
            Self::Name(name) => Value::String(name.clone()),
            Self::Id(id) => json!(id),
        }
    }

    fn from_value(value: &Value) -> Result<Self, RpcError> {
        match value {
            Value::String(name) => Ok(Self::Name(name.clone())),
            other => read_u32(other, "method").map(Self::Id),
        }
    }
}

/// RPC 帧
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Notify {
        method: MethodRef,
        params: Vec<Value>,
    },
    Request {
        id: u32,
        method: MethodRef,
        params: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Response {
        id: u32,
        error: Option<Value>,
        result: Value,
    },
    RequestStreamChunk {
        id: u32,
        value: Value,
    },
    ResponseStreamChunk {
        id: u32,
        value: Value,
    },
    RequestStreamEnd {
        id: u32,
    },
    ResponseStreamEnd {
        id: u32,
    },
    RequestCancel {
        id: u32,
    },
    ResponseCancel {
        id: u32,
    },
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Notify { .. } => MessageType::Notify,
            Self::Request { .. } => MessageType::Request,
            Self::Response { .. } => MessageType::Response,
            Self::RequestStreamChunk { .. } => MessageType::RequestStreamChunk,
            Self::ResponseStreamChunk { .. } => MessageType::ResponseStreamChunk,
            Self::RequestStreamEnd { .. } => MessageType::RequestStreamEnd,
            Self::ResponseStreamEnd { .. } => MessageType::ResponseStreamEnd,
            Self::RequestCancel { .. } => MessageType::RequestCancel,
            Self::ResponseCancel { .. } => MessageType::ResponseCancel,
        }
    }

    /// 关联的 msgid，NOTIFY 没有
    pub fn msgid(&self) -> Option<u32> {
        match self {
            Self::Notify { .. } => None,
            Self::Request { id, .. }
            | Self::Response { id, .. }
            | Self::RequestStreamChunk { id, .. }
            | Self::ResponseStreamChunk { id, .. }
            | Self::RequestStreamEnd { id }
            | Self::ResponseStreamEnd { id }
            | Self::RequestCancel { id }
            | Self::ResponseCancel { id } => Some(*id),
        }
    }

    /// 转换为线路上的数组形式
    pub fn to_value(&self) -> Value {
        let ty = self.message_type().as_u8();
        match self {
            Self::Notify { method, params } => json!([ty, method.to_value(), params]),
            Self::Request {
                id,
                method,
                params,
                kwargs,
            } => {
                // kwargs 为空时省略
                if kwargs.is_empty() {
                    json!([ty, id, method.to_value(), params])
                } else {
                    json!([ty, id, method.to_value(), params, kwargs])
                }
            }
            Self::Response { id, error, result } => json!([ty, id, error, result]),
            Self::RequestStreamChunk { id, value } | Self::ResponseStreamChunk { id, value } => {
                json!([ty, id, value])
            }
            Self::RequestStreamEnd { id }
            | Self::ResponseStreamEnd { id }
            | Self::RequestCancel { id }
            | Self::ResponseCancel { id } => json!([ty, id]),
        }
    }

    /// 从线路上的数组形式解析
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        let mut items = match value {
            Value::Array(items) => items.into_iter(),
            other => {
                return Err(RpcError::malformed_frame(format!(
                    "帧必须是数组: {}",
                    other
                )))
            }
        };

        let raw_type = items
            .next()
            .ok_or_else(|| RpcError::malformed_frame("空帧"))?;
        let raw_type = raw_type
            .as_u64()
            .ok_or_else(|| RpcError::malformed_frame(format!("无效的消息类型: {}", raw_type)))?;
        let ty = MessageType::from_u64(raw_type)
            .ok_or_else(|| RpcError::malformed_frame(format!("未知的消息类型: {}", raw_type)))?;

        let frame = match ty {
            MessageType::Notify => {
                let method = MethodRef::from_value(&next_field(&mut items, "method")?)?;
                let params = read_params(items.next())?;
                Self::Notify { method, params }
            }
            MessageType::Request => {
                let id = next_msgid(&mut items)?;
                let method = MethodRef::from_value(&next_field(&mut items, "method")?)?;
                let params = read_params(items.next())?;
                let kwargs = match items.next() {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        return Err(RpcError::malformed_frame(format!(
                            "kwargs 必须是对象: {}",
                            other
                        )))
                    }
                };
                Self::Request {
                    id,
                    method,
                    params,
                    kwargs,
                }
            }
            MessageType::Response => {
                let id = next_msgid(&mut items)?;
                let error = match next_field(&mut items, "error")? {
                    Value::Null => None,
                    err => Some(err),
                };
                let result = items.next().unwrap_or(Value::Null);
                Self::Response { id, error, result }
            }
            MessageType::RequestStreamChunk => Self::RequestStreamChunk {
                id: next_msgid(&mut items)?,
                value: next_field(&mut items, "value")?,
            },
            MessageType::ResponseStreamChunk => Self::ResponseStreamChunk {
                id: next_msgid(&mut items)?,
                value: next_field(&mut items, "value")?,
            },
            MessageType::RequestStreamEnd => Self::RequestStreamEnd {
                id: next_msgid(&mut items)?,
            },
            MessageType::ResponseStreamEnd => Self::ResponseStreamEnd {
                id: next_msgid(&mut items)?,
            },
            MessageType::RequestCancel => Self::RequestCancel {
                id: next_msgid(&mut items)?,
            },
            MessageType::ResponseCancel => Self::ResponseCancel {
                id: next_msgid(&mut items)?,
            },
        };
        Ok(frame)
    }
}

fn next_field(
    items: &mut std::vec::IntoIter<Value>,
    field: &str,
) -> Result<Value, RpcError> {
    items
        .next()
        .ok_or_else(|| RpcError::malformed_frame(format!("帧缺少字段: {}", field)))
}

fn next_msgid(items: &mut std::vec::IntoIter<Value>) -> Result<u32, RpcError> {
    read_u32(&next_field(items, "msgid")?, "msgid")
}

fn read_u32(value: &Value, field: &str) -> Result<u32, RpcError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| RpcError::malformed_frame(format!("无效的 {}: {}", field, value)))
}

fn read_params(value: Option<Value>) -> Result<Vec<Value>, RpcError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(params)) => Ok(params),
        Some(other) => Err(RpcError::malformed_frame(format!(
            "params 必须是数组: {}",
            other
        ))),
    }
}
