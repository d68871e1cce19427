/// 线路编解码
///
/// 引擎只关心结构化的 `serde_json::Value`，字节层的编码由注入的 [`Codec`] 决定。
/// - [`MsgPackCodec`]：MessagePack（默认，与 Python / JS 端一致）
/// - [`JsonCodec`]：JSON 文本，便于调试

use serde_json::Value;

use super::RpcError;

/// 编解码器：两个纯函数
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError>;

    /// 编码结果是否为 UTF-8 文本（决定 WebSocket 用 Text 还是 Binary 帧）
    fn is_text(&self) -> bool {
        false
    }
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        (**self).encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        (**self).decode(bytes)
    }

    fn is_text(&self) -> bool {
        (**self).is_text()
    }
}

/// MessagePack 编解码器
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        // 对象必须编码成 map，服务端按键名读取握手字段
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        // 先解成 rmpv::Value：bin / ext 在 JSON 里没有对应类型，直接反序列化会失败
        let value = rmpv::decode::read_value(&mut &bytes[..])
            .map_err(RpcError::serialization_error)?;
        Ok(msgpack_to_json(value))
    }
}

/// bin 和 ext 转换为字节数组，非 UTF-8 字符串按有损方式转换
fn msgpack_to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => i
            .as_u64()
            .map(Value::from)
            .or_else(|| i.as_i64().map(Value::from))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(f) => Value::from(f64::from(f)),
        rmpv::Value::F64(f) => Value::from(f),
        rmpv::Value::String(s) => Value::String(
            s.as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| String::from_utf8_lossy(s.as_bytes()).into_owned()),
        ),
        rmpv::Value::Binary(bytes) | rmpv::Value::Ext(_, bytes) => {
            Value::Array(bytes.into_iter().map(Value::from).collect())
        }
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(msgpack_to_json).collect()),
        rmpv::Value::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) if s.is_str() => {
                            s.into_str().unwrap_or_default()
                        }
                        other => other.to_string(),
                    };
                    (key, msgpack_to_json(v))
                })
                .collect(),
        ),
    }
}

/// JSON 编解码器
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn is_text(&self) -> bool {
        true
    }
}
