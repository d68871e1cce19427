/// 握手协商
///
/// 连接建立后客户端发送 `{ver}`，服务端回复方法注册表、消息 ID 范围和
/// 方法标识编码偏好。协商结果一次性计算并缓存在 [`Session`] 中。

use serde::Deserialize;
use serde_json::{json, Value};

use super::types::{MethodIdEncoding, MethodRegistry};
use super::RpcError;

/// 协议版本
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// 默认消息 ID 范围
pub const DEFAULT_MIN_MSGID: u32 = 1;
pub const DEFAULT_MAX_MSGID: u32 = (1 << 16) - 1;

/// 构建握手请求
pub fn hello(protocol_version: &str) -> Value {
    json!({ "ver": protocol_version })
}

/// 握手应答（对象形式）
#[derive(Debug, Deserialize)]
struct HandshakeReply {
    #[serde(default, alias = "err")]
    error: Option<Value>,
    #[serde(default)]
    min_msgid: Option<u32>,
    #[serde(default)]
    max_msgid: Option<u32>,
    #[serde(default)]
    msgid_eq_mthid: Option<bool>,
    #[serde(default, alias = "mthid_t")]
    method_id_encoding: Option<Value>,
    #[serde(default, alias = "rpc_defs")]
    methods: Option<Vec<Value>>,
}

/// 已建立的会话参数
#[derive(Debug, Clone)]
pub struct Session {
    registry: MethodRegistry,
    min_msgid: u32,
    max_msgid: u32,
    msgid_eq_mthid: bool,
    method_id_encoding: MethodIdEncoding,
    use_numeric_method_id: bool,
}

impl Session {
    /// 解析握手应答
    ///
    /// 兼容旧版服务端：应答直接是方法描述数组时，使用默认 ID 范围和字符串方法名。
    pub fn negotiate(reply: Value, prefer_numeric: bool) -> Result<Self, RpcError> {
        let reply = match reply {
            Value::Array(methods) => {
                let registry = MethodRegistry::from_values(&methods)?;
                return Ok(Self::with_registry(registry));
            }
            Value::Object(_) => serde_json::from_value::<HandshakeReply>(reply)
                .map_err(|e| RpcError::handshake_failed(format!("无效的握手应答: {}", e)))?,
            other => {
                return Err(RpcError::handshake_failed(format!(
                    "无效的握手应答: {}",
                    other
                )))
            }
        };

        if let Some(err) = reply.error.filter(|e| !e.is_null()) {
            let message = match err {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(RpcError::handshake_failed(message));
        }

        let methods = reply
            .methods
            .ok_or_else(|| RpcError::handshake_failed("握手应答缺少方法列表"))?;
        let registry = MethodRegistry::from_values(&methods)?;

        let min_msgid = reply.min_msgid.unwrap_or(DEFAULT_MIN_MSGID);
        let max_msgid = reply.max_msgid.unwrap_or(DEFAULT_MAX_MSGID);
        if min_msgid > max_msgid {
            return Err(RpcError::handshake_failed(format!(
                "无效的消息 ID 范围: [{}, {}]",
                min_msgid, max_msgid
            )));
        }

        let method_id_encoding = match reply.method_id_encoding {
            None | Some(Value::Null) => MethodIdEncoding::default(),
            Some(v) => MethodIdEncoding::from_value(&v).ok_or_else(|| {
                RpcError::handshake_failed(format!("未知的方法标识编码: {}", v))
            })?,
        };
        let msgid_eq_mthid = reply.msgid_eq_mthid.unwrap_or(false);

        // msgid 等于方法 ID 时，线路上必须使用数字方法标识
        let use_numeric_method_id = msgid_eq_mthid
            || method_id_encoding == MethodIdEncoding::Numeric
            || (prefer_numeric && method_id_encoding == MethodIdEncoding::Either);

        Ok(Self {
            registry,
            min_msgid,
            max_msgid,
            msgid_eq_mthid,
            method_id_encoding,
            use_numeric_method_id,
        })
    }

    fn with_registry(registry: MethodRegistry) -> Self {
        Self {
            registry,
            min_msgid: DEFAULT_MIN_MSGID,
            max_msgid: DEFAULT_MAX_MSGID,
            msgid_eq_mthid: false,
            method_id_encoding: MethodIdEncoding::String,
            use_numeric_method_id: false,
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn min_msgid(&self) -> u32 {
        self.min_msgid
    }

    pub fn max_msgid(&self) -> u32 {
        self.max_msgid
    }

    pub fn msgid_eq_mthid(&self) -> bool {
        self.msgid_eq_mthid
    }

    pub fn method_id_encoding(&self) -> MethodIdEncoding {
        self.method_id_encoding
    }

    pub fn use_numeric_method_id(&self) -> bool {
        self.use_numeric_method_id
    }
}
