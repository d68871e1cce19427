/// 方法注册表相关类型
///
/// 注册表由握手应答下发，建立后不再变化。

use serde_json::Value;
use std::collections::HashMap;

use super::RpcError;

/// 方法标识在线路上的编码方式（服务端偏好）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodIdEncoding {
    /// 只接受方法名
    #[default]
    String = 1,
    /// 只接受数字 ID
    Numeric = 2,
    /// 两者皆可
    Either = 3,
}

impl MethodIdEncoding {
    /// 解析握手中的编码字段，兼容数字 (1/2/3) 和字符串两种写法
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_u64()? {
                1 => Some(Self::String),
                2 => Some(Self::Numeric),
                3 => Some(Self::Either),
                _ => None,
            },
            Value::String(s) => match s.to_ascii_uppercase().as_str() {
                "STR" | "STRING" => Some(Self::String),
                "NUM" | "NUMERIC" => Some(Self::Numeric),
                "STR_NUM" | "EITHER" => Some(Self::Either),
                _ => None,
            },
            _ => None,
        }
    }
}

/// 方法描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub numeric_id: u32,
    /// 服务端给出的完整签名，例如 `div(a: float, b: float) -> float`
    pub signature: String,
    pub doc: Option<String>,
    pub takes_request_stream: bool,
    pub produces_response_stream: bool,
}

impl MethodDescriptor {
    /// 从 `[signature, numeric_id | docstring, req_stream, resp_stream]` 解析
    ///
    /// 旧版服务端第二项是文档字符串，此时数字 ID 取列表中的位置。
    pub fn from_value(value: &Value, index: usize) -> Result<Self, RpcError> {
        let items = value.as_array().ok_or_else(|| {
            RpcError::handshake_failed(format!("方法描述必须是数组: {}", value))
        })?;
        if items.len() < 4 {
            return Err(RpcError::handshake_failed(format!(
                "方法描述字段不足: {}",
                value
            )));
        }

        let signature = items[0]
            .as_str()
            .ok_or_else(|| RpcError::handshake_failed(format!("无效的方法签名: {}", items[0])))?
            .to_string();

        let (numeric_id, doc) = match &items[1] {
            Value::Number(n) => {
                let id = n
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| RpcError::handshake_failed(format!("无效的方法 ID: {}", n)))?;
                (id, None)
            }
            Value::String(doc) => (position_id(index)?, Some(doc.clone()).filter(|d| !d.is_empty())),
            Value::Null => (position_id(index)?, None),
            other => {
                return Err(RpcError::handshake_failed(format!(
                    "无效的方法 ID: {}",
                    other
                )))
            }
        };

        Ok(Self {
            name: method_name(&signature),
            numeric_id,
            signature,
            doc,
            takes_request_stream: read_flag(&items[2]),
            produces_response_stream: read_flag(&items[3]),
        })
    }
}

fn position_id(index: usize) -> Result<u32, RpcError> {
    u32::try_from(index).map_err(|_| RpcError::handshake_failed("方法数量超出范围"))
}

fn read_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().is_some_and(|v| v != 0),
        _ => false,
    }
}

/// 从签名中提取方法名：取第一个 `(` 之前的最后一个单词
pub fn method_name(signature: &str) -> String {
    let head = match signature.find('(') {
        Some(pos) => &signature[..pos],
        None => signature,
    };
    head.split_whitespace().last().unwrap_or("").to_string()
}

/// 方法注册表
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: Vec<MethodDescriptor>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

impl MethodRegistry {
    /// 构建注册表，方法名和数字 ID 都必须唯一
    pub fn new(methods: Vec<MethodDescriptor>) -> Result<Self, RpcError> {
        let mut by_name = HashMap::with_capacity(methods.len());
        let mut by_id = HashMap::with_capacity(methods.len());

        for (index, method) in methods.iter().enumerate() {
            if method.name.is_empty() {
                return Err(RpcError::handshake_failed(format!(
                    "无法从签名解析方法名: {}",
                    method.signature
                )));
            }
            if by_name.insert(method.name.clone(), index).is_some() {
                return Err(RpcError::handshake_failed(format!(
                    "方法名重复: {}",
                    method.name
                )));
            }
            if by_id.insert(method.numeric_id, index).is_some() {
                return Err(RpcError::handshake_failed(format!(
                    "方法 ID 重复: {}",
                    method.numeric_id
                )));
            }
        }

        Ok(Self {
            methods,
            by_name,
            by_id,
        })
    }

    /// 从握手应答中的方法列表解析
    pub fn from_values(values: &[Value]) -> Result<Self, RpcError> {
        let methods = values
            .iter()
            .enumerate()
            .map(|(index, v)| MethodDescriptor::from_value(v, index))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(methods)
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).map(|&i| &self.methods[i])
    }

    pub fn get_by_id(&self, numeric_id: u32) -> Option<&MethodDescriptor> {
        self.by_id.get(&numeric_id).map(|&i| &self.methods[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.iter()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
