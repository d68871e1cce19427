/// 配置管理

use anyhow::Context;
use mprpc::{ClientConfig, Codec, JsonCodec, MsgPackCodec};
use serde::Deserialize;
use serde_json::Value;

/// 线路编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    MsgPack,
    Json,
}

impl CodecKind {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" => Ok(Self::MsgPack),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("未知的编码: {}（可选 msgpack / json）", other),
        }
    }

    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            Self::MsgPack => Box::new(MsgPackCodec),
            Self::Json => Box::new(JsonCodec),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_url: String,
    pub codec: CodecKind,
    pub prefer_numeric: bool,
    /// 响应流容量；服务端分块总是强制写入，因此只影响调用方写入
    pub stream_capacity: usize,
    /// 是否发送握手请求，旧版服务端连接后直接推送方法表，需要关闭
    pub send_hello: bool,
    pub log_level: String,
    /// 请求流数据（JSON 数组）
    pub request_stream: Option<Vec<Value>>,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let server_url = lookup("MPRPC_SERVER_URL")
            .unwrap_or_else(|| "ws://localhost:8000".to_string());

        let codec = CodecKind::parse(
            &lookup("MPRPC_CODEC").unwrap_or_else(|| "msgpack".to_string()),
        )?;

        let prefer_numeric = lookup("MPRPC_PREFER_NUMERIC")
            .unwrap_or_else(|| "false".to_string())
            .parse()
            .context("MPRPC_PREFER_NUMERIC 必须是 true 或 false")?;

        let stream_capacity = lookup("MPRPC_STREAM_CAPACITY")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .context("MPRPC_STREAM_CAPACITY 必须是非负整数")?;

        let send_hello = lookup("MPRPC_SEND_HELLO")
            .unwrap_or_else(|| "true".to_string())
            .parse()
            .context("MPRPC_SEND_HELLO 必须是 true 或 false")?;

        let log_level = lookup("LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());

        let request_stream = lookup("MPRPC_REQUEST_STREAM")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("MPRPC_REQUEST_STREAM 必须是 JSON 数组")?;

        Ok(Self {
            server_url,
            codec,
            prefer_numeric,
            stream_capacity,
            send_hello,
            log_level,
            request_stream,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .prefer_numeric_method_id(self.prefer_numeric)
            .default_stream_capacity(self.stream_capacity)
            .send_hello(self.send_hello)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.server_url, "ws://localhost:8000");
        assert_eq!(cfg.codec, CodecKind::MsgPack);
        assert!(!cfg.prefer_numeric);
        assert_eq!(cfg.stream_capacity, 0);
        assert!(cfg.send_hello);
        assert!(cfg.client_config().send_hello);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.request_stream.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = load(&[
            ("MPRPC_SERVER_URL", "ws://10.0.0.2:9000/rpc"),
            ("MPRPC_CODEC", "JSON"),
            ("MPRPC_PREFER_NUMERIC", "true"),
            ("MPRPC_STREAM_CAPACITY", "16"),
            ("MPRPC_SEND_HELLO", "false"),
            ("MPRPC_REQUEST_STREAM", "[1, \"two\", {\"n\": 3}]"),
        ])
        .unwrap();
        assert_eq!(cfg.server_url, "ws://10.0.0.2:9000/rpc");
        assert_eq!(cfg.codec, CodecKind::Json);
        assert!(cfg.codec.codec().is_text());
        assert_eq!(
            cfg.request_stream,
            Some(vec![json!(1), json!("two"), json!({"n": 3})])
        );

        let client = cfg.client_config();
        assert!(client.prefer_numeric_method_id);
        assert_eq!(client.default_stream_capacity, 16);
        assert!(!client.send_hello);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("MPRPC_CODEC", "cbor")]).is_err());
        assert!(load(&[("MPRPC_STREAM_CAPACITY", "-1")]).is_err());
        assert!(load(&[("MPRPC_PREFER_NUMERIC", "yes")]).is_err());
        assert!(load(&[("MPRPC_SEND_HELLO", "no")]).is_err());
        assert!(load(&[("MPRPC_REQUEST_STREAM", "{\"a\": 1}")]).is_err());
    }
}
