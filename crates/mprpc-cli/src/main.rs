/// mprpc - 命令行客户端
///
/// 用法：
/// - `mprpc`：列出服务端注册的方法
/// - `mprpc <method> [JSON 数组参数] [JSON 对象关键字参数]`：调用方法
///
/// 请求流方法的数据来自环境变量 `MPRPC_REQUEST_STREAM`（JSON 数组）。

use anyhow::Context;
use futures_util::StreamExt;
use mprpc::rpc::{connect, MethodDescriptor};
use mprpc::{CallOptions, RpcClient};
use serde_json::{Map, Value};
use tracing::{info, warn};

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    // 初始化日志
    // 可以通过环境变量 RUST_LOG 覆盖 LOG_LEVEL，例如：
    // RUST_LOG=mprpc=debug mprpc add '[1, 2]'
    tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    info!("🎯 连接到服务端: {} (codec={:?})", cfg.server_url, cfg.codec);
    let (client, task) = connect(&cfg.server_url, cfg.client_config(), cfg.codec.codec()).await?;

    let outcome = match args.first() {
        None => {
            print_methods(&client.methods().await);
            Ok(())
        }
        Some(method) => invoke(&client, method, &args[1..], cfg.request_stream.clone()).await,
    };

    task.abort();
    outcome
}

fn print_methods(methods: &[MethodDescriptor]) {
    for method in methods {
        let mut flags = Vec::new();
        if method.takes_request_stream {
            flags.push("request-stream");
        }
        if method.produces_response_stream {
            flags.push("response-stream");
        }

        if flags.is_empty() {
            println!("[{}] {}", method.numeric_id, method.signature);
        } else {
            println!("[{}] {}  ({})", method.numeric_id, method.signature, flags.join(", "));
        }
        if let Some(doc) = method.doc.as_deref().filter(|d| !d.is_empty()) {
            println!("    {}", doc);
        }
    }
}

async fn invoke(
    client: &RpcClient,
    method: &str,
    args: &[String],
    request_stream: Option<Vec<Value>>,
) -> anyhow::Result<()> {
    let params: Vec<Value> = match args.first() {
        Some(raw) => serde_json::from_str(raw).context("参数必须是 JSON 数组")?,
        None => Vec::new(),
    };
    let kwargs: Map<String, Value> = match args.get(1) {
        Some(raw) => serde_json::from_str(raw).context("关键字参数必须是 JSON 对象")?,
        None => Map::new(),
    };

    let mut options = CallOptions::new().kwargs(kwargs);
    if let Some(items) = request_stream {
        options = options.request_iter(items);
    }

    let call = client.rpc(method, params, options).await?;
    let cancel = call.cancel_handle();

    let printer = async {
        if let Ok(stream) = call.response_stream() {
            let mut chunks = Box::pin(stream.clone().into_stream());
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(value) => println!("{}", value),
                    Err(e) => warn!("响应流异常结束: {}", e),
                }
            }
        }
        call.await
    };

    let result = tokio::select! {
        result = printer => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 收到中断信号，取消调用");
            cancel.cancel().await;
            return Ok(());
        }
    };

    let value = result?;
    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
