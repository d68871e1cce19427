/// mprpc - 多路复用流式 RPC 客户端
///
/// 通过一条持久的双工连接（通常是 WebSocket）调用远端注册的方法。
/// 握手获取方法表后，可以并发发起普通调用、请求流调用、响应流调用和双向流调用，
/// 并随时取消任意一个调用。

pub mod errors;
pub mod rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use rpc::{
    CallOptions, CancelHandle, ClientConfig, Codec, JsonCodec, MsgPackCodec, OverflowPolicy,
    RpcCall, RpcClient, RpcError, RpcErrorCode, RpcErrorKind, RpcStream,
};
