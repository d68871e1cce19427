/// 多路复用流式 RPC 模块
///
/// 在一条双工连接上并发执行多个调用，支持请求流、响应流和取消

pub mod call;
pub mod client;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod msgid;
mod pending;
pub mod stream;
pub mod transport;
pub mod types;

pub use call::{CallOptions, CancelHandle, RpcCall};
pub use client::{ClientConfig, RpcClient};
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use error::{RpcError, RpcErrorCode, RpcErrorKind};
pub use handshake::Session;
pub use message::{Frame, MessageType, MethodRef};
pub use msgid::MsgIdAllocator;
pub use stream::{OverflowPolicy, RpcStream};
pub use transport::{attach, connect};
pub use types::{method_name, MethodDescriptor, MethodIdEncoding, MethodRegistry};
