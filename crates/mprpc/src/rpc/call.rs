/// 调用选项与调用句柄

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{Map, Value};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::client::RpcClient;
use super::pending::CallState;
use super::{RpcError, RpcStream};

/// 单次调用的选项
#[derive(Default)]
pub struct CallOptions {
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) request_stream: Option<BoxStream<'static, Value>>,
    pub(crate) response_stream: Option<RpcStream>,
    pub(crate) stream_capacity: Option<usize>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个关键字参数
    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    /// 请求流：任意异步产出值的 `Stream`
    pub fn request_stream<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        self.request_stream = Some(source.boxed());
        self
    }

    /// 请求流：同步可迭代对象
    pub fn request_iter<I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.request_stream(stream::iter(items))
    }

    /// 使用调用方提供的响应流（仅响应流式方法）
    pub fn response_stream(mut self, stream: RpcStream) -> Self {
        self.response_stream = Some(stream);
        self
    }

    /// 自动创建的响应流容量，0 表示不限
    ///
    /// 服务端推送的分块不受容量限制，只有调用方的非强制 `put` 会被丢弃。
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = Some(capacity);
        self
    }
}

/// 在途调用句柄
///
/// `await` 句柄（或调用 [`RpcCall::result`]）得到最终结果；响应流式调用的结果
/// 在流结束后为 `Value::Null`。丢弃句柄不会取消调用。
pub struct RpcCall {
    id: u32,
    method: String,
    result_rx: oneshot::Receiver<Result<Value, RpcError>>,
    state: Arc<CallState>,
    response_stream: Option<RpcStream>,
    client: RpcClient,
}

impl RpcCall {
    pub(crate) fn new(
        id: u32,
        method: String,
        result_rx: oneshot::Receiver<Result<Value, RpcError>>,
        state: Arc<CallState>,
        response_stream: Option<RpcStream>,
        client: RpcClient,
    ) -> Self {
        Self {
            id,
            method,
            result_rx,
            state,
            response_stream,
            client,
        }
    }

    /// 本次调用使用的 msgid
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// 调用是否已经结束（成功、失败、取消或连接关闭）
    pub fn is_done(&self) -> bool {
        self.state.is_concluded()
    }

    /// 响应流
    ///
    /// 非响应流式方法返回 `NotResponseStreaming`，已取消的调用返回 `Cancelled`。
    pub fn response_stream(&self) -> Result<&RpcStream, RpcError> {
        let stream = self
            .response_stream
            .as_ref()
            .ok_or_else(|| RpcError::not_response_streaming(&self.method))?;
        if self.is_cancelled() {
            return Err(RpcError::cancelled());
        }
        Ok(stream)
    }

    /// 取消调用，重复调用无副作用；返回本次是否真正取消了调用
    pub async fn cancel(&self) -> bool {
        self.client.cancel_call(self.id, &self.state).await
    }

    /// 可跨任务使用的取消句柄，例如由调用方实现超时
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            state: self.state.clone(),
            client: self.client.clone(),
        }
    }

    /// 等待最终结果
    pub async fn result(self) -> Result<Value, RpcError> {
        self.result_rx
            .await
            .unwrap_or_else(|_| Err(RpcError::connection_closed()))
    }
}

impl IntoFuture for RpcCall {
    type Output = Result<Value, RpcError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}

impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

/// 取消句柄
#[derive(Clone)]
pub struct CancelHandle {
    id: u32,
    state: Arc<CallState>,
    client: RpcClient,
}

impl CancelHandle {
    pub async fn cancel(&self) -> bool {
        self.client.cancel_call(self.id, &self.state).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}
