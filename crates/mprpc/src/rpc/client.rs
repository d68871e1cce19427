/// RPC 客户端
///
/// 在一条双工连接上复用多路并发调用。传输层只需要：
/// - 把 [`RpcClient::new`] 返回的接收端中的字节发出去
/// - 把收到的每一帧交给 [`RpcClient::handle_incoming`]
/// - 连接断开时调用 [`RpcClient::handle_close`]

use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::call::{CallOptions, RpcCall};
use super::codec::Codec;
use super::handshake::{self, Session};
use super::message::{Frame, MethodRef};
use super::pending::{CallState, DispatchTable, PendingCall};
use super::stream::{OverflowPolicy, RpcStream};
use super::types::MethodDescriptor;
use super::RpcError;

/// 握手结果等待器
type HandshakeWaiter = oneshot::Sender<Result<Arc<Session>, RpcError>>;

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 握手时上报的协议版本
    pub protocol_version: String,
    /// 服务端两种方法标识都接受时，是否使用数字 ID
    pub prefer_numeric_method_id: bool,
    /// 自动创建的响应流默认容量，0 表示不限
    ///
    /// 服务端推送的分块总是强制写入，容量和丢弃策略只约束调用方自己对该流的 `put`。
    pub default_stream_capacity: usize,
    /// 自动创建的响应流满时，调用方 `put` 的丢弃策略
    pub overflow_policy: OverflowPolicy,
    /// 是否主动发送握手请求（旧版服务端连接后直接推送方法表）
    pub send_hello: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: handshake::PROTOCOL_VERSION.to_string(),
            prefer_numeric_method_id: false,
            default_stream_capacity: 0,
            overflow_policy: OverflowPolicy::default(),
            send_hello: true,
        }
    }
}

impl ClientConfig {
    pub fn prefer_numeric_method_id(mut self, prefer: bool) -> Self {
        self.prefer_numeric_method_id = prefer;
        self
    }

    pub fn default_stream_capacity(mut self, capacity: usize) -> Self {
        self.default_stream_capacity = capacity;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn send_hello(mut self, send: bool) -> Self {
        self.send_hello = send;
        self
    }
}

/// 连接状态
enum HandshakeState {
    /// 等待握手应答，此时入站帧只会被当作握手应答解析
    Negotiating {
        hello_sent: bool,
        waiters: Vec<HandshakeWaiter>,
    },
    /// 握手完成，入站帧只会被当作 RPC 帧解析
    Established(Arc<Session>),
    /// 握手失败，连接不可用
    Failed(RpcError),
    Closed,
}

struct Inner {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: RwLock<HandshakeState>,
    table: Mutex<DispatchTable>,
}

/// RPC 客户端，克隆后共享同一条连接
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// 创建客户端，返回出站字节的接收端，由传输层负责发送
    pub fn new(
        config: ClientConfig,
        codec: impl Codec + 'static,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = Self {
            inner: Arc::new(Inner {
                config,
                codec: Arc::new(codec),
                outbound: tx,
                state: RwLock::new(HandshakeState::Negotiating {
                    hello_sent: false,
                    waiters: Vec::new(),
                }),
                table: Mutex::new(DispatchTable::default()),
            }),
        };

        (client, rx)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &dyn Codec {
        self.inner.codec.as_ref()
    }

    /// 执行握手并等待应答
    ///
    /// 已经建立时直接返回缓存的会话；握手失败后总是返回同一个 `HandshakeFailed` 错误。
    pub async fn handshake(&self) -> Result<Arc<Session>, RpcError> {
        let rx = {
            let mut state = self.inner.state.write().await;
            match &mut *state {
                HandshakeState::Established(session) => return Ok(session.clone()),
                HandshakeState::Failed(err) => return Err(err.clone()),
                HandshakeState::Closed => return Err(RpcError::connection_closed()),
                HandshakeState::Negotiating {
                    hello_sent,
                    waiters,
                } => {
                    if self.inner.config.send_hello && !*hello_sent {
                        let hello = handshake::hello(&self.inner.config.protocol_version);
                        self.send_value(&hello)?;
                        *hello_sent = true;
                        info!("🤝 已发送握手请求: ver={}", self.inner.config.protocol_version);
                    }
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };

        rx.await
            .unwrap_or_else(|_| Err(RpcError::connection_closed()))
    }

    /// 当前会话，握手完成前为 `None`
    pub async fn session(&self) -> Option<Arc<Session>> {
        match &*self.inner.state.read().await {
            HandshakeState::Established(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// 服务端注册的方法列表
    pub async fn methods(&self) -> Vec<MethodDescriptor> {
        match self.session().await {
            Some(session) => session.registry().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// 按名称查找方法描述
    pub async fn method(&self, name: &str) -> Option<MethodDescriptor> {
        self.session().await?.registry().get(name).cloned()
    }

    pub async fn is_established(&self) -> bool {
        self.session().await.is_some()
    }

    /// 当前在途调用数量
    pub async fn pending_count(&self) -> usize {
        self.inner.table.lock().await.len()
    }

    async fn established(&self) -> Result<Arc<Session>, RpcError> {
        match &*self.inner.state.read().await {
            HandshakeState::Established(session) => Ok(session.clone()),
            HandshakeState::Negotiating { .. } => Err(RpcError::not_established()),
            HandshakeState::Failed(err) => Err(err.clone()),
            HandshakeState::Closed => Err(RpcError::connection_closed()),
        }
    }

    /// 发起调用
    ///
    /// 参数校验失败（未知方法、流形态不符、方法仍在执行等）时立即返回错误，不发送任何帧。
    pub async fn rpc(
        &self,
        method: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<RpcCall, RpcError> {
        let session = self.established().await?;
        let descriptor = session
            .registry()
            .get(method)
            .ok_or_else(|| RpcError::unknown_method(method))?;

        let CallOptions {
            kwargs,
            request_stream,
            response_stream,
            stream_capacity,
        } = options;

        match (descriptor.takes_request_stream, request_stream.is_some()) {
            (true, false) => return Err(RpcError::request_stream_required(method)),
            (false, true) => return Err(RpcError::unexpected_request_stream(method)),
            _ => {}
        }

        let response_stream = if descriptor.produces_response_stream {
            Some(response_stream.unwrap_or_else(|| {
                RpcStream::with_policy(
                    stream_capacity.unwrap_or(self.inner.config.default_stream_capacity),
                    self.inner.config.overflow_policy,
                )
            }))
        } else if response_stream.is_some() {
            return Err(RpcError::not_response_streaming(method));
        } else {
            None
        };

        let method_ref = if session.use_numeric_method_id() {
            MethodRef::Id(descriptor.numeric_id)
        } else {
            MethodRef::Name(descriptor.name.clone())
        };

        let (result_tx, result_rx) = oneshot::channel();
        let state = Arc::new(CallState::default());

        let id = {
            let mut table = self.inner.table.lock().await;
            if table.is_closed() {
                return Err(RpcError::connection_closed());
            }

            let id = if session.msgid_eq_mthid() {
                // msgid 就是方法 ID，同一方法同一时刻只能有一个调用
                if table.contains(descriptor.numeric_id) {
                    return Err(RpcError::method_in_flight(method));
                }
                descriptor.numeric_id
            } else {
                table.allocate()?
            };

            table.insert(PendingCall::new(
                id,
                descriptor.name.clone(),
                result_tx,
                state.clone(),
                response_stream.clone(),
            ))?;

            let request = Frame::Request {
                id,
                method: method_ref,
                params,
                kwargs,
            };
            if let Err(e) = self.send_frame(&request) {
                table.remove(id);
                return Err(e);
            }
            id
        };

        debug!("📤 发送请求: method={}, id={}", method, id);

        if let Some(source) = request_stream {
            self.spawn_request_stream(id, state.clone(), source);
        }

        Ok(RpcCall::new(
            id,
            descriptor.name.clone(),
            result_rx,
            state,
            response_stream,
            self.clone(),
        ))
    }

    /// 发起调用并等待结果
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.rpc(method, params, CallOptions::default())
            .await?
            .result()
            .await
    }

    /// 发送通知（不跟踪 msgid，不等待响应）
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        let session = self.established().await?;
        let descriptor = session
            .registry()
            .get(method)
            .ok_or_else(|| RpcError::unknown_method(method))?;
        let method_ref = if session.use_numeric_method_id() {
            MethodRef::Id(descriptor.numeric_id)
        } else {
            MethodRef::Name(descriptor.name.clone())
        };
        self.send_frame(&Frame::Notify {
            method: method_ref,
            params,
        })
    }

    /// 在独立任务中发送请求流
    ///
    /// 每一帧都在持有调用表锁、确认 msgid 仍属于本次调用后发送，
    /// 调用结束后 msgid 可能已被新的调用复用。
    fn spawn_request_stream(
        &self,
        id: u32,
        state: Arc<CallState>,
        mut source: BoxStream<'static, Value>,
    ) {
        let client = self.clone();
        tokio::spawn(async move {
            let mut sent = 0usize;
            while let Some(value) = source.next().await {
                match client
                    .send_owned(id, &state, &Frame::RequestStreamChunk { id, value })
                    .await
                {
                    Ok(true) => sent += 1,
                    Ok(false) => {
                        debug!("调用已结束，停止发送请求流: id={}, sent={}", id, sent);
                        return;
                    }
                    Err(e) => {
                        warn!("发送请求流分块失败: id={}, error={}", id, e);
                        return;
                    }
                }
            }

            match client
                .send_owned(id, &state, &Frame::RequestStreamEnd { id })
                .await
            {
                Ok(true) => debug!("请求流发送完毕: id={}, chunks={}", id, sent),
                Ok(false) => debug!("调用已结束，不再发送请求流结束帧: id={}", id),
                Err(e) => warn!("发送请求流结束帧失败: id={}, error={}", id, e),
            }
        });
    }

    /// msgid 仍属于该调用时发送帧，返回是否已发送
    async fn send_owned(
        &self,
        id: u32,
        state: &Arc<CallState>,
        frame: &Frame,
    ) -> Result<bool, RpcError> {
        let table = self.inner.table.lock().await;
        if !table.owns(id, state) {
            return Ok(false);
        }
        self.send_frame(frame)?;
        Ok(true)
    }

    /// 取消调用
    ///
    /// 只有第一次取消生效：移除调用、以 `Cancelled` 完成并发送 REQUEST_CANCEL。
    /// 调用已经结束时什么也不做。
    pub(crate) async fn cancel_call(&self, id: u32, state: &Arc<CallState>) -> bool {
        let mut table = self.inner.table.lock().await;
        let call = match table.remove_owned(id, state) {
            Some(call) => call,
            None => return false,
        };

        info!("🛑 取消调用: method={}, id={}", call.method(), id);
        call.cancel();

        // 持锁发送，保证取消帧先于复用该 msgid 的新请求
        if let Err(e) = self.send_frame(&Frame::RequestCancel { id }) {
            warn!("发送取消帧失败: id={}, error={}", id, e);
        }
        true
    }

    /// 处理一帧入站数据
    ///
    /// 握手完成前只解析握手应答，之后只解析 RPC 帧。解码失败只记录日志，不影响其他调用。
    pub async fn handle_incoming(&self, bytes: &[u8]) {
        let value = match self.inner.codec.decode(bytes) {
            Ok(value) => value,
            Err(e) => {
                error!("解码入站帧失败: {}", e);
                return;
            }
        };

        {
            let mut state = self.inner.state.write().await;
            match &mut *state {
                HandshakeState::Negotiating { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = self.complete_handshake(value, waiters).await;
                    return;
                }
                HandshakeState::Established(_) => {}
                HandshakeState::Failed(_) => {
                    warn!("握手已失败，忽略入站帧");
                    return;
                }
                HandshakeState::Closed => {
                    debug!("连接已关闭，忽略入站帧");
                    return;
                }
            }
        }

        match Frame::from_value(value) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => error!("解析入站帧失败: {}", e),
        }
    }

    async fn complete_handshake(
        &self,
        reply: Value,
        waiters: Vec<HandshakeWaiter>,
    ) -> HandshakeState {
        match Session::negotiate(reply, self.inner.config.prefer_numeric_method_id) {
            Ok(session) => {
                let session = Arc::new(session);
                self.inner
                    .table
                    .lock()
                    .await
                    .configure(session.min_msgid(), session.max_msgid());
                info!(
                    "✅ 握手成功: methods={}, msgid=[{}, {}], msgid_eq_mthid={}, numeric_method_id={}",
                    session.registry().len(),
                    session.min_msgid(),
                    session.max_msgid(),
                    session.msgid_eq_mthid(),
                    session.use_numeric_method_id()
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(session.clone()));
                }
                HandshakeState::Established(session)
            }
            Err(err) => {
                error!("❌ 握手失败: {}", err);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                HandshakeState::Failed(err)
            }
        }
    }

    /// 按消息类型把帧路由到对应的调用
    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response { id, error, result } => {
                let call = self.inner.table.lock().await.remove(id);
                let Some(call) = call else {
                    debug!("忽略未知调用的响应: id={}", id);
                    return;
                };
                match error {
                    Some(err) => {
                        warn!("📥 收到错误响应: method={}, id={}, error={}", call.method(), id, err);
                        call.fail(RpcError::server(err));
                    }
                    None => {
                        debug!("📥 收到响应: method={}, id={}", call.method(), id);
                        call.succeed(result);
                    }
                }
            }
            Frame::ResponseStreamChunk { id, value } => {
                let table = self.inner.table.lock().await;
                match table.get(id) {
                    Some(call) => match call.response_stream() {
                        Some(stream) => {
                            stream.put(value, true);
                        }
                        None => warn!("非响应流式调用收到流数据: method={}, id={}", call.method(), id),
                    },
                    None => debug!("忽略未知调用的流数据: id={}", id),
                }
            }
            Frame::ResponseStreamEnd { id } => {
                let call = self.inner.table.lock().await.remove(id);
                match call {
                    Some(call) => {
                        debug!("📥 响应流结束: method={}, id={}", call.method(), id);
                        call.finish_stream();
                    }
                    None => debug!("忽略未知调用的流结束: id={}", id),
                }
            }
            Frame::ResponseCancel { id } => {
                debug!("服务端确认取消: id={}", id);
            }
            other => {
                warn!("客户端不处理 {:?} 帧，忽略", other.message_type());
            }
        }
    }

    /// 连接断开：所有在途调用以 `ConnectionClosed` 结束，响应流全部关闭
    ///
    /// 重复调用是安全的。
    pub async fn handle_close(&self) {
        {
            let mut state = self.inner.state.write().await;
            if let HandshakeState::Negotiating { waiters, .. } = &mut *state {
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(RpcError::connection_closed()));
                }
            }
            *state = HandshakeState::Closed;
        }

        let calls = self.inner.table.lock().await.close();
        if calls.is_empty() {
            return;
        }

        warn!("连接已关闭，清理 {} 个在途调用", calls.len());
        for call in calls {
            debug!("清理在途调用: method={}, id={}", call.method(), call.id());
            call.abort(RpcError::connection_closed());
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), RpcError> {
        self.send_value(&frame.to_value())
    }

    fn send_value(&self, value: &Value) -> Result<(), RpcError> {
        let bytes = self.inner.codec.encode(value)?;
        self.inner
            .outbound
            .send(bytes)
            .map_err(|_| RpcError::connection_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::JsonCodec;
    use crate::rpc::RpcErrorCode;
    use futures_util::stream;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    /// 模拟传输：出站帧从接收端读取，入站帧直接喂给客户端
    struct MockTransport {
        client: RpcClient,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl MockTransport {
        fn new(config: ClientConfig) -> Self {
            let (client, outbound) = RpcClient::new(config, JsonCodec);
            Self { client, outbound }
        }

        async fn feed(&self, frame: Value) {
            let bytes = serde_json::to_vec(&frame).unwrap();
            self.client.handle_incoming(&bytes).await;
        }

        fn sent(&mut self) -> Option<Value> {
            self.outbound
                .try_recv()
                .ok()
                .map(|bytes| serde_json::from_slice(&bytes).unwrap())
        }

        async fn next_sent(&mut self) -> Value {
            let bytes = tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        async fn establish(&mut self, reply: Value) -> Arc<Session> {
            let client = self.client.clone();
            let handshake = tokio::spawn(async move { client.handshake().await });
            assert_eq!(self.next_sent().await, json!({"ver": "2.0.0"}));
            self.feed(reply).await;
            handshake.await.unwrap().unwrap()
        }
    }

    fn registry_reply() -> Value {
        json!({
            "methods": [
                ["add(a, b)", 0, false, false],
                ["tail(path)", 1, false, true],
                ["sum(*, request_stream)", 2, true, false],
                ["uppercase(*, request_stream)", 3, true, true],
                ["delay_echo(delay, echo)", 4, false, false],
            ]
        })
    }

    async fn established() -> MockTransport {
        let mut mock = MockTransport::new(ClientConfig::default());
        mock.establish(registry_reply()).await;
        mock
    }

    #[tokio::test]
    async fn test_simple_round_trip() {
        let mut mock = established().await;

        let call = mock
            .client
            .rpc("add", vec![json!(2), json!(3)], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();
        assert_eq!(mock.sent(), Some(json!([2, id, "add", [2, 3]])));

        mock.feed(json!([3, id, null, 5])).await;
        assert_eq!(call.await, Ok(json!(5)));
        assert_eq!(mock.client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_kwargs_are_sent_only_when_present() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc(
                "delay_echo",
                vec![],
                CallOptions::new().kwarg("delay", json!(0.1)).kwarg("echo", json!("hi")),
            )
            .await
            .unwrap();
        let id = call.id();
        assert_eq!(
            mock.sent(),
            Some(json!([2, id, "delay_echo", [], {"delay": 0.1, "echo": "hi"}]))
        );
    }

    #[tokio::test]
    async fn test_response_stream() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("tail", vec![json!("/var/log")], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();
        assert_eq!(mock.sent(), Some(json!([2, id, "tail", ["/var/log"]])));

        mock.feed(json!([5, id, "x"])).await;
        mock.feed(json!([5, id, "y"])).await;
        mock.feed(json!([7, id])).await;

        let stream = call.response_stream().unwrap().clone();
        assert_eq!(stream.next().await, Some(Ok(json!("x"))));
        assert_eq!(stream.next().await, Some(Ok(json!("y"))));
        assert_eq!(stream.next().await, None);
        assert_eq!(call.await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_server_error_reaches_future_and_stream() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("tail", vec![], CallOptions::new().stream_capacity(1))
            .await
            .unwrap();
        let id = call.id();
        mock.sent();

        mock.feed(json!([5, id, "x"])).await;
        mock.feed(json!([3, id, "file not found", null])).await;

        let stream = call.response_stream().unwrap().clone();
        assert_eq!(stream.next().await, Some(Ok(json!("x"))));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ServerError);
        assert_eq!(stream.next().await, None);

        let err = call.await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ServerError);
        assert_eq!(err.message, "file not found");
    }

    #[tokio::test]
    async fn test_unknown_method_sends_nothing() {
        let mut mock = established().await;
        let err = mock
            .client
            .rpc("nope", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::UnknownMethod);
        assert_eq!(mock.sent(), None);
    }

    #[tokio::test]
    async fn test_request_stream_shape_is_validated() {
        let mut mock = established().await;

        let err = mock
            .client
            .rpc("sum", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::RequestStreamRequired);

        let err = mock
            .client
            .rpc("add", vec![], CallOptions::new().request_iter(vec![json!(1)]))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::UnexpectedRequestStream);

        let err = mock
            .client
            .rpc("add", vec![], CallOptions::new().response_stream(RpcStream::unbounded()))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotResponseStreaming);

        assert_eq!(mock.sent(), None);
    }

    #[tokio::test]
    async fn test_request_stream_is_drained_in_order() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc(
                "sum",
                vec![],
                CallOptions::new().request_iter(vec![json!(0), json!(1), json!(2)]),
            )
            .await
            .unwrap();
        let id = call.id();

        assert_eq!(mock.next_sent().await, json!([2, id, "sum", []]));
        assert_eq!(mock.next_sent().await, json!([4, id, 0]));
        assert_eq!(mock.next_sent().await, json!([4, id, 1]));
        assert_eq!(mock.next_sent().await, json!([4, id, 2]));
        assert_eq!(mock.next_sent().await, json!([6, id]));

        mock.feed(json!([3, id, null, 3])).await;
        assert_eq!(call.await, Ok(json!(3)));
    }

    #[tokio::test]
    async fn test_bidirectional_stream_with_rpc_stream_source() {
        let mut mock = established().await;
        let source = RpcStream::unbounded();
        let call = mock
            .client
            .rpc(
                "uppercase",
                vec![],
                CallOptions::new().request_stream(source.clone().into_values()),
            )
            .await
            .unwrap();
        let id = call.id();
        assert_eq!(mock.next_sent().await, json!([2, id, "uppercase", []]));

        // 请求流由调用方逐步产出，rpc() 不会被阻塞
        source.put(json!("hello"), false);
        assert_eq!(mock.next_sent().await, json!([4, id, "hello"]));
        mock.feed(json!([5, id, "HELLO"])).await;

        source.put(json!("rpc"), false);
        source.force_close();
        assert_eq!(mock.next_sent().await, json!([4, id, "rpc"]));
        assert_eq!(mock.next_sent().await, json!([6, id]));
        mock.feed(json!([5, id, "RPC"])).await;
        mock.feed(json!([7, id])).await;

        let values: Vec<_> = call
            .response_stream()
            .unwrap()
            .clone()
            .into_stream()
            .collect()
            .await;
        assert_eq!(values, vec![Ok(json!("HELLO")), Ok(json!("RPC"))]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("tail", vec![], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();
        mock.sent();

        assert!(call.cancel().await);
        assert!(!call.cancel().await);
        assert!(call.is_cancelled());

        assert_eq!(mock.sent(), Some(json!([8, id])));
        assert_eq!(mock.sent(), None);

        assert_eq!(
            call.response_stream().unwrap_err().code,
            RpcErrorCode::Cancelled
        );

        // 取消后到达的帧被忽略
        mock.feed(json!([5, id, "late"])).await;
        mock.feed(json!([9, id])).await;

        let err = call.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_handle_from_another_task() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("delay_echo", vec![json!(1), json!("echo")], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();
        mock.sent();

        let handle = call.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel().await;
        });

        let err = call.await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Cancelled);
        assert_eq!(mock.next_sent().await, json!([8, id]));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_sends_nothing() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("add", vec![json!(1), json!(1)], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();
        mock.sent();
        mock.feed(json!([3, id, null, 2])).await;

        assert!(!call.cancel().await);
        assert_eq!(mock.sent(), None);
        assert_eq!(call.await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_cancel_stops_request_stream() {
        let mut mock = established().await;
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        let source = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        let call = mock
            .client
            .rpc("sum", vec![], CallOptions::new().request_stream(source))
            .await
            .unwrap();
        let id = call.id();
        assert_eq!(mock.next_sent().await, json!([2, id, "sum", []]));

        tx.send(json!(1)).unwrap();
        assert_eq!(mock.next_sent().await, json!([4, id, 1]));

        call.cancel().await;
        assert_eq!(mock.next_sent().await, json!([8, id]));

        tx.send(json!(2)).unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.sent(), None);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_distinct_ids() {
        let mut mock = MockTransport::new(ClientConfig::default());
        let mut reply = registry_reply();
        reply["min_msgid"] = json!(1);
        reply["max_msgid"] = json!(8);
        mock.establish(reply).await;

        let mut calls = Vec::new();
        for _ in 0..8 {
            calls.push(
                mock.client
                    .rpc("add", vec![], CallOptions::default())
                    .await
                    .unwrap(),
            );
        }
        let ids: HashSet<u32> = calls.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 8);

        // 空间已满
        let err = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::MsgIdExhausted);

        // 完成一个后它的 ID 才可以被复用
        let done = calls.remove(3);
        let freed = done.id();
        mock.feed(json!([3, freed, null, 0])).await;
        assert_eq!(done.await, Ok(json!(0)));

        let next = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(next.id(), freed);
    }

    #[tokio::test]
    async fn test_msgid_eq_mthid() {
        let mut mock = MockTransport::new(ClientConfig::default());
        let mut reply = registry_reply();
        reply["msgid_eq_mthid"] = json!(true);
        mock.establish(reply).await;

        let call = mock
            .client
            .rpc("delay_echo", vec![json!(1), json!("a")], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(call.id(), 4);
        assert_eq!(mock.sent(), Some(json!([2, 4, 4, [1, "a"]])));

        let err = mock
            .client
            .rpc("delay_echo", vec![json!(1), json!("b")], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::MethodInFlight);
        assert_eq!(mock.sent(), None);

        // 其他方法不受影响
        let other = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(other.id(), 0);

        mock.feed(json!([3, 4, null, "a"])).await;
        assert_eq!(call.await, Ok(json!("a")));
        assert!(mock
            .client
            .rpc("delay_echo", vec![], CallOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_numeric_method_id_preference() {
        let mut mock = MockTransport::new(ClientConfig::default().prefer_numeric_method_id(true));
        let mut reply = registry_reply();
        reply["method_id_encoding"] = json!(3);
        mock.establish(reply).await;

        let call = mock
            .client
            .rpc("tail", vec![], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(mock.sent(), Some(json!([2, call.id(), 1, []])));
    }

    #[tokio::test]
    async fn test_connection_close_fails_all_pending() {
        let mut mock = established().await;
        let simple = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap();
        let streaming = mock
            .client
            .rpc("tail", vec![], CallOptions::default())
            .await
            .unwrap();
        let stream = streaming.response_stream().unwrap().clone();

        mock.client.handle_close().await;
        mock.client.handle_close().await;

        assert_eq!(simple.await.unwrap_err().code, RpcErrorCode::ConnectionClosed);
        assert_eq!(streaming.await.unwrap_err().code, RpcErrorCode::ConnectionClosed);
        assert!(stream.is_closed());
        assert_eq!(
            stream.next().await.unwrap().unwrap_err().code,
            RpcErrorCode::ConnectionClosed
        );
        assert_eq!(mock.client.pending_count().await, 0);

        let err = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_isolated() {
        let mut mock = established().await;
        let call = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap();
        let id = call.id();

        mock.client.handle_incoming(b"not json").await;
        mock.feed(json!(["garbage"])).await;
        mock.feed(json!([3, 999, null, 1])).await;
        mock.feed(json!([3, id, null, "ok"])).await;

        assert_eq!(call.await, Ok(json!("ok")));
        assert!(mock.sent().is_some());
    }

    #[tokio::test]
    async fn test_rpc_before_handshake() {
        let mock = MockTransport::new(ClientConfig::default());
        let err = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotEstablished);
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let mut mock = MockTransport::new(ClientConfig::default());
        let client = mock.client.clone();
        let handshake = tokio::spawn(async move { client.handshake().await });
        mock.next_sent().await;
        mock.feed(json!({"error": "unsupported version"})).await;

        let err = handshake.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::HandshakeFailed);

        // 连接不可用，之后的帧也不会被当作 RPC 帧
        mock.feed(json!([3, 1, null, 1])).await;
        let err = mock.client.handshake().await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::HandshakeFailed);
        let err = mock
            .client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_unprompted_legacy_registry() {
        let mock = MockTransport::new(ClientConfig::default().send_hello(false));
        mock.feed(json!([["div(a: float, b: float) -> float", "Return a divided by b", false, false]]))
            .await;

        let session = mock.client.handshake().await.unwrap();
        assert_eq!(session.registry().get("div").unwrap().numeric_id, 0);
        assert_eq!(mock.client.methods().await.len(), 1);
        let div = mock.client.method("div").await.unwrap();
        assert_eq!(div.doc.as_deref(), Some("Return a divided by b"));
        assert!(mock.client.method("mul").await.is_none());
    }

    #[tokio::test]
    async fn test_close_during_handshake() {
        let mut mock = MockTransport::new(ClientConfig::default());
        let client = mock.client.clone();
        let handshake = tokio::spawn(async move { client.handshake().await });
        mock.next_sent().await;
        mock.client.handle_close().await;

        let err = handshake.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_notify_is_untracked() {
        let mut mock = established().await;
        mock.client.notify("add", vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(mock.sent(), Some(json!([1, "add", [1, 2]])));
        assert_eq!(mock.client.pending_count().await, 0);

        let err = mock.client.notify("nope", vec![]).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn test_msgpack_binary_result_resolves_call() {
        use crate::rpc::codec::MsgPackCodec;

        let (client, mut outbound) = RpcClient::new(ClientConfig::default(), MsgPackCodec);
        let handshake = tokio::spawn({
            let client = client.clone();
            async move { client.handshake().await }
        });
        outbound.recv().await.unwrap();
        let reply = rmp_serde::to_vec_named(&registry_reply()).unwrap();
        client.handle_incoming(&reply).await;
        handshake.await.unwrap().unwrap();

        let call = client
            .rpc("add", vec![], CallOptions::default())
            .await
            .unwrap();
        let id = u8::try_from(call.id()).unwrap();
        assert!(id < 0x80);

        // [3, id, nil, bin8(01 02 03)]
        client
            .handle_incoming(&[0x94, 0x03, id, 0xc0, 0xc4, 0x03, 0x01, 0x02, 0x03])
            .await;
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap();
        assert_eq!(result, Ok(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_request_stream_stops_when_msgid_is_reused() {
        let mut mock = MockTransport::new(ClientConfig::default());
        let mut reply = registry_reply();
        reply["msgid_eq_mthid"] = json!(true);
        mock.establish(reply).await;

        let (old_tx, old_rx) = mpsc::unbounded_channel::<Value>();
        let old_source =
            stream::unfold(old_rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        let first = mock
            .client
            .rpc("sum", vec![], CallOptions::new().request_stream(old_source))
            .await
            .unwrap();
        assert_eq!(mock.next_sent().await, json!([2, 2, 2, []]));

        // 服务端提前响应，msgid 2 立刻被同一方法的新调用复用
        mock.feed(json!([3, 2, null, 0])).await;
        assert_eq!(first.await, Ok(json!(0)));

        let (new_tx, new_rx) = mpsc::unbounded_channel::<Value>();
        let new_source =
            stream::unfold(new_rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        let second = mock
            .client
            .rpc("sum", vec![], CallOptions::new().request_stream(new_source))
            .await
            .unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(mock.next_sent().await, json!([2, 2, 2, []]));

        // 旧请求流的数据和结束帧都不能以 msgid 2 发出
        old_tx.send(json!("stale")).unwrap();
        drop(old_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.sent(), None);

        new_tx.send(json!(5)).unwrap();
        assert_eq!(mock.next_sent().await, json!([4, 2, 5]));
    }
}
