/// 待处理调用表
///
/// 调用在途期间由 [`DispatchTable`] 独占持有，并且只会被移除一次：
/// 响应、流结束、取消或连接关闭，谁先到谁移除。

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::msgid::MsgIdAllocator;
use super::{RpcError, RpcStream};

/// 调用结果发送端
pub(crate) type ResultSender = oneshot::Sender<Result<Value, RpcError>>;

/// 调用句柄、请求流发送任务和调用表共享的状态标记
#[derive(Debug, Default)]
pub(crate) struct CallState {
    cancelled: AtomicBool,
    concluded: AtomicBool,
}

impl CallState {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 调用已经以任意方式结束
    pub fn is_concluded(&self) -> bool {
        self.concluded.load(Ordering::Acquire)
    }
}

/// 一个在途调用
pub(crate) struct PendingCall {
    id: u32,
    method: String,
    result_tx: ResultSender,
    state: Arc<CallState>,
    response_stream: Option<RpcStream>,
}

impl PendingCall {
    pub fn new(
        id: u32,
        method: impl Into<String>,
        result_tx: ResultSender,
        state: Arc<CallState>,
        response_stream: Option<RpcStream>,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            result_tx,
            state,
            response_stream,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn response_stream(&self) -> Option<&RpcStream> {
        self.response_stream.as_ref()
    }

    /// 以结果值完成
    pub fn succeed(self, value: Value) {
        self.state.concluded.store(true, Ordering::Release);
        let _ = self.result_tx.send(Ok(value));
    }

    /// 以错误完成，错误同时强制写入响应流
    pub fn fail(self, err: RpcError) {
        self.state.concluded.store(true, Ordering::Release);
        if let Some(stream) = &self.response_stream {
            stream.force_put_error(err.clone());
        }
        let _ = self.result_tx.send(Err(err));
    }

    /// 响应流正常结束：关闭流，结果为空值
    pub fn finish_stream(self) {
        self.state.concluded.store(true, Ordering::Release);
        if let Some(stream) = &self.response_stream {
            stream.force_close();
        }
        let _ = self.result_tx.send(Ok(Value::Null));
    }

    /// 本地取消
    pub fn cancel(self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.fail(RpcError::cancelled());
    }

    /// 连接断开：以错误完成并关闭响应流
    pub fn abort(self, err: RpcError) {
        let stream = self.response_stream.clone();
        self.fail(err);
        if let Some(stream) = stream {
            stream.force_close();
        }
    }
}

/// 调用表：msgid -> 在途调用，同时持有 ID 分配器
#[derive(Default)]
pub(crate) struct DispatchTable {
    calls: HashMap<u32, PendingCall>,
    ids: MsgIdAllocator,
    closed: bool,
}

impl DispatchTable {
    /// 握手完成后按协商的范围重置分配器
    pub fn configure(&mut self, min: u32, max: u32) {
        self.ids = MsgIdAllocator::new(min, max);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contains(&self, id: u32) -> bool {
        self.calls.contains_key(&id)
    }

    /// 分配一个当前未被占用的 msgid
    pub fn allocate(&mut self) -> Result<u32, RpcError> {
        let calls = &self.calls;
        self.ids.allocate(|id| calls.contains_key(&id))
    }

    pub fn insert(&mut self, call: PendingCall) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::connection_closed());
        }
        self.calls.insert(call.id, call);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&PendingCall> {
        self.calls.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// msgid 当前是否属于这次调用
    pub fn owns(&self, id: u32, state: &Arc<CallState>) -> bool {
        self.calls
            .get(&id)
            .is_some_and(|call| Arc::ptr_eq(&call.state, state))
    }

    /// 仅当 msgid 仍属于同一次调用时才移除
    ///
    /// msgid 会被复用，旧句柄不能误删后来分配到同一 ID 的调用。
    pub fn remove_owned(&mut self, id: u32, state: &Arc<CallState>) -> Option<PendingCall> {
        match self.calls.get(&id) {
            Some(call) if Arc::ptr_eq(&call.state, state) => self.calls.remove(&id),
            _ => None,
        }
    }

    /// 关闭调用表并取出所有在途调用
    pub fn close(&mut self) -> Vec<PendingCall> {
        self.closed = true;
        self.calls.drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
