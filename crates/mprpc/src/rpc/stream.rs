/// 有界流
///
/// 单消费者、可关闭、容量有限的队列。请求流（调用方 → 服务端）和
/// 响应流（服务端 → 调用方）都用它承载分块数据。

use futures_util::stream::{self, Stream};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

use super::RpcError;

/// 队列中的元素。`End` 是流结束哨兵，不会暴露给消费者。
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamItem {
    Value(Value),
    Error(RpcError),
    End,
}

/// 非强制 put 遇到容量上限时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// 丢弃新值（默认）
    #[default]
    DropNewest,
    /// 丢弃最旧的缓冲值，为新值腾出位置
    DropOldest,
}

struct StreamState {
    buffer: VecDeque<StreamItem>,
    closed: bool,
    /// 消费者已读到结束哨兵或错误
    finished: bool,
}

struct Shared {
    state: Mutex<StreamState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

/// RPC 流
///
/// 克隆得到的是同一条流的另一个句柄。同一时刻只允许一个消费者读取。
#[derive(Clone)]
pub struct RpcStream {
    shared: Arc<Shared>,
}

impl RpcStream {
    /// 创建流，`capacity` 为 0 表示不限容量
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::default())
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState {
                    buffer: VecDeque::new(),
                    closed: false,
                    finished: false,
                }),
                notify: Notify::new(),
                capacity,
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 当前缓冲的元素个数（包括尚未读取的结束哨兵）
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 放入一个值
    ///
    /// 流已关闭时什么也不做。非强制写入且缓冲已满时按 [`OverflowPolicy`] 丢弃数据，
    /// 返回值表示新值是否被接收。`force` 为 true 时无视容量。
    pub fn put(&self, value: Value, force: bool) -> bool {
        self.put_item(StreamItem::Value(value), force)
    }

    /// 强制放入一个错误，消费者迭代到这里时会得到该错误
    pub(crate) fn force_put_error(&self, err: RpcError) {
        self.put_item(StreamItem::Error(err), true);
    }

    /// 强制写入结束哨兵并关闭，之后的 put 都是空操作
    pub fn force_close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.buffer.push_back(StreamItem::End);
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
    }

    pub(crate) fn put_item(&self, item: StreamItem, force: bool) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        let capacity = self.shared.capacity;
        if !force && capacity > 0 && state.buffer.len() >= capacity {
            match self.shared.policy {
                OverflowPolicy::DropNewest => {
                    warn!("流已满 (capacity={})，丢弃新值", capacity);
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    warn!("流已满 (capacity={})，丢弃最旧的值", capacity);
                    state.buffer.pop_front();
                }
            }
        }

        state.buffer.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
        true
    }

    /// 取出下一个元素，队列为空时挂起
    pub(crate) async fn get(&self) -> StreamItem {
        loop {
            let notified = self.shared.notify.notified();
            let item = self.lock().buffer.pop_front();
            if let Some(item) = item {
                return item;
            }
            notified.await;
        }
    }

    /// 迭代一步
    ///
    /// 返回 `Some(Ok(v))` 表示一个数据值；`Some(Err(e))` 表示流以错误结束；
    /// `None` 表示流已正常结束。错误或结束之后总是返回 `None`。
    pub async fn next(&self) -> Option<Result<Value, RpcError>> {
        if self.lock().finished {
            return None;
        }
        match self.get().await {
            StreamItem::Value(v) => Some(Ok(v)),
            StreamItem::Error(err) => {
                self.lock().finished = true;
                Some(Err(err))
            }
            StreamItem::End => {
                self.lock().finished = true;
                None
            }
        }
    }

    /// 转换为 `futures` 的 `Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, RpcError>> + Send + 'static {
        stream::unfold(self, |s| async move { s.next().await.map(|item| (item, s)) })
    }

    /// 只产出数据值的 `Stream`，遇到错误即结束；可直接作为请求流使用
    pub fn into_values(self) -> impl Stream<Item = Value> + Send + 'static {
        stream::unfold(self, |s| async move {
            match s.next().await {
                Some(Ok(v)) => Some((v, s)),
                Some(Err(err)) => {
                    warn!("请求流以错误结束: {}", err);
                    None
                }
                None => None,
            }
        })
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RpcStream")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_unforced_put_drops_when_full() {
        let s = RpcStream::new(2);
        assert!(s.put(json!(1), false));
        assert!(s.put(json!(2), false));
        assert!(!s.put(json!(3), false));
        assert_eq!(s.len(), 2);

        // 强制写入无视容量
        assert!(s.put(json!(4), true));
        assert_eq!(s.len(), 3);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let s = RpcStream::with_policy(2, OverflowPolicy::DropOldest);
        s.put(json!(1), false);
        s.put(json!(2), false);
        assert!(s.put(json!(3), false));
        assert_eq!(s.len(), 2);
        s.force_close();

        let values: Vec<_> = s.into_values().collect().await;
        assert_eq!(values, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_iterate_until_close() {
        let s = RpcStream::unbounded();
        s.put(json!("a"), false);
        s.put(json!("b"), false);
        s.force_close();

        assert_eq!(s.next().await, Some(Ok(json!("a"))));
        assert_eq!(s.next().await, Some(Ok(json!("b"))));
        assert_eq!(s.next().await, None);
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn test_error_terminates_iteration() {
        let s = RpcStream::new(1);
        s.put(json!("a"), false);
        s.force_put_error(RpcError::server(json!("boom")));
        s.put(json!("late"), true);

        let items: Vec<_> = s.clone().into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(json!("a")));
        assert_eq!(items[1].as_ref().unwrap_err().message, "boom");
    }

    #[tokio::test]
    async fn test_put_after_close_is_noop() {
        let s = RpcStream::unbounded();
        s.force_close();
        assert!(s.is_closed());
        assert!(!s.put(json!(1), true));
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let s = RpcStream::new(1);
        let consumer = s.clone();
        let task = tokio::spawn(async move { consumer.next().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        s.put(json!(42), false);

        let got = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(Ok(json!(42))));
    }
}
