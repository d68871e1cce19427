/// 消息 ID 分配器
///
/// 在 `[min, max]` 范围内递增分配，超过 `max` 回绕到 `min`，跳过仍被占用的 ID。

use super::RpcError;

#[derive(Debug, Clone)]
pub struct MsgIdAllocator {
    min: u32,
    max: u32,
    next: u32,
}

impl MsgIdAllocator {
    pub fn new(min: u32, max: u32) -> Self {
        debug_assert!(min <= max);
        Self {
            min,
            max,
            next: min,
        }
    }

    pub fn range(&self) -> (u32, u32) {
        (self.min, self.max)
    }

    /// 分配下一个未被占用的 ID
    ///
    /// 整个空间都被占用时返回 `MsgIdExhausted`，绝不返回冲突的 ID。
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> Result<u32, RpcError> {
        let span = u64::from(self.max - self.min) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.advance();
            if !in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(RpcError::msgid_exhausted(self.min, self.max))
    }

    fn advance(&mut self) {
        self.next = if self.next >= self.max {
            self.min
        } else {
            self.next + 1
        };
    }
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        Self::new(
            super::handshake::DEFAULT_MIN_MSGID,
            super::handshake::DEFAULT_MAX_MSGID,
        )
    }
}
