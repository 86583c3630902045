//! 日志环形空间分配
//!
//! 日志区域是 `[first, last)` 之间的循环块序列：
//! - `head`：下一个要写入的日志块
//! - `tail`：最旧的仍然需要保留的日志块
//! - `free`：可用块数
//!
//! 对应内核 `journal_next_log_block()` 和 `__log_space_left()`

/// 日志空间快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBlockRange {
    /// 第一个日志块
    pub first: u32,
    /// 日志区域结束（不含）
    pub last: u32,
    /// 下一个要分配的块
    pub head: u32,
    /// 最旧的仍在使用的块
    pub tail: u32,
    /// 可用块数
    pub free_count: u32,
}

/// 日志环形分配器
#[derive(Debug, Clone)]
pub struct LogRing {
    first: u32,
    last: u32,
    head: u32,
    tail: u32,
    free: u32,
}

impl LogRing {
    /// 创建空的日志环，`head` 和 `tail` 都从 `start` 开始
    pub fn new(first: u32, last: u32, start: u32) -> Self {
        assert!(first < last, "empty log ring");
        assert!((first..last).contains(&start), "ring start outside log");
        Self {
            first,
            last,
            head: start,
            tail: start,
            free: last - first,
        }
    }

    /// 日志区域长度
    pub fn len(&self) -> u32 {
        self.last - self.first
    }

    /// 第一个日志块
    pub fn first(&self) -> u32 {
        self.first
    }

    /// 下一个要分配的块
    pub fn head(&self) -> u32 {
        self.head
    }

    /// 最旧的仍在使用的块
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// 可用块数
    pub fn free(&self) -> u32 {
        self.free
    }

    /// 从 `from` 走到 `to` 经过的块数
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            to + self.len() - from
        }
    }

    /// `block` 的下一个日志块（到达 `last` 时回到 `first`）
    pub fn wrap_next(&self, block: u32) -> u32 {
        if block + 1 >= self.last {
            self.first
        } else {
            block + 1
        }
    }

    /// 分配下一个日志块
    ///
    /// 调用者必须已经通过 handle 准入保证了空间，这里空间不足是内部错误
    pub fn next_log_block(&mut self) -> u32 {
        assert!(self.free > 1, "log ring overrun: free={}", self.free);
        let block = self.head;
        self.head = self.wrap_next(self.head);
        self.free -= 1;
        block
    }

    /// 释放 `n` 个块，`tail` 向前推进
    pub fn release_blocks(&mut self, n: u32) {
        assert!(self.free + n <= self.len(), "releasing more blocks than in use");
        self.free += n;
        self.tail += n;
        if self.tail >= self.last {
            self.tail -= self.len();
        }
    }

    /// 把 `tail` 推进到 `new_tail`，返回释放的块数
    pub fn advance_tail(&mut self, new_tail: u32) -> u32 {
        let freed = self.distance(self.tail, new_tail);
        if freed > 0 {
            self.release_blocks(freed);
        }
        freed
    }

    /// 扣除保留块之后还能提供给 handle 的空间
    ///
    /// 再留出 1/8 的余量，避免提交开销把日志写满
    pub fn space_left(&self, reserved: u32) -> u32 {
        let left = self.free.saturating_sub(reserved);
        left - (left >> 3)
    }

    /// 快照
    pub fn snapshot(&self) -> LogBlockRange {
        LogBlockRange {
            first: self.first,
            last: self.last,
            head: self.head,
            tail: self.tail,
            free_count: self.free,
        }
    }
}
