//! JBD Transaction 管理
//!
//! 对应内核的 `transaction_t`
//!
//! 事务的缓冲区链表由 [`JournalLists`](super::jbd_buf::JournalLists) 按 tid 管理，
//! 这里只保存受 journal 状态锁保护的部分：状态机、credits 和 handle 计数。

use std::time::{Duration, Instant};

/// 事务 ID
///
/// 磁盘上是 32 位，会回绕，比较时必须使用 [`tid_gt`] / [`tid_geq`]
pub type Tid = u32;

/// `x` 是否比 `y` 新（考虑回绕）
#[inline]
pub fn tid_gt(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) > 0
}

/// `x` 是否不比 `y` 旧（考虑回绕）
#[inline]
pub fn tid_geq(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) >= 0
}

/// 事务状态
///
/// 状态只会向前推进：
///
/// ```text
/// Running → Locked → Flush → Commit → CommitRecord → Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransactionState {
    /// 接受新的 handle
    Running,
    /// 不再接受新的 handle，等待已有 handle 结束
    Locked,
    /// 正在生成 shadow 缓冲区
    Flush,
    /// 正在写描述符块和数据块
    Commit,
    /// 正在写提交块
    CommitRecord,
    /// 提交完成
    Finished,
}

/// JBD Transaction（事务）
///
/// 对应内核 `transaction_t` 中受 `j_state_lock` 保护的字段
#[derive(Debug)]
pub struct Transaction {
    /// Transaction ID
    pub tid: Tid,

    /// 当前状态
    pub state: TransactionState,

    /// 第一个日志块（进入 Flush 时确定）
    pub log_start: u32,

    /// 所有 handle 预留的 buffer credits 之和
    pub outstanding_credits: u32,

    /// 尚未结束的 handle 数
    pub updates: u32,

    /// 曾经加入过的 handle 总数
    pub handle_count: u32,

    /// 创建时间
    pub start_time: Instant,

    /// 定时提交的截止时间
    pub expires: Instant,

    /// 有 handle 要求同步提交
    pub synchronous_commit: bool,
}

impl Transaction {
    /// 创建新的运行中事务
    pub fn new(tid: Tid, commit_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            tid,
            state: TransactionState::Running,
            log_start: 0,
            outstanding_credits: 0,
            updates: 0,
            handle_count: 0,
            start_time: now,
            expires: now + commit_interval,
            synchronous_commit: false,
        }
    }

    /// 是否已经过了定时提交的截止时间
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}
