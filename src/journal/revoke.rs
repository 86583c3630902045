//! Revoke 记录表
//!
//! 恢复时使用：记录"这个块在某个事务里被撤销，不能用更早的日志内容覆盖"。
//!
//! 对应内核 `revoke.c` 中恢复相关的部分（`journal_set_revoke()` /
//! `journal_test_revoke()` / `journal_clear_revoke()`）。运行时的撤销记录保存在
//! 各个事务自己的链表里，提交时写成 revoke 块。

use super::jbd_trans::{tid_geq, tid_gt, Tid};
use std::collections::HashMap;

/// Revoke 记录跟踪接口
///
/// 恢复引擎只通过这三个操作使用它，可以替换为其他实现。
pub trait RevokeTracker: Send {
    /// 记录 `block` 在事务 `tid` 中被撤销
    ///
    /// 同一个块多次撤销时保留最新的 tid
    fn record_revoke(&mut self, block: u64, tid: Tid);

    /// `block` 在事务 `tid` 或更新的事务里被撤销过
    fn is_revoked(&self, block: u64, tid: Tid) -> bool;

    /// 清空所有记录
    fn clear_all(&mut self);
}

/// 基于哈希表的 revoke 记录表
#[derive(Debug, Default)]
pub struct RevokeTable {
    records: HashMap<u64, Tid>,
}

impl RevokeTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录数量
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RevokeTracker for RevokeTable {
    fn record_revoke(&mut self, block: u64, tid: Tid) {
        self.records
            .entry(block)
            .and_modify(|existing| {
                if tid_gt(tid, *existing) {
                    *existing = tid;
                }
            })
            .or_insert(tid);
        log::trace!("[REVOKE] block {} revoked in tid {}", block, tid);
    }

    fn is_revoked(&self, block: u64, tid: Tid) -> bool {
        self.records
            .get(&block)
            .is_some_and(|revoked| tid_geq(*revoked, tid))
    }

    fn clear_all(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_scope() {
        let mut table = RevokeTable::new();
        table.record_revoke(42, 10);

        // 同一事务和更早的事务被抑制，更新的事务不受影响
        assert!(table.is_revoked(42, 10));
        assert!(table.is_revoked(42, 9));
        assert!(!table.is_revoked(42, 11));
        assert!(!table.is_revoked(43, 1));
    }

    #[test]
    fn test_keeps_newest_tid() {
        let mut table = RevokeTable::new();
        table.record_revoke(7, 20);
        table.record_revoke(7, 15);
        assert!(table.is_revoked(7, 20));

        table.record_revoke(7, 25);
        assert!(table.is_revoked(7, 25));
        assert_eq!(table.len(), 1);

        table.clear_all();
        assert!(table.is_empty());
        assert!(!table.is_revoked(7, 1));
    }
}
