//! Journal 校验和计算
//!
//! `COMPAT_CHECKSUM` 特性下，提交块保存整个事务（描述符块和数据块）的校验和，
//! 恢复时校验和不匹配的提交块被视为日志结束。

use super::types::CommitHeader;
use crate::crc::{ChecksumFn, JBD_CRC32_INIT};
use std::time::{SystemTime, UNIX_EPOCH};

/// 事务校验和累加器
///
/// 提交和恢复按相同的顺序喂入描述符块和数据块
#[derive(Debug, Clone, Copy)]
pub struct TransactionChecksum {
    func: ChecksumFn,
    crc: u32,
    enabled: bool,
}

impl TransactionChecksum {
    /// 创建累加器，`enabled` 为 false 时所有操作都是空操作
    pub fn new(func: ChecksumFn, enabled: bool) -> Self {
        Self {
            func,
            crc: JBD_CRC32_INIT,
            enabled,
        }
    }

    /// 累加一个日志块
    pub fn update(&mut self, block: &[u8]) {
        if self.enabled {
            self.crc = (self.func)(self.crc, block);
        }
    }

    /// 重新开始（下一个事务）
    pub fn reset(&mut self) {
        self.crc = JBD_CRC32_INIT;
    }

    /// 当前值（未启用时返回 None）
    pub fn value(&self) -> Option<u32> {
        self.enabled.then_some(self.crc)
    }

    /// 校验提交块
    ///
    /// 未启用校验和或提交块没有携带 CRC32 时总是通过
    pub fn verify(&self, commit: &CommitHeader) -> bool {
        match (self.value(), commit.crc32()) {
            (Some(expected), Some(stored)) => expected == stored,
            _ => true,
        }
    }
}

/// 提交块中的时间戳（秒，纳秒）
pub fn commit_timestamp() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc32_append;

    #[test]
    fn test_checksum_accumulates_in_order() {
        let mut a = TransactionChecksum::new(crc32_append, true);
        a.update(b"descriptor");
        a.update(b"data");

        let mut b = TransactionChecksum::new(crc32_append, true);
        b.update(b"data");
        b.update(b"descriptor");

        assert_ne!(a.value(), b.value());

        let mut header = CommitHeader::new(1);
        header.set_crc32(a.value().unwrap());
        assert!(a.verify(&header));
        assert!(!b.verify(&header));
    }

    #[test]
    fn test_disabled_checksum_always_verifies() {
        let mut sum = TransactionChecksum::new(crc32_append, false);
        sum.update(b"anything");
        assert_eq!(sum.value(), None);

        let mut header = CommitHeader::new(1);
        header.set_crc32(123);
        assert!(sum.verify(&header));
    }

    #[test]
    fn test_commit_timestamp_is_recent() {
        let (sec, nsec) = commit_timestamp();
        assert!(sec > 1_600_000_000);
        assert!(nsec < 1_000_000_000);
    }
}
