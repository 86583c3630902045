//! Journal 配置

use super::types::{descriptor_capacity, revoke_capacity};
use crate::{
    cache::DEFAULT_CACHE_SIZE,
    crc::{crc32_append, ChecksumFn},
    error::{Error, ErrorKind, Result},
};
use std::time::Duration;

/// 默认提交间隔
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// 提交保留块数的下限（描述符块、revoke 块和提交块总是有位置写）
pub const DEFAULT_MIN_LOG_RESERVED_BLOCKS: u32 = 8;

/// 根据日志几何参数算出的运行限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    /// 单个事务的 credits 上限
    pub max_transaction_buffers: u32,
    /// 准入 handle 时扣除的保留块数
    pub reserved_blocks: u32,
    /// 实际使用的块缓存容量
    pub cache_capacity: usize,
}

/// Journal 配置
///
/// 在 `create()` / `load()` 时传入，之后不可修改
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// 运行中事务的最长存活时间，到期后由提交线程提交
    pub commit_interval: Duration,

    /// 单个事务最多预留的 buffer credits（默认是日志长度的 1/4）
    pub max_transaction_buffers: Option<u32>,

    /// 为提交开销保留的日志块数（`None` 时按最大事务的提交开销计算）
    pub min_log_reserved_blocks: Option<u32>,

    /// 是否在提交块中写入事务校验和（新建 journal 时生效）
    pub checksum: bool,

    /// 校验和函数（追加语义）
    pub checksum_fn: ChecksumFn,

    /// 块缓存容量（块数）
    pub cache_capacity: usize,

    /// 新建 journal 使用的 UUID，`None` 时随机生成
    pub uuid: Option<[u8; 16]>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            max_transaction_buffers: None,
            min_log_reserved_blocks: None,
            checksum: false,
            checksum_fn: crc32_append,
            cache_capacity: DEFAULT_CACHE_SIZE,
            uuid: None,
        }
    }
}

impl JournalConfig {
    /// 设置提交间隔
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// 设置单个事务的 credits 上限
    pub fn with_max_transaction_buffers(mut self, max: u32) -> Self {
        self.max_transaction_buffers = Some(max);
        self
    }

    /// 设置提交保留块数
    pub fn with_min_log_reserved_blocks(mut self, blocks: u32) -> Self {
        self.min_log_reserved_blocks = Some(blocks);
        self
    }

    /// 启用或关闭提交校验和
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    /// 替换校验和函数
    pub fn with_checksum_fn(mut self, func: ChecksumFn) -> Self {
        self.checksum_fn = func;
        self
    }

    /// 设置块缓存容量
    ///
    /// 小于两个最大事务的容量会被调大：运行中事务和提交中事务的块都不能驱逐
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// 指定 journal UUID
    pub fn with_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// 根据日志几何参数校验配置
    ///
    /// # 参数
    ///
    /// * `ring_len` - 日志区域长度（块）
    /// * `block_size` - 块大小
    ///
    /// # 返回
    ///
    /// credits 上限、保留块数和缓存容量
    ///
    /// # 检查项
    ///
    /// 1. 保留块数足够写下一个最大事务的描述符块、revoke 块和提交块
    /// 2. 空日志能容纳一个最大事务
    pub fn validate(&self, ring_len: u32, block_size: usize) -> Result<LogLimits> {
        let max_tb = self.max_transaction_buffers.unwrap_or(ring_len / 4);
        if max_tb == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Journal too small for a single transaction",
            ));
        }

        let tags = descriptor_capacity(block_size) as u32;
        let revokes = revoke_capacity(block_size) as u32;
        if tags == 0 || revokes == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Block size too small for journal"));
        }

        // 描述符块 + revoke 块 + 提交块 + 环的硬性余量
        let overhead = max_tb.div_ceil(tags) + max_tb.div_ceil(revokes) + 1 + 1;
        let reserved = self
            .min_log_reserved_blocks
            .unwrap_or_else(|| overhead.max(DEFAULT_MIN_LOG_RESERVED_BLOCKS));
        if reserved < overhead {
            log::error!(
                "[JOURNAL] reserve of {} blocks cannot cover commit overhead of {}",
                reserved,
                overhead
            );
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "min_log_reserved_blocks is smaller than the commit overhead",
            ));
        }

        let usable = ring_len.saturating_sub(reserved);
        if usable - (usable >> 3) < max_tb {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Journal too small for max_transaction_buffers",
            ));
        }

        let cache_capacity = self.cache_capacity.max(2 * max_tb as usize);
        if cache_capacity != self.cache_capacity {
            log::debug!(
                "[JOURNAL] cache capacity raised from {} to {} blocks",
                self.cache_capacity,
                cache_capacity
            );
        }

        Ok(LogLimits {
            max_transaction_buffers: max_tb,
            reserved_blocks: reserved,
            cache_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JournalConfig::default();
        assert_eq!(config.commit_interval, Duration::from_secs(5));
        assert_eq!(config.min_log_reserved_blocks, None);
        assert_eq!(config.cache_capacity, 256);
        assert!(!config.checksum);
    }

    #[test]
    fn test_validate_defaults_to_quarter_of_log() {
        let limits = JournalConfig::default().validate(64, 1024).unwrap();
        assert_eq!(limits.max_transaction_buffers, 16);
        assert_eq!(limits.reserved_blocks, DEFAULT_MIN_LOG_RESERVED_BLOCKS);
        assert_eq!(limits.cache_capacity, 256);
    }

    #[test]
    fn test_default_reserve_follows_geometry() {
        // 1 KiB 块：每个描述符块 124 个 tag，每个 revoke 块 252 条记录
        let limits = JournalConfig::default().validate(4096, 1024).unwrap();
        assert_eq!(limits.max_transaction_buffers, 1024);
        assert_eq!(limits.reserved_blocks, 9 + 5 + 2);
        assert_eq!(limits.cache_capacity, 2048);

        let limits = JournalConfig::default().validate(32768, 4096).unwrap();
        assert_eq!(limits.max_transaction_buffers, 8192);
        assert!(limits.reserved_blocks > DEFAULT_MIN_LOG_RESERVED_BLOCKS);

        // 显式设置的保留块数仍然要覆盖提交开销
        let config = JournalConfig::default().with_min_log_reserved_blocks(8);
        assert_eq!(
            config.validate(4096, 1024).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        let config = JournalConfig::default().with_min_log_reserved_blocks(32);
        assert_eq!(config.validate(4096, 1024).unwrap().reserved_blocks, 32);
    }

    #[test]
    fn test_cache_capacity_covers_two_transactions() {
        let config = JournalConfig::default().with_cache_capacity(4);
        assert_eq!(config.validate(64, 1024).unwrap().cache_capacity, 32);

        let config = JournalConfig::default().with_cache_capacity(1000);
        assert_eq!(config.validate(64, 1024).unwrap().cache_capacity, 1000);
    }

    #[test]
    fn test_validate_rejects_small_reserve() {
        let config = JournalConfig::default().with_min_log_reserved_blocks(2);
        assert_eq!(
            config.validate(64, 1024).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_validate_rejects_oversized_transactions() {
        let config = JournalConfig::default().with_max_transaction_buffers(60);
        assert!(config.validate(64, 1024).is_err());

        let config = JournalConfig::default().with_max_transaction_buffers(32);
        assert_eq!(config.validate(64, 1024).unwrap().max_transaction_buffers, 32);
    }
}
