//! jbd_core: Pure Rust JBD journaling core
//!
//! 这是一个纯 Rust 实现的块设备预写日志（JBD）库，旨在提供：
//! - **原子事务**：一组元数据修改要么全部生效，要么全部不生效
//! - **崩溃恢复**：挂载时重放已提交的事务，丢弃未提交的部分
//! - **Rust 惯用风格**的 API，handle 在 drop 时自动结束
//! - **完整的类型安全**
//!
//! # 示例
//!
//! ```rust,ignore
//! use jbd_core::{block::MemoryDevice, Journal, JournalConfig, LogMapping, Result};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let device = Arc::new(MemoryDevice::new(1024, 1024));
//!
//!     // 在块 10..74 上创建 journal
//!     let journal = Journal::create(
//!         device,
//!         LogMapping::Linear { offset: 0 },
//!         10..74,
//!         JournalConfig::default(),
//!     )?;
//!
//!     let mut handle = journal.start_handle(1)?;
//!     let bh = journal.get_buffer(500)?;
//!     handle.get_write_access(&bh)?;
//!     bh.with_data_mut(|data| data[..4].copy_from_slice(b"AAAA"));
//!     handle.dirty_metadata(&bh)?;
//!     handle.stop()?;
//!
//!     journal.destroy()
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块设备抽象
//! - [`cache`] - 块缓存
//! - [`journal`] - Journal（事务、提交、checkpoint、恢复）
//! - [`crc`] - 校验和函数

#![deny(unsafe_code)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块设备抽象
pub mod block;

/// 块缓存
pub mod cache;

/// Journal (JBD) 系统
pub mod journal;

/// CRC32 校验和计算
pub mod crc;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDev, BlockDevice};

// Cache
pub use cache::{BlockCache, BufferFlags, BufferHead, BufferRef, CacheStats, DEFAULT_CACHE_SIZE};

// Journal
pub use journal::{
    Bmap, Handle, Journal, JournalConfig, JournalError, JournalStats, LogMapping, RecoveryInfo,
    Tid,
};
