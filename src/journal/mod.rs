//! JBD Journal 实现
//!
//! 这个模块提供完整的 JBD 日志功能：把一组元数据修改作为原子事务写入环形日志，
//! 提交之后再由 checkpoint 写回原始位置，崩溃后通过恢复重放已提交的事务。
//!
//! # 架构概述
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Filesystem Layer                        │
//! │     start_handle() / get_write_access() / stop()          │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Journal Core                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │   Journal    │  │ Transaction  │  │ JournalHead  │   │
//! │  │  (Manager)   │  │   / Handle   │  │   (Buffer)   │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘   │
//! │         │                  │                  │           │
//! │  ┌──────┴───────┐  ┌──────┴───────┐  ┌──────┴───────┐   │
//! │  │  kjournald   │  │    commit    │  │  checkpoint  │   │
//! │  └──────────────┘  └──────┬───────┘  └──────────────┘   │
//! │                            ▼                              │
//! │                    ┌──────────────┐                       │
//! │                    │    JbdFs     │                       │
//! │                    │  (log I/O)   │                       │
//! │                    └──────┬───────┘                       │
//! └───────────────────────────┼───────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Block Layer                           │
//! │              BlockCache / BlockDev                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # 核心组件
//!
//! - [`types`] - 磁盘格式定义
//! - [`JbdFs`] - 日志块映射和 superblock 读写
//! - [`Journal`] - Journal 管理器，维护运行中/提交中事务和 checkpoint 队列
//! - [`Handle`] - 客户端在运行中事务里的空间预留
//! - [`JournalLists`] - journal head arena 和事务链表
//! - [`LogRing`] - 日志环形空间分配
//! - [`RevokeTable`] - 恢复时使用的 revoke 记录表
//!
//! # 锁顺序
//!
//! ```text
//! checkpoint_mutex → commit_mutex → buffer 锁 → state 锁 → lists 锁
//! ```
//!
//! superblock 锁和提交线程邮箱锁是叶子锁。state 锁和 lists 锁从不跨越设备 I/O。
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use jbd_core::journal::{Journal, JournalConfig, LogMapping};
//!
//! // 1. 加载 journal（mount 时），需要时自动恢复
//! let journal = Journal::load(device, LogMapping::Linear { offset: 0 }, JournalConfig::default())?;
//!
//! // 2. 开始 handle
//! let mut handle = journal.start_handle(1)?;
//!
//! // 3. 执行修改
//! let bh = journal.get_buffer(500)?;
//! handle.get_write_access(&bh)?;
//! bh.with_data_mut(|data| data[0] = 0x42);
//! handle.dirty_metadata(&bh)?;
//!
//! // 4. 结束 handle（同步提交）
//! handle.set_sync(true);
//! handle.stop()?;
//!
//! // 5. 卸载
//! journal.destroy()?;
//! ```
//!
//! # 对应内核 JBD
//!
//! | JBD                          | jbd_core                     |
//! |------------------------------|------------------------------|
//! | `journal_t`                  | [`Journal`]                  |
//! | `transaction_t`              | [`Transaction`]              |
//! | `handle_t`                   | [`Handle`]                   |
//! | `struct journal_head`        | [`JournalHead`]              |
//! | `journal_commit_transaction()` | `commit::commit_transaction()` |
//! | `log_do_checkpoint()`        | `checkpoint::log_do_checkpoint()` |
//! | `journal_recover()`          | `recovery::recover()`        |
//! | `kjournald()`                | `kjournald::spawn()`         |

pub mod types;

mod checkpoint;
mod checksum;
mod commit;
mod config;
mod handle;
mod jbd_buf;
mod jbd_fs;
mod jbd_journal;
mod jbd_trans;
mod kjournald;
mod recovery;
mod revoke;
mod ring;

#[cfg(test)]
mod tests;

// Re-exports
pub use checksum::TransactionChecksum;
pub use config::{
    JournalConfig, LogLimits, DEFAULT_COMMIT_INTERVAL, DEFAULT_MIN_LOG_RESERVED_BLOCKS,
};
pub use handle::Handle;
pub use jbd_buf::{
    BufferContent, BufferList, CheckpointTransaction, JournalHead, JournalHeadId, JournalLists,
    TransactionLists,
};
pub use jbd_fs::{Bmap, JbdFs, LogMapping};
pub use jbd_journal::{Journal, JournalFlags, JournalStats};
pub use jbd_trans::{tid_geq, tid_gt, Tid, Transaction, TransactionState};
pub use kjournald::CommitMessage;
pub use recovery::RecoveryInfo;
pub use revoke::{RevokeTable, RevokeTracker};
pub use ring::{LogBlockRange, LogRing};
pub use types::*;

/// Journal 错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    /// Journal 超级块无效
    InvalidSuperblock,
    /// Journal 功能不支持
    UnsupportedFeature(u32),
    /// 恢复失败
    RecoveryFailed,
    /// 空间不足
    NoSpace,
    /// IO 错误
    IoError,
    /// Journal 已中止
    Aborted,
    /// handle 的 credits 已用完
    NoCredits,
    /// 日志逻辑块没有映射
    BmapMiss(u32),
    /// 申请的 credits 超过单个事务上限
    TooManyCredits(u32),
    /// 块没有在当前事务中取得写权限
    NotJournaled,
}

impl core::fmt::Display for JournalError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            JournalError::InvalidSuperblock => write!(f, "Invalid journal superblock"),
            JournalError::UnsupportedFeature(feat) => {
                write!(f, "Unsupported journal feature: 0x{:08x}", feat)
            }
            JournalError::RecoveryFailed => write!(f, "Journal recovery failed"),
            JournalError::NoSpace => write!(f, "Journal has no space"),
            JournalError::IoError => write!(f, "Journal I/O error"),
            JournalError::Aborted => write!(f, "Journal has been aborted"),
            JournalError::NoCredits => write!(f, "Handle has no buffer credits left"),
            JournalError::BmapMiss(block) => write!(f, "Journal block {} is not mapped", block),
            JournalError::TooManyCredits(n) => {
                write!(f, "Handle requested {} credits, more than a transaction holds", n)
            }
            JournalError::NotJournaled => {
                write!(f, "Buffer has no write access in this transaction")
            }
        }
    }
}
