//! 缓存块结构
//!
//! 对应内核 `struct buffer_head` 中 journal 关心的部分

use crate::journal::JournalHeadId;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

bitflags! {
    /// 缓存块标志
    ///
    /// 对应 `BH_Uptodate`、`BH_Dirty`、`BH_JBDDirty` 等状态位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u16 {
        /// 数据有效
        const UPTODATE     = 0x01;
        /// 需要写回原始位置（checkpoint 负责）
        const DIRTY        = 0x02;
        /// 被 journal 接管的脏块，写回前必须先提交
        const JBDDIRTY     = 0x04;
        /// 附加了 journal head
        const JBD          = 0x08;
        /// 在运行中的事务里被撤销
        const REVOKED      = 0x10;
        /// REVOKED 位有效
        const REVOKE_VALID = 0x20;
    }
}

/// 共享的缓存块引用
pub type BufferRef = Arc<BufferHead>;

/// 由 per-buffer 锁保护的缓存块状态
#[derive(Debug)]
pub struct BufferState {
    /// 块数据（写时复制）
    ///
    /// 正在写入 journal 的 I/O 持有同一个 `Arc`，此时修改会复制出新的数据，
    /// 保证提交中的写入永远看到一致的快照。
    pub(crate) data: Arc<Vec<u8>>,

    /// 状态标志
    pub(crate) flags: BufferFlags,

    /// 对应的 journal head
    pub(crate) journal_head: Option<JournalHeadId>,
}

impl BufferState {
    /// 数据快照（不复制）
    pub(crate) fn snapshot(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.data)
    }

    /// 可写数据，如有共享则先复制
    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.data)
    }
}

/// 缓存块
///
/// 每个文件系统块在内存中最多有一个 `BufferHead`，由 [`BlockCache`](super::BlockCache)
/// 负责查找和去重。`state` 上的锁就是 per-buffer 锁（对应 `jbd_lock_bh_state`）。
#[derive(Debug)]
pub struct BufferHead {
    blocknr: u64,
    state: Mutex<BufferState>,
}

impl BufferHead {
    /// 创建新的缓存块
    pub fn new(blocknr: u64, data: Vec<u8>, flags: BufferFlags) -> Self {
        Self {
            blocknr,
            state: Mutex::new(BufferState {
                data: Arc::new(data),
                flags,
                journal_head: None,
            }),
        }
    }

    /// 用已有的数据快照创建缓存块（提交时的日志 buffer）
    pub fn from_shared(blocknr: u64, data: Arc<Vec<u8>>, flags: BufferFlags) -> Self {
        Self {
            blocknr,
            state: Mutex::new(BufferState {
                data,
                flags,
                journal_head: None,
            }),
        }
    }

    /// 块号
    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    /// 获取 per-buffer 锁
    pub(crate) fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    /// 尝试获取 per-buffer 锁
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, BufferState>> {
        self.state.try_lock()
    }

    /// 当前数据的快照
    pub fn snapshot(&self) -> Arc<Vec<u8>> {
        self.lock().snapshot()
    }

    /// 只读访问数据
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.lock();
        f(&state.data)
    }

    /// 修改数据
    ///
    /// 通过 journal 修改元数据时，必须先在 handle 上取得写权限，
    /// 修改后再调用 `dirty_metadata`。
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.lock();
        f(state.data_mut())
    }

    /// 当前标志
    pub fn flags(&self) -> BufferFlags {
        self.lock().flags
    }

    /// 是否需要写回原始位置
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(BufferFlags::DIRTY)
    }

    /// 是否是 journal 接管的脏块
    pub fn is_jbddirty(&self) -> bool {
        self.flags().contains(BufferFlags::JBDDIRTY)
    }

    /// 数据是否有效
    pub fn is_uptodate(&self) -> bool {
        self.flags().contains(BufferFlags::UPTODATE)
    }

    /// 是否附加了 journal head
    pub fn has_journal_head(&self) -> bool {
        self.lock().journal_head.is_some()
    }

    /// 标记为普通脏块（不经过 journal 的写入）
    pub fn mark_dirty(&self) {
        self.lock().flags.insert(BufferFlags::DIRTY);
    }
}
