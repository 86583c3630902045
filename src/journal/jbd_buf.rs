//! JBD Buffer 管理
//!
//! 对应内核 `struct journal_head` 以及 `transaction.c` 中的链表操作
//! （`__journal_file_buffer()` / `__journal_unfile_buffer()` / `__journal_refile_buffer()`）
//! 和 `checkpoint.c` 中的 `__journal_insert_checkpoint()` / `__journal_remove_checkpoint()`。
//!
//! # Rust 实现
//!
//! - journal head 存放在 arena 中，用 [`JournalHeadId`] 索引，不使用侵入式链表指针
//! - 事务的各个链表是 `Vec<JournalHeadId>`，链表归属用 [`BufferList`] 表示
//! - checkpoint 归属是单独的 `cp_transaction` 字段：一个块可以同时在运行中事务的链表上
//!   和更早事务的 checkpoint 链表上
//!
//! 所有方法都要求调用者持有 journal 的 lists 锁；修改 `BufferState` 的方法
//! 还要求持有对应块的 per-buffer 锁（通过 `&mut BufferState` 体现）。

use super::jbd_trans::Tid;
use crate::cache::{BufferFlags, BufferRef, BufferState};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// journal head 在 arena 中的索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JournalHeadId(pub(crate) usize);

/// 块所在的事务链表
///
/// 对应内核 `BJ_None` / `BJ_Reserved` / `BJ_Metadata` / `BJ_Forget` / `BJ_Shadow` / `BJ_IO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferList {
    /// 不在任何链表上
    None,
    /// 取得了写权限，尚未修改
    Reserved,
    /// 已修改，等待提交
    Metadata,
    /// 提交完成后需要处理（被 forget 的块，或者已经写入日志的块）
    Forget,
    /// 原始块，它的快照正在写入日志
    Shadow,
    /// 写往日志的临时 buffer
    Io,
}

/// 提交时写入日志的数据来源
///
/// 正常情况下直接使用缓存块的当前数据；
/// 如果提交期间有新的 handle 修改了这个块，提交使用修改前冻结的副本。
#[derive(Debug, Clone)]
pub enum BufferContent {
    /// 缓存块当前数据的快照
    Live(Arc<Vec<u8>>),
    /// 冻结副本
    Frozen(Arc<Vec<u8>>),
}

impl BufferContent {
    /// 数据
    pub fn data(&self) -> &Arc<Vec<u8>> {
        match self {
            BufferContent::Live(data) | BufferContent::Frozen(data) => data,
        }
    }

    /// 是否是冻结副本
    pub fn is_frozen(&self) -> bool {
        matches!(self, BufferContent::Frozen(_))
    }
}

/// Journal head
///
/// 对应内核 `struct journal_head`
#[derive(Debug)]
pub struct JournalHead {
    /// 对应的缓存块
    pub bh: BufferRef,

    /// 当前归属的事务（`b_transaction`）
    pub transaction: Option<Tid>,

    /// 提交完成后要转交的运行中事务（`b_next_transaction`）
    pub next_transaction: Option<Tid>,

    /// 等待 checkpoint 的事务（`b_cp_transaction`）
    pub cp_transaction: Option<Tid>,

    /// 所在链表
    pub list: BufferList,

    /// 提交期间被再次修改时冻结的数据
    pub frozen: Option<Arc<Vec<u8>>>,

    /// undo 访问保存的已提交数据
    pub committed: Option<Arc<Vec<u8>>>,

    /// 临时引用计数
    pub refcount: u32,

    /// 在当前事务中已经修改过（已扣除 credit）
    pub modified: bool,
}

impl JournalHead {
    fn new(bh: BufferRef) -> Self {
        Self {
            bh,
            transaction: None,
            next_transaction: None,
            cp_transaction: None,
            list: BufferList::None,
            frozen: None,
            committed: None,
            refcount: 0,
            modified: false,
        }
    }

    /// 是否还被任何事务或链表引用
    fn is_unreferenced(&self) -> bool {
        self.refcount == 0
            && self.transaction.is_none()
            && self.next_transaction.is_none()
            && self.cp_transaction.is_none()
            && self.list == BufferList::None
    }
}

/// 一个事务的各个 buffer 链表
#[derive(Debug, Default)]
pub struct TransactionLists {
    /// `t_reserved_list`
    pub reserved: Vec<JournalHeadId>,
    /// `t_buffers`
    pub metadata: Vec<JournalHeadId>,
    /// `t_forget`
    pub forget: Vec<JournalHeadId>,
    /// `t_shadow_list`
    pub shadow: Vec<JournalHeadId>,
    /// `t_iobuf_list`
    pub io: Vec<JournalHeadId>,
    /// 本事务撤销的块号
    pub revokes: BTreeSet<u64>,
}

impl TransactionLists {
    fn list_mut(&mut self, list: BufferList) -> Option<&mut Vec<JournalHeadId>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::Metadata => Some(&mut self.metadata),
            BufferList::Forget => Some(&mut self.forget),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::Io => Some(&mut self.io),
        }
    }

    /// 所有 buffer 链表都为空
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
            && self.metadata.is_empty()
            && self.forget.is_empty()
            && self.shadow.is_empty()
            && self.io.is_empty()
    }
}

/// 已提交、等待 checkpoint 的事务
#[derive(Debug)]
pub struct CheckpointTransaction {
    /// 事务 ID
    pub tid: Tid,
    /// 事务在日志中的第一个块
    pub log_start: u32,
    /// 需要写回原始位置的块
    pub buffers: Vec<JournalHeadId>,
}

/// journal head arena 和所有事务链表
///
/// 由 journal 的 lists 锁保护（对应 `j_list_lock`）
#[derive(Debug, Default)]
pub struct JournalLists {
    heads: Vec<Option<JournalHead>>,
    free_slots: Vec<usize>,
    by_block: HashMap<u64, JournalHeadId>,

    /// 运行中和提交中事务的链表
    pub transactions: HashMap<Tid, TransactionLists>,

    /// checkpoint 队列，按 tid 从旧到新
    pub checkpoint: VecDeque<CheckpointTransaction>,
}

impl JournalLists {
    /// 创建空的 arena
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 journal head
    ///
    /// id 失效说明引用计数出了问题，直接 panic
    pub fn head(&self, id: JournalHeadId) -> &JournalHead {
        match self.heads.get(id.0) {
            Some(Some(jh)) => jh,
            _ => panic!("stale journal head {:?}", id),
        }
    }

    /// 获取可变的 journal head
    pub fn head_mut(&mut self, id: JournalHeadId) -> &mut JournalHead {
        match self.heads.get_mut(id.0) {
            Some(Some(jh)) => jh,
            _ => panic!("stale journal head {:?}", id),
        }
    }

    /// 按文件系统块号查找 journal head
    pub fn lookup(&self, blocknr: u64) -> Option<JournalHeadId> {
        self.by_block.get(&blocknr).copied()
    }

    /// 存活的 journal head 数量
    pub fn len(&self) -> usize {
        self.heads.len() - self.free_slots.len()
    }

    /// arena 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某个事务的链表（不存在时创建）
    pub fn transaction_mut(&mut self, tid: Tid) -> &mut TransactionLists {
        self.transactions.entry(tid).or_default()
    }

    fn alloc(&mut self, jh: JournalHead) -> JournalHeadId {
        match self.free_slots.pop() {
            Some(slot) => {
                self.heads[slot] = Some(jh);
                JournalHeadId(slot)
            }
            None => {
                self.heads.push(Some(jh));
                JournalHeadId(self.heads.len() - 1)
            }
        }
    }

    /// 给缓存块附加 journal head（已有则复用），引用计数加一
    ///
    /// 对应 `journal_add_journal_head()`
    pub fn attach(&mut self, bh: &BufferRef, bstate: &mut BufferState) -> JournalHeadId {
        if let Some(id) = bstate.journal_head {
            self.head_mut(id).refcount += 1;
            return id;
        }

        let mut jh = JournalHead::new(Arc::clone(bh));
        jh.refcount = 1;
        let id = self.alloc(jh);
        self.by_block.insert(bh.blocknr(), id);
        bstate.journal_head = Some(id);
        bstate.flags.insert(BufferFlags::JBD);
        log::trace!("[JOURNAL] attached journal head {:?} to block {}", id, bh.blocknr());
        id
    }

    /// 为提交时临时创建的日志 buffer 分配 journal head
    ///
    /// 日志 buffer 不在块缓存中，也不参与按块号查找
    pub fn attach_log_buffer(&mut self, bh: BufferRef) -> JournalHeadId {
        let id = self.alloc(JournalHead::new(Arc::clone(&bh)));
        let mut state = bh.lock();
        state.journal_head = Some(id);
        state.flags.insert(BufferFlags::JBD);
        id
    }

    /// 释放日志 buffer 的 journal head
    pub fn free_log_buffer(&mut self, id: JournalHeadId) {
        self.temp_unlink(id);
        if let Some(jh) = self.heads[id.0].take() {
            jh.bh.lock().journal_head = None;
        }
        self.free_slots.push(id.0);
    }

    /// 引用计数减一，没有其他引用时释放
    ///
    /// 对应 `journal_put_journal_head()`
    pub fn put(&mut self, id: JournalHeadId, bstate: &mut BufferState) {
        let jh = self.head_mut(id);
        assert!(jh.refcount > 0, "journal head refcount underflow");
        jh.refcount -= 1;
        self.maybe_release(id, bstate);
    }

    /// 不再被引用时释放 journal head
    ///
    /// # 返回
    ///
    /// 真正释放时返回 true
    pub fn maybe_release(&mut self, id: JournalHeadId, bstate: &mut BufferState) -> bool {
        if !self.head(id).is_unreferenced() {
            return false;
        }

        if let Some(jh) = self.heads[id.0].take() {
            let blocknr = jh.bh.blocknr();
            if self.by_block.get(&blocknr) == Some(&id) {
                self.by_block.remove(&blocknr);
            }
            log::trace!("[JOURNAL] released journal head {:?} of block {}", id, blocknr);
        }
        self.free_slots.push(id.0);
        bstate.journal_head = None;
        bstate.flags.remove(BufferFlags::JBD);
        true
    }

    /// 从当前链表上摘下，不改变事务归属
    ///
    /// 对应 `__journal_temp_unlink_buffer()`
    pub fn temp_unlink(&mut self, id: JournalHeadId) {
        let (tid, list) = {
            let jh = self.head(id);
            (jh.transaction, jh.list)
        };
        if let Some(tid) = tid {
            if let Some(lists) = self.transactions.get_mut(&tid) {
                if let Some(v) = lists.list_mut(list) {
                    v.retain(|x| *x != id);
                }
            }
        }
        self.head_mut(id).list = BufferList::None;
    }

    /// 把块放到事务 `tid` 的 `list` 链表上
    ///
    /// 对应 `__journal_file_buffer()`：进入 Reserved/Metadata/Forget/Shadow 时，
    /// 普通脏位转成 JBDDIRTY，防止块在提交前被写回原始位置
    pub fn file_buffer(
        &mut self,
        id: JournalHeadId,
        tid: Tid,
        list: BufferList,
        bstate: &mut BufferState,
    ) {
        {
            let jh = self.head(id);
            if jh.transaction == Some(tid) && jh.list == list {
                return;
            }
        }

        let mut was_dirty = false;
        if matches!(
            list,
            BufferList::Reserved | BufferList::Metadata | BufferList::Forget | BufferList::Shadow
        ) {
            was_dirty = bstate
                .flags
                .intersects(BufferFlags::DIRTY | BufferFlags::JBDDIRTY);
            bstate.flags.remove(BufferFlags::DIRTY | BufferFlags::JBDDIRTY);
        }

        if self.head(id).transaction.is_some() {
            self.temp_unlink(id);
        }

        let jh = self.head_mut(id);
        jh.transaction = Some(tid);
        jh.list = list;
        if let Some(v) = self.transaction_mut(tid).list_mut(list) {
            v.push(id);
        }

        if was_dirty {
            bstate.flags.insert(BufferFlags::JBDDIRTY);
        }
    }

    /// 从事务中移除
    ///
    /// 对应 `__journal_unfile_buffer()`
    pub fn unfile(&mut self, id: JournalHeadId) {
        self.temp_unlink(id);
        self.head_mut(id).transaction = None;
    }

    /// 提交完成后重新归档
    ///
    /// 对应 `__journal_refile_buffer()`：
    /// - 没有下一个事务：移出事务，JBDDIRTY 转回普通脏位交给 checkpoint 写回
    /// - 有下一个事务：转交给它，修改过的放在 Metadata，否则放在 Reserved
    pub fn refile(&mut self, id: JournalHeadId, bstate: &mut BufferState) {
        let next = self.head(id).next_transaction;
        match next {
            None => {
                self.unfile(id);
                if bstate.flags.contains(BufferFlags::JBDDIRTY) {
                    bstate.flags.remove(BufferFlags::JBDDIRTY);
                    bstate.flags.insert(BufferFlags::DIRTY);
                }
            }
            Some(next) => {
                let was_dirty = bstate.flags.contains(BufferFlags::JBDDIRTY);
                bstate.flags.remove(BufferFlags::JBDDIRTY);

                self.temp_unlink(id);
                let list = {
                    let jh = self.head_mut(id);
                    jh.transaction = Some(next);
                    jh.next_transaction = None;
                    if jh.modified {
                        BufferList::Metadata
                    } else {
                        BufferList::Reserved
                    }
                };
                self.file_buffer(id, next, list, bstate);

                if was_dirty {
                    bstate.flags.insert(BufferFlags::JBDDIRTY);
                }
            }
        }
    }

    /// 加入事务 `tid` 的 checkpoint 链表
    ///
    /// 事务必须已经在 checkpoint 队列中
    pub fn insert_checkpoint(&mut self, id: JournalHeadId, tid: Tid) {
        assert!(
            self.head(id).cp_transaction.is_none(),
            "buffer already on a checkpoint list"
        );
        let cp = self
            .checkpoint
            .iter_mut()
            .rev()
            .find(|cp| cp.tid == tid)
            .unwrap_or_else(|| panic!("transaction {} is not on the checkpoint queue", tid));
        cp.buffers.push(id);
        self.head_mut(id).cp_transaction = Some(tid);
    }

    /// 从 checkpoint 链表移除
    ///
    /// 对应 `__journal_remove_checkpoint()`：事务的 checkpoint 链表空了之后，
    /// 事务本身也从队列中删除。
    ///
    /// # 返回
    ///
    /// 事务因此被删除时返回 true
    pub fn remove_checkpoint(&mut self, id: JournalHeadId, bstate: &mut BufferState) -> bool {
        let Some(tid) = self.head_mut(id).cp_transaction.take() else {
            return false;
        };

        let mut dropped = false;
        if let Some(pos) = self.checkpoint.iter().position(|cp| cp.tid == tid) {
            let cp = &mut self.checkpoint[pos];
            cp.buffers.retain(|x| *x != id);
            if cp.buffers.is_empty() {
                self.checkpoint.remove(pos);
                log::debug!("[CHECKPOINT] transaction {} fully checkpointed", tid);
                dropped = true;
            }
        }

        self.maybe_release(id, bstate);
        dropped
    }
}
