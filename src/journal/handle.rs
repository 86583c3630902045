//! JBD Handle
//!
//! 对应内核 `transaction.c` 中的 `handle_t` 操作：
//! `journal_start()` / `journal_stop()` / `journal_extend()` / `journal_restart()`、
//! `journal_get_write_access()` / `journal_get_create_access()` / `journal_get_undo_access()`、
//! `journal_dirty_metadata()` / `journal_forget()` 以及 `revoke.c` 中的 `journal_revoke()`。
//!
//! # Credits
//!
//! handle 开始时从运行中事务预留 `nblocks` 个 credits。每个块在事务中第一次被
//! `dirty_metadata()` 时扣除一个，revoke 也扣除一个。handle 结束时归还没用完的部分。

use super::{
    checkpoint,
    jbd_buf::BufferList,
    jbd_journal::{JournalShared, JournalState},
    jbd_trans::{Tid, Transaction, TransactionState},
    JournalError,
};
use crate::{
    cache::{BufferFlags, BufferRef},
    error::{Error, ErrorKind, Result},
};
use std::{sync::Arc, time::Instant};

/// 写权限的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    /// 修改已有块
    Write,
    /// 新分配的块，内容由调用者整体写入
    Create,
    /// 需要保留已提交版本（例如位图）
    Undo,
}

/// 在运行中事务里预留 credits
///
/// 对应 `start_this_handle()`：
/// 1. journal 已中止（或有未确认的错误）时失败
/// 2. 没有运行中事务时新建一个
/// 3. 事务被锁定时等待它进入提交
/// 4. 事务装不下时请求提交并等待
/// 5. 日志空间不足时等待 checkpoint
fn start_this_handle(shared: &JournalShared, nblocks: u32) -> Result<Tid> {
    if nblocks > shared.max_tb {
        log::error!(
            "[TRANSACTION] handle wants {} credits but transactions hold at most {}",
            nblocks,
            shared.max_tb
        );
        return Err(JournalError::TooManyCredits(nblocks).into());
    }

    loop {
        let mut state = shared.state.lock();
        if state.refuses_handles() {
            return Err(JournalError::Aborted.into());
        }

        if state.running.is_none() {
            let tid = state.transaction_sequence;
            state.transaction_sequence = tid.wrapping_add(1);
            state.running = Some(Transaction::new(tid, shared.config.commit_interval));
            shared.lists.lock().transaction_mut(tid);
            log::debug!("[TRANSACTION] started transaction {}", tid);
        }

        let (tid, txn_state, outstanding) = match state.running.as_ref() {
            Some(t) => (t.tid, t.state, t.outstanding_credits),
            None => continue,
        };

        if txn_state == TransactionState::Locked {
            shared.wait_transaction_locked.wait(&mut state);
            continue;
        }

        if outstanding + nblocks > shared.max_tb {
            log::debug!(
                "[TRANSACTION] transaction {} is full ({} + {} credits), committing",
                tid,
                outstanding,
                nblocks
            );
            shared.log_start_commit(&mut state, tid);
            shared.wait_transaction_locked.wait(&mut state);
            continue;
        }

        if shared.space_left(&state) < state.space_needed(shared.max_tb) {
            drop(state);
            checkpoint::log_wait_for_space(shared)?;
            continue;
        }

        if let Some(t) = state.running.as_mut() {
            t.outstanding_credits += nblocks;
            t.updates += 1;
            t.handle_count += 1;
        }
        state.stats.handles_started += 1;
        log::trace!(
            "[TRANSACTION] handle joined transaction {} with {} credits",
            tid,
            nblocks
        );
        return Ok(tid);
    }
}

/// Journal handle
///
/// 对应内核 `handle_t`：一个原子操作在运行中事务里的空间预留。
///
/// handle 持有运行中事务的一个 update 计数，事务在所有 handle 结束之前不能提交。
/// `stop()` 或 drop 时结束。
pub struct Handle {
    shared: Arc<JournalShared>,

    /// 所属事务
    tid: Tid,

    /// 剩余的 buffer credits
    credits: u32,

    /// 嵌套深度
    nested: u32,

    /// 结束时同步提交
    sync: bool,

    /// 已结束
    stopped: bool,
}

impl Handle {
    pub(crate) fn start(shared: &Arc<JournalShared>, nblocks: u32) -> Result<Self> {
        let tid = start_this_handle(shared, nblocks)?;
        Ok(Self {
            shared: Arc::clone(shared),
            tid,
            credits: nblocks,
            nested: 0,
            sync: false,
            stopped: false,
        })
    }

    /// 所属事务的 tid
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// 剩余 credits
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// 结束时是否同步提交
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// 设置同步标志：`stop()` 时提交事务并等待完成
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    /// 当前嵌套深度
    pub fn nested_depth(&self) -> u32 {
        self.nested
    }

    /// 嵌套使用同一个 handle
    ///
    /// 对应同一线程再次调用 `journal_start()`：不预留新的 credits
    pub fn nest(&mut self) {
        self.nested += 1;
    }

    /// 结束一层嵌套
    pub fn stop_nested(&mut self) -> Result<()> {
        if self.nested == 0 {
            return Err(Error::new(ErrorKind::InvalidState, "Handle is not nested"));
        }
        self.nested -= 1;
        Ok(())
    }

    fn check_active(&self) -> Result<()> {
        if self.stopped {
            return Err(Error::new(ErrorKind::InvalidState, "Handle has been stopped"));
        }
        Ok(())
    }

    /// 取得修改已有块的权限
    ///
    /// 对应 `journal_get_write_access()`
    pub fn get_write_access(&mut self, bh: &BufferRef) -> Result<()> {
        self.do_get_write_access(bh, AccessKind::Write)
    }

    /// 取得新分配块的权限
    ///
    /// 对应 `journal_get_create_access()`
    pub fn get_create_access(&mut self, bh: &BufferRef) -> Result<()> {
        self.do_get_write_access(bh, AccessKind::Create)
    }

    /// 取得写权限，同时保存块的已提交版本
    ///
    /// 对应 `journal_get_undo_access()`。已提交版本通过 [`Handle::committed_data`] 读取，
    /// 直到事务提交完成。
    pub fn get_undo_access(&mut self, bh: &BufferRef) -> Result<()> {
        self.do_get_write_access(bh, AccessKind::Undo)
    }

    /// 对应 `do_get_write_access()`
    ///
    /// 块已属于提交中的事务时，当前 handle 不能改动它的链表归属，只能登记为
    /// `next_transaction`；如果提交还没有为它生成日志快照，先冻结一份当前数据。
    fn do_get_write_access(&mut self, bh: &BufferRef, kind: AccessKind) -> Result<()> {
        self.check_active()?;
        let blocknr = bh.blocknr();
        if blocknr > u32::MAX as u64 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Block number does not fit in a journal tag",
            ));
        }

        let shared = &*self.shared;
        let tid = self.tid;
        let mut bstate = bh.lock();
        if shared.is_aborted() {
            return Err(JournalError::Aborted.into());
        }

        let mut lists = shared.lists.lock();
        let id = lists.attach(bh, &mut bstate);

        if kind == AccessKind::Create {
            bstate.flags.insert(BufferFlags::UPTODATE);
        }

        // 重新使用被撤销的块
        if let Some(t) = lists.transactions.get_mut(&tid) {
            if t.revokes.remove(&blocknr) {
                log::debug!("[REVOKE] cancelled revoke of block {} in transaction {}", blocknr, tid);
            }
        }
        bstate.flags.remove(BufferFlags::REVOKED | BufferFlags::REVOKE_VALID);

        let (owner, next, list, has_frozen) = {
            let jh = lists.head(id);
            (jh.transaction, jh.next_transaction, jh.list, jh.frozen.is_some())
        };

        if owner != Some(tid) && next != Some(tid) {
            lists.head_mut(id).modified = false;
            match owner {
                Some(committing) => {
                    if (list == BufferList::Metadata || kind == AccessKind::Undo) && !has_frozen {
                        log::trace!(
                            "[TRANSACTION] freezing block {} owned by committing transaction {}",
                            blocknr,
                            committing
                        );
                        lists.head_mut(id).frozen = Some(Arc::new(bstate.data.to_vec()));
                    }
                    lists.head_mut(id).next_transaction = Some(tid);
                }
                None => {
                    lists.file_buffer(id, tid, BufferList::Reserved, &mut bstate);
                }
            }
        }

        if kind == AccessKind::Undo && lists.head(id).committed.is_none() {
            let committed = match &lists.head(id).frozen {
                Some(frozen) => Arc::clone(frozen),
                None => bstate.snapshot(),
            };
            lists.head_mut(id).committed = Some(committed);
        }

        lists.put(id, &mut bstate);
        Ok(())
    }

    /// 标记块已修改
    ///
    /// 对应 `journal_dirty_metadata()`：块在本事务中第一次被修改时扣除一个 credit
    pub fn dirty_metadata(&mut self, bh: &BufferRef) -> Result<()> {
        self.check_active()?;
        let tid = self.tid;
        let mut bstate = bh.lock();
        let Some(id) = bstate.journal_head else {
            return Err(JournalError::NotJournaled.into());
        };
        let mut lists = self.shared.lists.lock();

        let (owned, modified, list) = {
            let jh = lists.head(id);
            if jh.transaction != Some(tid) && jh.next_transaction != Some(tid) {
                return Err(JournalError::NotJournaled.into());
            }
            (jh.transaction == Some(tid), jh.modified, jh.list)
        };

        if !modified {
            if self.credits == 0 {
                log::warn!("[TRANSACTION] handle out of credits dirtying block {}", bh.blocknr());
                return Err(JournalError::NoCredits.into());
            }
            self.credits -= 1;
            lists.head_mut(id).modified = true;
        }

        if owned && list == BufferList::Metadata {
            return Ok(());
        }

        bstate.flags.remove(BufferFlags::DIRTY);
        bstate.flags.insert(BufferFlags::JBDDIRTY);

        // 提交完成后 refile 会把它放到本事务的 Metadata 链表
        if !owned {
            return Ok(());
        }

        lists.file_buffer(id, tid, BufferList::Metadata, &mut bstate);
        Ok(())
    }

    /// 放弃对块的修改（块已被释放）
    ///
    /// 对应 `journal_forget()`：
    /// - 块只属于本事务：撤回修改并归还 credit，还在等待 checkpoint 的块放到 Forget 链表，
    ///   提交后把它从 checkpoint 上摘下
    /// - 块属于提交中的事务：只取消本事务的登记
    pub fn forget(&mut self, bh: &BufferRef) -> Result<()> {
        self.check_active()?;
        let tid = self.tid;
        let mut bstate = bh.lock();
        let Some(id) = bstate.journal_head else {
            bstate.flags.remove(BufferFlags::DIRTY);
            return Ok(());
        };
        let mut lists = self.shared.lists.lock();

        let (owner, next, modified, on_checkpoint) = {
            let jh = lists.head(id);
            (jh.transaction, jh.next_transaction, jh.modified, jh.cp_transaction.is_some())
        };

        if owner == Some(tid) {
            bstate.flags.remove(BufferFlags::DIRTY | BufferFlags::JBDDIRTY);
            if modified {
                lists.head_mut(id).modified = false;
                self.credits += 1;
            }
            if on_checkpoint {
                lists.file_buffer(id, tid, BufferList::Forget, &mut bstate);
            } else {
                lists.unfile(id);
                lists.maybe_release(id, &mut bstate);
            }
        } else if owner.is_some() {
            if next == Some(tid) {
                let jh = lists.head_mut(id);
                jh.next_transaction = None;
                if modified {
                    jh.modified = false;
                    self.credits += 1;
                }
            }
        } else {
            bstate.flags.remove(BufferFlags::DIRTY);
        }

        log::trace!("[TRANSACTION] forgot block {} in transaction {}", bh.blocknr(), tid);
        Ok(())
    }

    /// 撤销块：之前事务中记录的这个块在恢复时不再重放
    ///
    /// 对应 `journal_revoke()`
    pub fn revoke(&mut self, blocknr: u64) -> Result<()> {
        self.check_active()?;
        if blocknr > u32::MAX as u64 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Block number does not fit in a revoke record",
            ));
        }

        let already = self
            .shared
            .lists
            .lock()
            .transactions
            .get(&self.tid)
            .is_some_and(|t| t.revokes.contains(&blocknr));
        if already {
            return Ok(());
        }
        if self.credits == 0 {
            return Err(JournalError::NoCredits.into());
        }

        if let Some(bh) = self.shared.cache.peek(blocknr) {
            let journaled = {
                let mut bstate = bh.lock();
                bstate
                    .flags
                    .insert(BufferFlags::REVOKED | BufferFlags::REVOKE_VALID);
                bstate.journal_head.is_some()
            };
            if journaled {
                self.forget(&bh)?;
            }
        }

        self.credits -= 1;
        self.shared
            .lists
            .lock()
            .transaction_mut(self.tid)
            .revokes
            .insert(blocknr);
        log::debug!("[REVOKE] revoked block {} in transaction {}", blocknr, self.tid);
        Ok(())
    }

    /// undo 访问保存的已提交数据
    pub fn committed_data(&self, bh: &BufferRef) -> Option<Arc<Vec<u8>>> {
        let bstate = bh.lock();
        let id = bstate.journal_head?;
        let lists = self.shared.lists.lock();
        lists.head(id).committed.clone()
    }

    /// 追加 credits
    ///
    /// 对应 `journal_extend()`
    ///
    /// # 返回
    ///
    /// 事务装得下时返回 true；返回 false 时调用者应改用 [`Handle::restart`]
    pub fn extend(&mut self, nblocks: u32) -> Result<bool> {
        self.check_active()?;
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        if state.is_aborted() {
            return Err(JournalError::Aborted.into());
        }

        let left = shared.space_left(&state);
        let Some(t) = state.running.as_mut() else {
            return Ok(false);
        };
        if t.tid != self.tid || t.state != TransactionState::Running {
            return Ok(false);
        }

        let wanted = t.outstanding_credits + nblocks;
        if wanted > shared.max_tb || wanted > left {
            log::debug!(
                "[TRANSACTION] cannot extend handle by {} credits in transaction {}",
                nblocks,
                t.tid
            );
            return Ok(false);
        }

        t.outstanding_credits = wanted;
        self.credits += nblocks;
        Ok(true)
    }

    /// 结束当前事务中的部分，在新事务里重新预留 `nblocks` 个 credits
    ///
    /// 对应 `journal_restart()`。失败后 handle 处于结束状态。
    pub fn restart(&mut self, nblocks: u32) -> Result<()> {
        self.check_active()?;
        {
            let shared = Arc::clone(&self.shared);
            let mut state = shared.state.lock();
            self.release_from_transaction(&mut state);
            shared.log_start_commit(&mut state, self.tid);
        }

        match start_this_handle(&self.shared, nblocks) {
            Ok(tid) => {
                log::debug!("[TRANSACTION] handle restarted {} -> {}", self.tid, tid);
                self.tid = tid;
                self.credits = nblocks;
                Ok(())
            }
            Err(err) => {
                self.stopped = true;
                Err(err)
            }
        }
    }

    /// 归还 credits，撤出 update 计数
    fn release_from_transaction(&mut self, state: &mut JournalState) {
        let credits = core::mem::take(&mut self.credits);
        if let Some(t) = state.running.as_mut().filter(|t| t.tid == self.tid) {
            t.outstanding_credits -= credits;
            t.updates -= 1;
            if self.sync {
                t.synchronous_commit = true;
            }
            if t.updates == 0 {
                self.shared.wait_updates.notify_all();
            }
        }
    }

    /// 结束 handle
    ///
    /// 对应 `journal_stop()`：同步 handle 或事务已到期时请求提交，
    /// 同步 handle 等待提交完成
    ///
    /// 嵌套的 handle 只结束最内层，handle 仍然有效；最外层结束后再调用
    /// 返回 `InvalidState`
    pub fn stop(&mut self) -> Result<()> {
        self.check_active()?;
        if self.nested > 0 {
            self.nested -= 1;
            log::trace!("[TRANSACTION] nested handle stopped, depth now {}", self.nested);
            return Ok(());
        }
        self.do_stop()
    }

    fn do_stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let shared = Arc::clone(&self.shared);
        let tid = self.tid;
        let aborted = {
            let mut state = shared.state.lock();
            let expired = state
                .running
                .as_ref()
                .is_some_and(|t| t.tid == tid && t.is_expired(Instant::now()));
            self.release_from_transaction(&mut state);
            if self.sync || expired {
                shared.log_start_commit(&mut state, tid);
            }
            state.is_aborted()
        };

        if self.sync && !aborted {
            shared.commit_and_wait(tid)?;
        }
        if aborted || shared.is_aborted() {
            return Err(JournalError::Aborted.into());
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(err) = self.do_stop() {
            log::warn!("[TRANSACTION] handle stop on drop failed: {}", err);
        }
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("tid", &self.tid)
            .field("credits", &self.credits)
            .field("nested", &self.nested)
            .field("sync", &self.sync)
            .finish()
    }
}
