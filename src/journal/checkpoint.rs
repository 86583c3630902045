//! Journal 检查点管理
//!
//! 对应内核 `checkpoint.c`：把已提交事务的块写回原始位置，然后推进日志尾部释放空间。
//!
//! checkpoint 队列严格按 tid 顺序处理：只有最旧的事务全部写回之后，
//! 日志尾部才能越过它。

use super::{jbd_journal::JournalShared, jbd_trans::Tid, JournalError, JournalFlags};
use crate::{
    cache::{BufferFlags, BufferRef},
    error::{Error, Result},
};
use std::sync::Arc;

/// 对最旧的 checkpoint 事务做一轮写回
///
/// 对应 `log_do_checkpoint()`，调用者持有 checkpoint_mutex
///
/// # 检查点流程
///
/// 1. 先尝试推进日志尾部，能释放空间就直接返回
/// 2. 遍历最旧事务的 checkpoint 链表：
///    - 块又被更新的事务接管：提交那个事务并等待，它会把块从这里摘走
///    - 干净的块：直接移除
///    - 脏块：写回
/// 3. 刷新设备后移除已写回的块，再推进日志尾部
pub(crate) fn log_do_checkpoint(shared: &JournalShared) -> Result<()> {
    if shared.is_aborted() {
        return Err(JournalError::Aborted.into());
    }
    if cleanup_journal_tail(shared)? {
        return Ok(());
    }

    let (tid, entries) = {
        let lists = shared.lists.lock();
        let Some(cp) = lists.checkpoint.front() else {
            return Ok(());
        };
        let entries: Vec<(_, BufferRef)> = cp
            .buffers
            .iter()
            .map(|id| (*id, Arc::clone(&lists.head(*id).bh)))
            .collect();
        (cp.tid, entries)
    };

    // 提交还在把块挂到这个事务上
    let committing = shared.state.lock().committing.as_ref().map(|t| t.tid);
    if committing == Some(tid) {
        return shared.log_wait_commit(tid);
    }

    log::debug!(
        "[CHECKPOINT] checkpointing transaction {} ({} buffers)",
        tid,
        entries.len()
    );

    let mut to_sync = Vec::new();
    let mut owner = None;
    for (id, bh) in &entries {
        let mut bstate = bh.lock();
        let mut lists = shared.lists.lock();
        if bstate.journal_head != Some(*id) || lists.head(*id).cp_transaction != Some(tid) {
            continue;
        }
        if let Some(newer) = lists.head(*id).transaction {
            owner = Some(newer);
            break;
        }
        if bstate.flags.contains(BufferFlags::DIRTY) {
            to_sync.push(Arc::clone(bh));
        } else {
            lists.remove_checkpoint(*id, &mut bstate);
        }
    }

    if let Some(newer) = owner {
        log::debug!(
            "[CHECKPOINT] buffer of transaction {} owned by transaction {}, committing it",
            tid,
            newer
        );
        return shared.commit_and_wait(newer);
    }

    if !to_sync.is_empty() {
        let dev = shared.fs.dev();
        for bh in &to_sync {
            if let Err(err) = shared.cache.sync_buffer(dev, bh) {
                log::error!("[CHECKPOINT] write back of block {} failed: {}", bh.blocknr(), err);
                shared.abort(err.errno());
                return Err(err);
            }
        }
        if let Err(err) = dev.flush() {
            shared.abort(err.errno());
            return Err(err);
        }

        for (id, bh) in &entries {
            let mut bstate = bh.lock();
            let mut lists = shared.lists.lock();
            if bstate.journal_head != Some(*id) {
                continue;
            }
            let jh = lists.head(*id);
            if jh.cp_transaction == Some(tid)
                && jh.transaction.is_none()
                && !bstate.flags.contains(BufferFlags::DIRTY)
            {
                lists.remove_checkpoint(*id, &mut bstate);
            }
        }
    }

    shared.state.lock().stats.checkpoints += 1;
    cleanup_journal_tail(shared)?;
    Ok(())
}

/// 推进日志尾部
///
/// 对应 `cleanup_journal_tail()`：日志中最旧的仍然需要的事务决定新的尾部。
/// 先把新尾部写入 superblock，再在内存中释放空间。
///
/// # 返回
///
/// 尾部向前移动时返回 true
pub(crate) fn cleanup_journal_tail(shared: &JournalShared) -> Result<bool> {
    let _commit = shared.commit_mutex.lock();

    let (first_tid, blocknr, empty, flushed, errno) = {
        let state = shared.state.lock();
        let lists = shared.lists.lock();
        let (first_tid, blocknr): (Tid, u32) = if let Some(cp) = lists.checkpoint.front() {
            (cp.tid, cp.log_start)
        } else if let Some(t) = state.committing.as_ref() {
            (t.tid, t.log_start)
        } else if let Some(t) = state.running.as_ref() {
            (t.tid, state.ring.head())
        } else {
            (state.transaction_sequence, state.ring.head())
        };

        if state.tail_sequence == first_tid {
            return Ok(false);
        }
        (
            first_tid,
            blocknr,
            first_tid == state.transaction_sequence,
            state.flags.contains(JournalFlags::FLUSHED),
            state.errno,
        )
    };

    if !flushed {
        let start = if empty { 0 } else { blocknr };
        if let Err(err) = shared.write_superblock(start, first_tid, errno) {
            shared.abort(err.errno());
            return Err(err);
        }
    }

    let mut state = shared.state.lock();
    let freed = state.ring.advance_tail(blocknr);
    state.tail_sequence = first_tid;
    if empty {
        state.flags.insert(JournalFlags::FLUSHED);
    }
    log::debug!(
        "[CHECKPOINT] log tail moved to block {} (transaction {}), {} blocks freed",
        blocknr,
        first_tid,
        freed
    );
    Ok(true)
}

/// 写回并摘下不再属于任何事务的 checkpoint 块，释放它们占用的缓存
///
/// 块缓存满时由持有 handle 的线程调用，所以不拿 checkpoint_mutex / commit_mutex，
/// 也不等待提交：还被运行中或提交中事务持有的块原样留下。
/// 日志尾部留给下一次 `cleanup_journal_tail()` 推进。
///
/// # 返回
///
/// 从 checkpoint 链表上摘下的块数
pub(crate) fn release_checkpointed_buffers(shared: &JournalShared) -> Result<usize> {
    if shared.is_aborted() {
        return Err(JournalError::Aborted.into());
    }

    let entries: Vec<(_, Tid, BufferRef)> = {
        let lists = shared.lists.lock();
        let mut entries = Vec::new();
        for cp in &lists.checkpoint {
            for id in &cp.buffers {
                entries.push((*id, cp.tid, Arc::clone(&lists.head(*id).bh)));
            }
        }
        entries
    };

    let mut released = 0;
    let mut to_sync = Vec::new();
    for (id, tid, bh) in &entries {
        let mut bstate = bh.lock();
        let mut lists = shared.lists.lock();
        if bstate.journal_head != Some(*id) {
            continue;
        }
        let jh = lists.head(*id);
        if jh.cp_transaction != Some(*tid) || jh.transaction.is_some() {
            continue;
        }
        if bstate.flags.contains(BufferFlags::DIRTY) {
            to_sync.push((*id, *tid, Arc::clone(bh)));
        } else {
            lists.remove_checkpoint(*id, &mut bstate);
            released += 1;
        }
    }

    if !to_sync.is_empty() {
        let dev = shared.fs.dev();
        for (_, _, bh) in &to_sync {
            if let Err(err) = shared.cache.sync_buffer(dev, bh) {
                log::error!("[CHECKPOINT] write back of block {} failed: {}", bh.blocknr(), err);
                shared.abort(err.errno());
                return Err(err);
            }
        }
        if let Err(err) = dev.flush() {
            shared.abort(err.errno());
            return Err(err);
        }

        for (id, tid, bh) in &to_sync {
            let mut bstate = bh.lock();
            let mut lists = shared.lists.lock();
            if bstate.journal_head != Some(*id) {
                continue;
            }
            let jh = lists.head(*id);
            if jh.cp_transaction == Some(*tid)
                && jh.transaction.is_none()
                && !bstate.flags.contains(BufferFlags::DIRTY)
            {
                lists.remove_checkpoint(*id, &mut bstate);
                released += 1;
            }
        }
    }

    log::debug!("[CHECKPOINT] released {} checkpointed buffers", released);
    Ok(released)
}

/// 等待日志空间
///
/// 对应 `__log_wait_for_space()`：依次尝试 checkpoint、推进尾部、等待提交完成；
/// 都无法释放空间时 journal 中止
pub(crate) fn log_wait_for_space(shared: &JournalShared) -> Result<()> {
    let _cp = shared.checkpoint_mutex.lock();
    loop {
        {
            let state = shared.state.lock();
            if state.is_aborted() {
                return Err(JournalError::Aborted.into());
            }
            if shared.space_left(&state) >= state.space_needed(shared.max_tb) {
                return Ok(());
            }
        }

        if !shared.lists.lock().checkpoint.is_empty() {
            log_do_checkpoint(shared)?;
            continue;
        }
        if cleanup_journal_tail(shared)? {
            continue;
        }

        let committing = shared.state.lock().committing.as_ref().map(|t| t.tid);
        if let Some(tid) = committing {
            shared.log_wait_commit(tid)?;
            continue;
        }

        log::error!("[CHECKPOINT] journal is full and nothing can be checkpointed");
        shared.abort(Error::from(JournalError::NoSpace).errno());
        return Err(JournalError::NoSpace.into());
    }
}
