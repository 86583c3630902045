//! Journal 事务提交
//!
//! 对应内核 `commit.c` 中的 `journal_commit_transaction()`
//!
//! # 提交流程
//!
//! 1. 锁定运行中事务，等待所有 handle 结束
//! 2. 释放只取得写权限、没有修改的块
//! 3. 事务进入提交状态，新的 handle 可以开始下一个事务
//! 4. 写 revoke 块
//! 5. 为每个修改过的块生成日志快照（需要时转义），写描述符块和数据块
//! 6. 刷新设备，写提交块，再刷新设备
//! 7. 修改过的块加入 checkpoint 链表，转交给下一个事务或者交还给 checkpoint 写回
//!
//! 提交块一定在该事务的所有描述符块和数据块落盘之后才写入。

use super::{
    checksum::{commit_timestamp, TransactionChecksum},
    jbd_buf::{BufferContent, BufferList, CheckpointTransaction, JournalHeadId, JournalLists},
    jbd_journal::{JournalShared, JournalState},
    jbd_trans::{Tid, TransactionState},
    types::*,
    JournalError,
};
use crate::{
    cache::{BufferFlags, BufferHead, BufferRef, BufferState},
    error::Result,
};
use std::sync::Arc;

/// `write_metadata_buffer()` 的结果
#[derive(Debug)]
pub(crate) struct MetadataWrite {
    /// 日志 buffer 的 journal head（在 Io 链表上）
    pub log_id: JournalHeadId,
    /// 写往日志的 buffer
    pub log_bh: BufferRef,
    /// 数据以 JBD magic 开头，写入前已经转义
    pub escaped: bool,
    /// 为这次写入新建了冻结副本
    pub copied: bool,
}

/// 为一个修改过的块生成日志快照
///
/// 对应 `journal_write_metadata_buffer()`：
/// 1. 有冻结副本时用冻结副本，否则用当前数据
/// 2. 数据以 JBD magic 开头时，需要转义（写入的副本前 4 字节清零）；
///    当前数据会先冻结一份，原始数据和冻结副本都不被修改
/// 3. 原始块放到 Shadow 链表，日志 buffer 放到 Io 链表
///
/// 调用者持有原始块的 per-buffer 锁和 lists 锁
pub(crate) fn write_metadata_buffer(
    lists: &mut JournalLists,
    id: JournalHeadId,
    bstate: &mut BufferState,
    tid: Tid,
    log_blocknr: u64,
) -> MetadataWrite {
    let content = match lists.head(id).frozen.as_ref() {
        Some(frozen) => BufferContent::Frozen(Arc::clone(frozen)),
        None => BufferContent::Live(bstate.snapshot()),
    };

    let do_escape = starts_with_magic(content.data());
    let need_copy_out = do_escape;

    let mut copied = false;
    if need_copy_out && !content.is_frozen() {
        lists.head_mut(id).frozen = Some(Arc::new(content.data().to_vec()));
        copied = true;
    }

    let log_data = if do_escape {
        let mut escaped = content.data().to_vec();
        escaped[..4].fill(0);
        Arc::new(escaped)
    } else {
        Arc::clone(content.data())
    };

    let log_bh = Arc::new(BufferHead::from_shared(
        log_blocknr,
        log_data,
        BufferFlags::UPTODATE | BufferFlags::DIRTY,
    ));

    lists.file_buffer(id, tid, BufferList::Shadow, bstate);
    let log_id = lists.attach_log_buffer(Arc::clone(&log_bh));
    lists.file_buffer(log_id, tid, BufferList::Io, &mut log_bh.lock());

    MetadataWrite {
        log_id,
        log_bh,
        escaped: do_escape,
        copied,
    }
}

/// 分配下一个日志块，返回物理块号
///
/// 对应 `journal_next_log_block()`
pub(crate) fn next_log_block(shared: &JournalShared) -> Result<u64> {
    let logical = {
        let mut state = shared.state.lock();
        let block = state.ring.next_log_block();
        if let Some(t) = state.committing.as_mut() {
            t.outstanding_credits = t.outstanding_credits.saturating_sub(1);
        }
        state.stats.blocks_logged += 1;
        block
    };
    Ok(shared.fs.bmap(logical)?)
}

/// 一个描述符块以及它描述的日志 buffer
struct DescriptorBatch {
    phys: u64,
    data: Vec<u8>,
    writes: Vec<MetadataWrite>,
}

/// 提交运行中的事务
///
/// 对应 `journal_commit_transaction()`。没有运行中事务时什么也不做。
/// 任何一步失败都会中止 journal。
pub(crate) fn commit_transaction(shared: &JournalShared) -> Result<()> {
    let _commit = shared.commit_mutex.lock();

    let tid = {
        let mut state = shared.state.lock();
        let Some(t) = state.running.as_mut() else {
            return Ok(());
        };
        t.state = TransactionState::Locked;
        let tid = t.tid;
        log::debug!("[COMMIT] locking transaction {}", tid);

        while state.running.as_ref().is_some_and(|t| t.updates > 0) && !state.is_aborted() {
            shared.wait_updates.wait(&mut state);
        }
        if state.is_aborted() {
            let idle = state.running.as_ref().is_some_and(|t| t.updates == 0);
            drop(state);
            if idle {
                abandon_transaction(shared, tid);
            }
            return Err(JournalError::Aborted.into());
        }
        tid
    };

    match do_commit(shared, tid) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::error!("[COMMIT] commit of transaction {} failed: {}", tid, err);
            shared.abort(err.errno());
            abandon_transaction(shared, tid);
            Err(JournalError::Aborted.into())
        }
    }
}

fn do_commit(shared: &JournalShared, tid: Tid) -> Result<()> {
    let dev = shared.fs.dev();
    let block_size = shared.fs.block_size();

    shared.write_tail_if_flushed()?;
    release_reserved(shared, tid);

    {
        let mut state = shared.state.lock();
        let head = state.ring.head();
        let mut t = state
            .running
            .take()
            .ok_or(JournalError::Aborted)?;
        t.state = TransactionState::Flush;
        t.log_start = head;
        state.committing = Some(t);
    }
    shared.wait_transaction_locked.notify_all();
    log::debug!("[COMMIT] transaction {} entering flush", tid);

    // revoke 块
    let revokes: Vec<u32> = shared
        .lists
        .lock()
        .transactions
        .get(&tid)
        .map(|t| t.revokes.iter().map(|b| *b as u32).collect())
        .unwrap_or_default();
    for chunk in revokes.chunks(revoke_capacity(block_size)) {
        let mut buf = vec![0u8; block_size];
        encode_revoke_block(&mut buf, tid, chunk);
        let phys = next_log_block(shared)?;
        dev.write_block(phys, &buf)?;
        shared.state.lock().stats.revoke_blocks += 1;
        log::trace!("[COMMIT] wrote revoke block with {} records", chunk.len());
    }

    set_committing_state(shared, TransactionState::Commit);

    // 生成日志快照
    let metadata: Vec<(JournalHeadId, BufferRef)> = {
        let lists = shared.lists.lock();
        lists
            .transactions
            .get(&tid)
            .map(|t| {
                t.metadata
                    .iter()
                    .map(|id| (*id, Arc::clone(&lists.head(*id).bh)))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut batches = Vec::new();
    let mut escaped_blocks = 0;
    for chunk in metadata.chunks(descriptor_capacity(block_size)) {
        let desc_phys = next_log_block(shared)?;
        let mut desc = vec![0u8; block_size];
        JbdHeader::new(BlockType::Descriptor, tid).encode(&mut desc);
        let mut offset = JBD_HEADER_SIZE;
        let mut writes = Vec::with_capacity(chunk.len());

        for (i, (id, bh)) in chunk.iter().enumerate() {
            if shared.is_aborted() {
                return Err(JournalError::Aborted.into());
            }

            let mut bstate = bh.lock();
            let phys = next_log_block(shared)?;
            let write = {
                let mut lists = shared.lists.lock();
                debug_assert_eq!(lists.head(*id).transaction, Some(tid));
                write_metadata_buffer(&mut lists, *id, &mut bstate, tid, phys)
            };
            drop(bstate);

            let mut flags = TagFlags::empty();
            if i > 0 {
                flags |= TagFlags::SAME_UUID;
            }
            if write.escaped {
                flags |= TagFlags::ESCAPE;
                escaped_blocks += 1;
            }
            if i + 1 == chunk.len() {
                flags |= TagFlags::LAST_TAG;
            }
            BlockTag {
                blocknr: bh.blocknr() as u32,
                flags,
            }
            .encode(&mut desc[offset..]);
            offset += JBD_TAG_SIZE;
            if i == 0 {
                desc[offset..offset + UUID_SIZE].copy_from_slice(&shared.uuid);
                offset += UUID_SIZE;
            }

            writes.push(write);
        }

        batches.push(DescriptorBatch {
            phys: desc_phys,
            data: desc,
            writes,
        });
    }

    // 写描述符块和数据块
    let mut checksum = TransactionChecksum::new(shared.config.checksum_fn, shared.checksum);
    for batch in &batches {
        checksum.update(&batch.data);
        dev.write_block(batch.phys, &batch.data)?;
        for write in &batch.writes {
            let data = write.log_bh.snapshot();
            checksum.update(&data);
            dev.write_block(write.log_bh.blocknr(), &data)?;
        }
    }
    dev.flush()?;

    finish_io(shared, tid, &batches);

    // 提交块
    if shared.is_aborted() {
        return Err(JournalError::Aborted.into());
    }
    set_committing_state(shared, TransactionState::CommitRecord);

    let mut header = CommitHeader::new(tid);
    if let Some(crc) = checksum.value() {
        header.set_crc32(crc);
    }
    let (sec, nsec) = commit_timestamp();
    header.commit_sec = sec;
    header.commit_nsec = nsec;

    let mut buf = vec![0u8; block_size];
    header.encode(&mut buf);
    let phys = next_log_block(shared)?;
    dev.write_block(phys, &buf)?;
    dev.flush()?;

    let logged = metadata.len();
    finish_commit(shared, tid);

    {
        let mut state = shared.state.lock();
        state.stats.escaped_blocks += escaped_blocks;
    }
    log::info!(
        "[COMMIT] transaction {} committed: {} blocks, {} revokes",
        tid,
        logged,
        revokes.len()
    );
    Ok(())
}

fn set_finished(state: &mut JournalState) {
    if let Some(t) = state.committing.as_mut() {
        t.state = TransactionState::Finished;
    }
    state.committing = None;
}

fn set_committing_state(shared: &JournalShared, new_state: TransactionState) {
    if let Some(t) = shared.state.lock().committing.as_mut() {
        t.state = new_state;
    }
}

/// 按 per-buffer 锁 → lists 锁的顺序处理事务某个链表上的所有块
fn for_each_on_list(
    shared: &JournalShared,
    tid: Tid,
    list: BufferList,
    mut f: impl FnMut(&mut JournalLists, JournalHeadId, &mut BufferState),
) {
    let entries: Vec<(JournalHeadId, BufferRef)> = {
        let lists = shared.lists.lock();
        let Some(t) = lists.transactions.get(&tid) else {
            return;
        };
        let ids = match list {
            BufferList::Reserved => &t.reserved,
            BufferList::Metadata => &t.metadata,
            BufferList::Forget => &t.forget,
            BufferList::Shadow => &t.shadow,
            BufferList::Io => &t.io,
            BufferList::None => return,
        };
        ids.iter()
            .map(|id| (*id, Arc::clone(&lists.head(*id).bh)))
            .collect()
    };

    for (id, bh) in entries {
        let mut bstate = bh.lock();
        let mut lists = shared.lists.lock();
        if bstate.journal_head != Some(id) {
            continue;
        }
        let jh = lists.head(id);
        if jh.transaction != Some(tid) || jh.list != list {
            continue;
        }
        f(&mut *lists, id, &mut bstate);
    }
}

/// 释放只取得了写权限、没有修改的块
fn release_reserved(shared: &JournalShared, tid: Tid) {
    for_each_on_list(shared, tid, BufferList::Reserved, |lists, id, bstate| {
        lists.refile(id, bstate);
        lists.maybe_release(id, bstate);
    });
}

/// 日志写入完成：释放日志 buffer，原始块从 Shadow 移到 Forget
///
/// 对应 `journal_commit_transaction()` 中等待 `t_iobuf_list` / `t_shadow_list` 的部分
fn finish_io(shared: &JournalShared, tid: Tid, batches: &[DescriptorBatch]) {
    {
        let mut lists = shared.lists.lock();
        for write in batches.iter().flat_map(|b| b.writes.iter()) {
            lists.free_log_buffer(write.log_id);
        }
    }

    for_each_on_list(shared, tid, BufferList::Shadow, |lists, id, bstate| {
        lists.file_buffer(id, tid, BufferList::Forget, bstate);
    });
}

/// 提交完成后的处理
///
/// Forget 链表上的块：
/// - 仍然 JBDDIRTY：加入本事务的 checkpoint 链表，然后 refile
///   （有下一个事务就转交，否则交给 checkpoint 写回）
/// - 已经被 forget：直接 refile，不需要写回
///
/// 在更早事务 checkpoint 链表上的旧版本不再需要，一并移除。
fn finish_commit(shared: &JournalShared, tid: Tid) {
    let log_start = shared
        .state
        .lock()
        .committing
        .as_ref()
        .map_or(0, |t| t.log_start);
    shared.lists.lock().checkpoint.push_back(CheckpointTransaction {
        tid,
        log_start,
        buffers: Vec::new(),
    });

    let aborted = shared.is_aborted();
    for_each_on_list(shared, tid, BufferList::Forget, |lists, id, bstate| {
        {
            let jh = lists.head_mut(id);
            if jh.committed.is_some() {
                jh.committed = jh.frozen.take();
            } else {
                jh.frozen = None;
            }
        }

        lists.remove_checkpoint(id, bstate);
        if bstate.flags.contains(BufferFlags::JBDDIRTY) {
            lists.insert_checkpoint(id, tid);
            if aborted {
                bstate.flags.remove(BufferFlags::JBDDIRTY);
            }
        }
        lists.refile(id, bstate);
        lists.maybe_release(id, bstate);
    });

    {
        let mut lists = shared.lists.lock();
        if lists
            .checkpoint
            .back()
            .is_some_and(|cp| cp.tid == tid && cp.buffers.is_empty())
        {
            lists.checkpoint.pop_back();
        }
        if let Some(t) = lists.transactions.remove(&tid) {
            debug_assert!(t.is_empty(), "buffers left on committed transaction");
        }
    }

    {
        let mut state = shared.state.lock();
        set_finished(&mut state);
        state.commit_sequence = tid;
        state.stats.transactions_committed += 1;
    }
    shared.wait_done_commit.notify_all();
}

/// journal 中止后丢弃事务
///
/// 日志 buffer 全部释放，原始块清除 JBDDIRTY 后 refile，不进入 checkpoint
fn abandon_transaction(shared: &JournalShared, tid: Tid) {
    log::warn!("[COMMIT] abandoning transaction {}", tid);

    {
        let mut lists = shared.lists.lock();
        let io: Vec<JournalHeadId> = lists
            .transactions
            .get(&tid)
            .map(|t| t.io.clone())
            .unwrap_or_default();
        for id in io {
            lists.free_log_buffer(id);
        }
    }

    for list in [
        BufferList::Reserved,
        BufferList::Metadata,
        BufferList::Shadow,
        BufferList::Forget,
    ] {
        for_each_on_list(shared, tid, list, |lists, id, bstate| {
            bstate.flags.remove(BufferFlags::JBDDIRTY);
            lists.head_mut(id).frozen = None;
            lists.refile(id, bstate);
            lists.maybe_release(id, bstate);
        });
    }

    shared.lists.lock().transactions.remove(&tid);

    {
        let mut state = shared.state.lock();
        if state.running.as_ref().is_some_and(|t| t.tid == tid) {
            state.running = None;
        }
        if state.committing.as_ref().is_some_and(|t| t.tid == tid) {
            state.committing = None;
        }
    }
    shared.wait_transaction_locked.notify_all();
    shared.wait_done_commit.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journaled_buffer(lists: &mut JournalLists, blocknr: u64, data: Vec<u8>) -> (BufferRef, JournalHeadId) {
        let bh = Arc::new(BufferHead::new(
            blocknr,
            data,
            BufferFlags::UPTODATE | BufferFlags::JBDDIRTY,
        ));
        let id = {
            let mut state = bh.lock();
            let id = lists.attach(&bh, &mut state);
            lists.file_buffer(id, 1, BufferList::Metadata, &mut state);
            id
        };
        (bh, id)
    }

    #[test]
    fn test_plain_block_shares_live_data() {
        let mut lists = JournalLists::new();
        let (bh, id) = journaled_buffer(&mut lists, 100, vec![7u8; 64]);

        let write = write_metadata_buffer(&mut lists, id, &mut bh.lock(), 1, 20);
        assert!(!write.escaped);
        assert!(!write.copied);
        assert_eq!(write.log_bh.blocknr(), 20);
        assert_eq!(*write.log_bh.snapshot(), vec![7u8; 64]);

        assert_eq!(lists.head(id).list, BufferList::Shadow);
        assert_eq!(lists.transactions[&1].io, vec![write.log_id]);

        // 之后修改原始块不影响日志 buffer
        bh.with_data_mut(|d| d[0] = 1);
        assert_eq!(write.log_bh.snapshot()[0], 7);
    }

    #[test]
    fn test_escape_copies_and_zeroes_magic() {
        let mut lists = JournalLists::new();
        let mut data = vec![0xABu8; 64];
        data[..4].copy_from_slice(&JBD_MAGIC_NUMBER.to_be_bytes());
        let (bh, id) = journaled_buffer(&mut lists, 100, data.clone());

        let first = write_metadata_buffer(&mut lists, id, &mut bh.lock(), 1, 20);
        assert!(first.escaped);
        assert!(first.copied);
        assert_eq!(&first.log_bh.snapshot()[..4], &[0, 0, 0, 0]);
        assert_eq!(&first.log_bh.snapshot()[4..], &data[4..]);

        // 原始数据和冻结副本都保持原样
        assert_eq!(*bh.snapshot(), data);
        assert_eq!(lists.head(id).frozen.as_deref(), Some(&data));

        // 再次调用复用冻结副本
        let second = write_metadata_buffer(&mut lists, id, &mut bh.lock(), 1, 21);
        assert!(second.escaped);
        assert!(!second.copied);
        assert_eq!(*second.log_bh.snapshot(), *first.log_bh.snapshot());
    }

    #[test]
    fn test_frozen_copy_wins_over_live_data() {
        let mut lists = JournalLists::new();
        let (bh, id) = journaled_buffer(&mut lists, 100, vec![1u8; 64]);
        lists.head_mut(id).frozen = Some(Arc::new(vec![2u8; 64]));

        let write = write_metadata_buffer(&mut lists, id, &mut bh.lock(), 1, 30);
        assert_eq!(*write.log_bh.snapshot(), vec![2u8; 64]);
        assert!(!write.copied);
    }
}
