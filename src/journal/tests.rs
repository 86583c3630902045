//! Journal 端到端测试
//!
//! 在内存设备上运行完整的 handle → 提交 → checkpoint / 崩溃 → 恢复流程

use super::*;
use crate::{
    block::{IoEvent, MemoryDevice},
    cache::BufferFlags,
    error::{ErrorKind, Result},
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

const BS: u32 = 1024;
const LOG: core::ops::Range<u32> = 10..74;

fn device() -> Arc<MemoryDevice> {
    Arc::new(MemoryDevice::new(BS, 1024))
}

fn create(mem: &Arc<MemoryDevice>, config: JournalConfig) -> Journal {
    Journal::create(mem.clone(), LogMapping::Linear { offset: 0 }, LOG, config).unwrap()
}

fn load(mem: &Arc<MemoryDevice>) -> Result<Journal> {
    Journal::load(mem.clone(), LogMapping::Linear { offset: 0 }, JournalConfig::default())
}

fn disk_superblock(mem: &MemoryDevice, phys: u64) -> JournalSuperblock {
    JournalSuperblock::decode(&mem.block(phys)).unwrap()
}

/// 同步写入一个块，返回事务 tid
fn write_sync(journal: &Journal, blocknr: u64, content: &[u8]) -> Result<Tid> {
    let mut handle = journal.start_handle(1)?;
    let bh = journal.get_buffer(blocknr)?;
    handle.get_write_access(&bh)?;
    bh.with_data_mut(|d| d[..content.len()].copy_from_slice(content));
    handle.dirty_metadata(&bh)?;
    let tid = handle.tid();
    handle.set_sync(true);
    handle.stop()?;
    Ok(tid)
}

#[test]
fn test_committed_transaction_survives_crash() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let tid = write_sync(&journal, 500, b"AAAA").unwrap();
    assert_eq!(tid, 1);
    assert_eq!(journal.commit_sequence(), 1);
    // 只写进了日志
    assert_eq!(&mem.block(500)[..4], &[0u8; 4]);

    // 崩溃：不 checkpoint，不更新 superblock
    drop(journal);
    assert_eq!(disk_superblock(&mem, 0).start, 10);

    let journal = load(&mem).unwrap();
    assert_eq!(&mem.block(500)[..4], b"AAAA");

    let info = *journal.recovery_info();
    assert_eq!(info.start_transaction, 1);
    assert_eq!(info.end_transaction, 2);
    assert_eq!(info.nr_replays, 1);

    // 描述符块、数据块、提交块之后
    assert_eq!(journal.log_state().tail, 13);
    assert_eq!(journal.log_state().head, 13);

    let sb = disk_superblock(&mem, 0);
    assert_eq!(sb.start, 0);
    assert_eq!(sb.sequence, 2);

    // 恢复后从 tid 2 继续
    assert_eq!(write_sync(&journal, 501, b"BBBB").unwrap(), 2);
    journal.destroy().unwrap();
}

#[test]
fn test_uncommitted_transaction_is_discarded() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(1).unwrap();
    let bh = journal.get_buffer(500).unwrap();
    handle.get_write_access(&bh).unwrap();
    bh.with_data_mut(|d| d[..4].copy_from_slice(b"CCCC"));
    handle.dirty_metadata(&bh).unwrap();
    handle.stop().unwrap();

    drop(journal);

    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_replays, 0);
    assert_eq!(&mem.block(500)[..4], &[0u8; 4]);
}

#[test]
fn test_clean_unmount_needs_no_recovery() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());
    write_sync(&journal, 500, b"DDDD").unwrap();
    journal.destroy().unwrap();

    assert_eq!(&mem.block(500)[..4], b"DDDD");
    let sb = disk_superblock(&mem, 0);
    assert_eq!(sb.start, 0);
    assert_eq!(sb.sequence, 2);

    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_replays, 0);
    assert_eq!(journal.recovery_info().end_transaction, 2);
}

#[test]
fn test_wal_write_order() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());
    mem.clear_events();

    write_sync(&journal, 500, b"EEEE").unwrap();

    // superblock 记录尾部 → 描述符块、数据块 → barrier → 提交块 → barrier
    assert_eq!(
        mem.events(),
        vec![
            IoEvent::Write(0),
            IoEvent::Flush,
            IoEvent::Write(10),
            IoEvent::Write(11),
            IoEvent::Flush,
            IoEvent::Write(12),
            IoEvent::Flush,
        ]
    );
}

#[test]
fn test_concurrent_handles_share_journal_head() {
    let mem = device();
    let journal = Arc::new(create(&mem, JournalConfig::default()));
    let bh = journal.get_buffer(42).unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let threads: Vec<_> = (1..=2u8)
        .map(|i| {
            let journal = Arc::clone(&journal);
            let bh = Arc::clone(&bh);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                let mut handle = journal.start_handle(1).unwrap();
                let tid = handle.tid();
                // 两个线程改同一段数据，结束顺序在锁内记录
                let mut order = order.lock();
                handle.get_write_access(&bh).unwrap();
                bh.with_data_mut(|d| d[..4].fill(i));
                handle.dirty_metadata(&bh).unwrap();
                handle.stop().unwrap();
                order.push(i);
                tid
            })
        })
        .collect();
    let tids: Vec<Tid> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(tids[0], tids[1]);

    {
        let lists = journal.shared().lists.lock();
        assert_eq!(lists.len(), 1);
        let id = lists.lookup(42).unwrap();
        assert_eq!(lists.transactions[&tids[0]].metadata, vec![id]);
    }

    journal.request_commit(true).unwrap();
    journal.flush().unwrap();

    let order = order.lock();
    assert_eq!(order.len(), 2);
    let last = order[1];
    assert_eq!(&mem.block(42)[..4], &[last; 4]);
}

#[test]
fn test_committed_revoke_blocks_replay() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    write_sync(&journal, 300, b"OLD!").unwrap();

    let mut handle = journal.start_handle(1).unwrap();
    handle.revoke(300).unwrap();
    assert_eq!(handle.credits(), 0);
    // 重复撤销不再扣 credit
    handle.revoke(300).unwrap();
    handle.set_sync(true);
    handle.stop().unwrap();
    assert_eq!(journal.stats().revoke_blocks, 1);

    drop(journal);

    let journal = load(&mem).unwrap();
    let info = journal.recovery_info();
    assert_eq!(info.nr_revokes, 1);
    assert_eq!(info.nr_revoke_hits, 1);
    assert_eq!(info.nr_replays, 0);
    assert_eq!(&mem.block(300)[..4], &[0u8; 4]);
}

#[test]
fn test_uncommitted_revoke_does_not_block_replay() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    write_sync(&journal, 300, b"KEEP").unwrap();

    let mut handle = journal.start_handle(1).unwrap();
    handle.revoke(300).unwrap();
    handle.stop().unwrap();

    drop(journal);

    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_revoke_hits, 0);
    assert_eq!(&mem.block(300)[..4], b"KEEP");
}

#[test]
fn test_write_access_cancels_revoke() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(2).unwrap();
    handle.revoke(310).unwrap();
    let bh = journal.get_buffer(310).unwrap();
    handle.get_write_access(&bh).unwrap();
    assert!(!bh.flags().contains(BufferFlags::REVOKED));
    bh.with_data_mut(|d| d[..4].copy_from_slice(b"NEW!"));
    handle.dirty_metadata(&bh).unwrap();
    handle.set_sync(true);
    handle.stop().unwrap();
    assert_eq!(journal.stats().revoke_blocks, 0);

    drop(journal);
    load(&mem).unwrap();
    assert_eq!(&mem.block(310)[..4], b"NEW!");
}

#[test]
fn test_escaped_block_round_trip() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut content = vec![0x5Au8; BS as usize];
    content[..4].copy_from_slice(&JBD_MAGIC_NUMBER.to_be_bytes());
    write_sync(&journal, 600, &content).unwrap();
    assert_eq!(journal.stats().escaped_blocks, 1);

    // 日志里的副本已转义
    assert_eq!(&mem.block(11)[..4], &[0u8; 4]);

    drop(journal);
    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_replays, 1);
    assert_eq!(mem.block(600), content);
}

#[test]
fn test_checksummed_commit_replays() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default().with_checksum(true));
    write_sync(&journal, 700, b"SUMS").unwrap();
    drop(journal);

    assert!(disk_superblock(&mem, 0).has_checksum());
    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_replays, 1);
    assert_eq!(&mem.block(700)[..4], b"SUMS");
}

#[test]
fn test_corrupted_checksummed_transaction_is_dropped() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default().with_checksum(true));
    write_sync(&journal, 700, b"SUMS").unwrap();
    drop(journal);

    // 破坏日志中的数据块
    let mut data = mem.block(11);
    data[100] ^= 0xFF;
    mem.set_block(11, &data);

    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().end_transaction, 1);
    assert_eq!(journal.recovery_info().nr_replays, 0);
    assert_eq!(&mem.block(700)[..4], &[0u8; 4]);
}

#[test]
fn test_credits_are_enforced() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(1).unwrap();
    let a = journal.get_buffer(800).unwrap();
    let b = journal.get_buffer(801).unwrap();

    handle.get_write_access(&a).unwrap();
    handle.dirty_metadata(&a).unwrap();
    // 同一个块再次修改不扣 credit
    handle.dirty_metadata(&a).unwrap();
    assert_eq!(handle.credits(), 0);

    handle.get_write_access(&b).unwrap();
    let err = handle.dirty_metadata(&b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoCredits);

    assert!(handle.extend(1).unwrap());
    handle.dirty_metadata(&b).unwrap();
    handle.stop().unwrap();

    let err = journal.start_handle(journal.max_transaction_buffers() + 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_dirty_without_write_access_fails() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(1).unwrap();
    let bh = journal.get_buffer(820).unwrap();
    let err = handle.dirty_metadata(&bh).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_forget_refunds_credit() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(1).unwrap();
    let bh = journal.get_buffer(830).unwrap();
    handle.get_write_access(&bh).unwrap();
    bh.with_data_mut(|d| d[0] = 9);
    handle.dirty_metadata(&bh).unwrap();
    assert_eq!(handle.credits(), 0);

    handle.forget(&bh).unwrap();
    assert_eq!(handle.credits(), 1);
    assert!(!bh.is_jbddirty());
    assert!(!bh.has_journal_head());
    handle.set_sync(true);
    handle.stop().unwrap();

    journal.flush().unwrap();
    assert_eq!(mem.block(830)[0], 0);
}

#[test]
fn test_undo_access_keeps_committed_copy() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());
    write_sync(&journal, 840, &[1u8; 8]).unwrap();

    let mut handle = journal.start_handle(1).unwrap();
    let bh = journal.get_buffer(840).unwrap();
    handle.get_undo_access(&bh).unwrap();
    bh.with_data_mut(|d| d[..8].fill(2));
    handle.dirty_metadata(&bh).unwrap();

    let committed = handle.committed_data(&bh).unwrap();
    assert_eq!(&committed[..8], &[1u8; 8]);
    assert_eq!(&bh.snapshot()[..8], &[2u8; 8]);
    handle.stop().unwrap();
}

#[test]
fn test_nested_and_restarted_handles() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(2).unwrap();
    handle.nest();
    assert_eq!(handle.nested_depth(), 1);
    handle.stop_nested().unwrap();
    assert_eq!(
        handle.stop_nested().unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    handle.restart(3).unwrap();
    assert_eq!(handle.credits(), 3);
    let bh = journal.get_buffer(850).unwrap();
    handle.get_write_access(&bh).unwrap();
    handle.dirty_metadata(&bh).unwrap();
    handle.set_sync(true);
    handle.stop().unwrap();
}

#[test]
fn test_nested_stop_keeps_handle_active() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    let mut handle = journal.start_handle(1).unwrap();
    let tid = handle.tid();
    handle.nest();
    handle.stop().unwrap();
    assert_eq!(handle.nested_depth(), 0);
    assert_eq!(
        journal.shared().state.lock().running.as_ref().unwrap().updates,
        1
    );

    // 内层结束后仍然可以继续修改
    let bh = journal.get_buffer(870).unwrap();
    handle.get_write_access(&bh).unwrap();
    bh.with_data_mut(|d| d[0] = 0x87);
    handle.dirty_metadata(&bh).unwrap();
    handle.set_sync(true);
    handle.stop().unwrap();
    assert_eq!(journal.commit_sequence(), tid);

    assert_eq!(handle.stop().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        handle.get_write_access(&bh).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_dropped_handle_releases_transaction() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    {
        let mut handle = journal.start_handle(1).unwrap();
        let bh = journal.get_buffer(860).unwrap();
        handle.get_write_access(&bh).unwrap();
        bh.with_data_mut(|d| d[0] = 0x86);
        handle.dirty_metadata(&bh).unwrap();
    }

    // handle 已经在 drop 时结束，提交不会卡住
    let tid = journal.request_commit(true).unwrap();
    assert_eq!(tid, Some(1));
    assert_eq!(journal.request_commit(true).unwrap(), None);
    assert_eq!(journal.stats().transactions_committed, 1);
}

#[test]
fn test_abort_is_sticky() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    journal.abort(-5);
    assert!(journal.is_aborted());
    assert_eq!(journal.errno(), -30);
    assert_eq!(
        journal.start_handle(1).unwrap_err().kind(),
        ErrorKind::ReadOnly
    );

    // 只记录第一个错误
    journal.abort(-28);
    assert_eq!(disk_superblock(&mem, 0).errno, -5);
    assert!(journal.clear_err().is_err());
    assert_eq!(journal.destroy().unwrap_err().kind(), ErrorKind::ReadOnly);

    // 重新加载后需要确认错误才能继续
    let journal = load(&mem).unwrap();
    assert!(!journal.is_aborted());
    assert_eq!(journal.errno(), -5);
    assert_eq!(
        journal.start_handle(1).unwrap_err().kind(),
        ErrorKind::ReadOnly
    );
    journal.ack_err();
    journal.start_handle(1).unwrap().stop().unwrap();

    journal.clear_err().unwrap();
    assert_eq!(journal.errno(), 0);
    assert_eq!(disk_superblock(&mem, 0).errno, 0);
}

/// 只映射前 `limit` 个逻辑块的文件型 journal
struct LimitedMap {
    base: u64,
    limit: AtomicU32,
}

impl Bmap for LimitedMap {
    fn bmap(&self, logical: u32) -> Result<Option<u64>> {
        Ok((logical < self.limit.load(Ordering::SeqCst)).then(|| self.base + logical as u64))
    }
}

#[test]
fn test_bmap_miss_aborts_journal() {
    let mem = device();
    let map = Arc::new(LimitedMap {
        base: 200,
        limit: AtomicU32::new(LOG.end),
    });
    let journal = Journal::create(
        mem.clone(),
        LogMapping::File(map.clone()),
        LOG,
        JournalConfig::default(),
    )
    .unwrap();
    assert_eq!(disk_superblock(&mem, 200).first, LOG.start);

    // 描述符块有映射，数据块没有
    map.limit.store(LOG.start + 1, Ordering::SeqCst);
    let err = write_sync(&journal, 500, b"MISS").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);
    assert!(journal.is_aborted());
    assert_eq!(journal.errno(), -30);
    assert_eq!(disk_superblock(&mem, 200).errno, -5);
}

#[test]
fn test_commit_write_failure_aborts_journal() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());
    mem.fail_writes_to(12);

    let err = write_sync(&journal, 500, b"FAIL").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);
    assert!(journal.is_aborted());

    mem.clear_faults();
    drop(journal);

    // 没有提交块，恢复时不重放
    let journal = load(&mem).unwrap();
    assert_eq!(journal.recovery_info().nr_replays, 0);
    assert_eq!(&mem.block(500)[..4], &[0u8; 4]);
}

#[test]
fn test_load_rejects_bad_superblock() {
    let mem = device();
    assert_eq!(load(&mem).unwrap_err().kind(), ErrorKind::Corrupted);

    let journal = create(&mem, JournalConfig::default());
    journal.destroy().unwrap();

    let mut sb = mem.block(0);
    sb[0x28..0x2C].copy_from_slice(&0x0000_0081u32.to_be_bytes());
    mem.set_block(0, &sb);
    assert_eq!(load(&mem).unwrap_err().kind(), ErrorKind::Unsupported);
}

#[test]
fn test_log_space_is_reclaimed_by_checkpoint() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());

    // 每个事务占 3 个日志块，远超日志容量
    for i in 0..60u64 {
        write_sync(&journal, 900 + (i % 8), &[i as u8; 4]).unwrap();
    }
    assert!(journal.stats().transactions_committed >= 60);

    journal.flush().unwrap();
    for i in 52..60u64 {
        assert_eq!(mem.block(900 + (i % 8))[0], i as u8);
    }
    assert_eq!(journal.log_state().free_count, LOG.end - LOG.start);
}

#[test]
fn test_create_validates_geometry() {
    let mem = device();
    let err = Journal::create(
        mem.clone(),
        LogMapping::Linear { offset: 0 },
        0..64,
        JournalConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = Journal::create(
        mem,
        LogMapping::Linear { offset: 0 },
        10..2000,
        JournalConfig::default().with_max_transaction_buffers(16),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
}

#[test]
fn test_failed_barrier_aborts_journal() {
    let mem = device();
    let journal = create(&mem, JournalConfig::default());
    mem.fail_flushes(true);

    let err = write_sync(&journal, 500, b"BARR").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);
    assert!(journal.is_aborted());
    assert_eq!(
        journal.start_handle(1).unwrap_err().kind(),
        ErrorKind::ReadOnly
    );
    assert_eq!(journal.request_commit(false).unwrap_err().kind(), ErrorKind::ReadOnly);
}

/// 1600 块的日志，放在 2048 块的设备上
const BIG_LOG: core::ops::Range<u32> = 10..1610;

fn create_big(mem: &Arc<MemoryDevice>, config: JournalConfig) -> Journal {
    Journal::create(mem.clone(), LogMapping::Linear { offset: 0 }, BIG_LOG, config).unwrap()
}

#[test]
fn test_large_transaction_fits_in_cache() {
    let mem = Arc::new(MemoryDevice::new(BS, 2048));
    let journal = create_big(&mem, JournalConfig::default());
    assert_eq!(journal.max_transaction_buffers(), 400);
    assert!(journal.cache().capacity() >= 800);

    let mut handle = journal.start_handle(300).unwrap();
    for i in 0..300u64 {
        let bh = journal.get_buffer(1700 + i).unwrap();
        handle.get_write_access(&bh).unwrap();
        bh.with_data_mut(|d| d[..2].copy_from_slice(&(i as u16).to_le_bytes()));
        handle.dirty_metadata(&bh).unwrap();
    }
    assert_eq!(handle.credits(), 0);
    handle.set_sync(true);
    handle.stop().unwrap();

    journal.flush().unwrap();
    for i in 0..300u64 {
        assert_eq!(&mem.block(1700 + i)[..2], &(i as u16).to_le_bytes());
    }
}

#[test]
fn test_full_cache_releases_checkpointed_buffers() {
    let mem = Arc::new(MemoryDevice::new(BS, 2048));
    let journal = create_big(
        &mem,
        JournalConfig::default()
            .with_max_transaction_buffers(16)
            .with_cache_capacity(32),
    );
    assert_eq!(journal.cache().capacity(), 32);

    // 每个事务留下一个等待 checkpoint 的块，远超缓存容量
    for i in 0..300u64 {
        write_sync(&journal, 1700 + i, &(i as u16).to_le_bytes()).unwrap();
    }
    assert!(journal.stats().transactions_committed >= 300);
    // 已经写回的 checkpoint 块被驱逐
    assert!(journal.cache().stats().evictions > 0);
    assert!(journal.cache().stats().writebacks > 0);

    journal.flush().unwrap();
    for i in 0..300u64 {
        assert_eq!(&mem.block(1700 + i)[..2], &(i as u16).to_le_bytes());
    }
    assert_eq!(journal.log_state().free_count, BIG_LOG.end - BIG_LOG.start);
}

#[test]
fn test_many_sync_transactions_with_default_config() {
    let mem = Arc::new(MemoryDevice::new(BS, 2048));
    let journal = create_big(&mem, JournalConfig::default());

    for i in 0..300u64 {
        write_sync(&journal, 1700 + i, &[i as u8; 4]).unwrap();
    }
    journal.destroy().unwrap();

    for i in 0..300u64 {
        assert_eq!(&mem.block(1700 + i)[..4], &[i as u8; 4]);
    }
}

#[test]
fn test_large_log_uses_computed_reserve() {
    let mem = Arc::new(MemoryDevice::new(BS, 4200));
    let journal = Journal::create(
        mem.clone(),
        LogMapping::Linear { offset: 0 },
        10..4106,
        JournalConfig::default(),
    )
    .unwrap();
    assert_eq!(journal.max_transaction_buffers(), 1024);
    assert!(journal.shared().reserved_blocks > DEFAULT_MIN_LOG_RESERVED_BLOCKS);

    write_sync(&journal, 4150, b"BIG!").unwrap();
    journal.flush().unwrap();
    assert_eq!(&mem.block(4150)[..4], b"BIG!");
}

#[test]
fn test_write_access_while_buffer_is_committing() {
    let mem = device();
    let journal = create(
        &mem,
        JournalConfig::default().with_commit_interval(Duration::from_secs(3600)),
    );
    let bh = journal.get_buffer(600).unwrap();

    let mut handle = journal.start_handle(1).unwrap();
    let t = handle.tid();
    handle.get_write_access(&bh).unwrap();
    bh.with_data_mut(|d| d[..4].copy_from_slice(b"TTTT"));
    handle.dirty_metadata(&bh).unwrap();
    handle.stop().unwrap();

    // 提交停在数据块（描述符块之后）的写入上
    mem.hold_writes_to(11);
    assert_eq!(journal.request_commit(false).unwrap(), Some(t));
    mem.wait_for_held_write();

    let mut next = journal.start_handle(1).unwrap();
    assert_eq!(next.tid(), t + 1);
    next.get_write_access(&bh).unwrap();
    bh.with_data_mut(|d| d[..4].copy_from_slice(b"UUUU"));
    next.dirty_metadata(&bh).unwrap();
    {
        let lists = journal.shared().lists.lock();
        let jh = lists.head(lists.lookup(600).unwrap());
        assert_eq!(jh.transaction, Some(t));
        assert_eq!(jh.next_transaction, Some(t + 1));
        assert_eq!(jh.list, BufferList::Shadow);
    }
    next.stop().unwrap();

    mem.release_held_writes();
    journal.wait_for_commit(t).unwrap();

    // 日志里是 T 提交时的内容
    assert_eq!(&mem.block(11)[..4], b"TTTT");
    {
        let lists = journal.shared().lists.lock();
        let id = lists.lookup(600).unwrap();
        assert_eq!(lists.transactions[&(t + 1)].metadata, vec![id]);
        let jh = lists.head(id);
        assert_eq!(jh.transaction, Some(t + 1));
        assert_eq!(jh.next_transaction, None);
        assert_eq!(jh.cp_transaction, Some(t));
    }
    assert!(bh.is_jbddirty());

    // T 的 checkpoint 先要提交 T+1
    assert_eq!(journal.commit_sequence(), t);
    journal.checkpoint().unwrap();
    assert_eq!(journal.commit_sequence(), t + 1);

    journal.flush().unwrap();
    assert_eq!(&mem.block(600)[..4], b"UUUU");
}

#[test]
fn test_checkpoint_order_with_concurrent_handles() {
    let mem = device();
    let journal = Arc::new(create(&mem, JournalConfig::default()));
    let finished = Arc::new(AtomicU32::new(0));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let journal = Arc::clone(&journal);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                for i in 0..25u8 {
                    write_sync(&journal, 1000 + t, &[i; 4]).unwrap();
                }
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let mut last_tail = journal.shared().state.lock().tail_sequence;
    while finished.load(Ordering::SeqCst) < 4 {
        journal.checkpoint().unwrap();
        {
            let lists = journal.shared().lists.lock();
            let tids: Vec<Tid> = lists.checkpoint.iter().map(|cp| cp.tid).collect();
            assert!(
                tids.windows(2).all(|w| tid_gt(w[1], w[0])),
                "checkpoint queue out of order: {:?}",
                tids
            );
        }
        let tail = journal.shared().state.lock().tail_sequence;
        assert!(tid_geq(tail, last_tail));
        last_tail = tail;
        std::thread::yield_now();
    }
    for writer in writers {
        writer.join().unwrap();
    }

    journal.flush().unwrap();
    for t in 0..4u64 {
        assert_eq!(&mem.block(1000 + t)[..4], &[24u8; 4]);
    }
    assert_eq!(journal.log_state().free_count, LOG.end - LOG.start);
}
