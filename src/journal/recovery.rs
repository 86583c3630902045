//! Journal 恢复
//!
//! 对应内核 `recovery.c` 中的 `journal_recover()` / `do_one_pass()`
//!
//! # 恢复流程
//!
//! 从 superblock 记录的 `start` / `sequence` 开始，对日志扫描三遍：
//!
//! 1. **Scan**：找到最后一个完整提交的事务，确定 `end_transaction`；
//!    启用校验和时，校验和不匹配的提交块视为日志结束
//! 2. **Revoke**：收集 `[start, end)` 内所有 revoke 记录
//! 3. **Replay**：把没有被撤销的块写回原始位置
//!
//! 三遍扫描都在 `end_transaction` 之前停下，没有提交块的事务永远不会被重放。

use super::{
    checksum::TransactionChecksum,
    jbd_fs::JbdFs,
    jbd_trans::{tid_gt, Tid},
    revoke::RevokeTracker,
    ring::LogRing,
    types::*,
    JournalError,
};
use crate::{crc::ChecksumFn, error::Result};

/// 恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// 日志中第一个事务
    pub start_transaction: Tid,
    /// 第一个没有完整提交的事务（恢复后从这里继续分配 tid）
    pub end_transaction: Tid,
    /// 最后一个完整事务之后的日志块
    pub head_block: u32,
    /// 重放的块数
    pub nr_replays: u32,
    /// 读到的 revoke 记录数
    pub nr_revokes: u32,
    /// 因为被撤销而跳过的块数
    pub nr_revoke_hits: u32,
}

impl RecoveryInfo {
    /// 不需要恢复的空日志
    pub fn clean(sequence: Tid, head_block: u32) -> Self {
        Self {
            start_transaction: sequence,
            end_transaction: sequence,
            head_block,
            nr_replays: 0,
            nr_revokes: 0,
            nr_revoke_hits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Scan,
    Revoke,
    Replay,
}

/// 恢复 journal
///
/// 对应 `journal_recover()`
///
/// # 参数
///
/// * `fs` - 日志设备
/// * `sb` - 已读取的 superblock（`start != 0`）
/// * `tracker` - revoke 记录表，恢复结束时清空
/// * `checksum_fn` - 校验和函数，只在 superblock 启用校验和特性时使用
pub(crate) fn recover(
    fs: &JbdFs,
    sb: &JournalSuperblock,
    tracker: &mut dyn RevokeTracker,
    checksum_fn: ChecksumFn,
) -> Result<RecoveryInfo> {
    if !(sb.first..sb.maxlen).contains(&sb.start) {
        log::error!(
            "[RECOVERY] log start {} outside journal area {}..{}",
            sb.start,
            sb.first,
            sb.maxlen
        );
        return Err(JournalError::InvalidSuperblock.into());
    }

    log::info!(
        "[RECOVERY] starting recovery at block {}, transaction {}",
        sb.start,
        sb.sequence
    );

    let mut info = RecoveryInfo::clean(sb.sequence, sb.start);
    let result = do_one_pass(fs, sb, &mut info, tracker, checksum_fn, Pass::Scan)
        .and_then(|_| do_one_pass(fs, sb, &mut info, tracker, checksum_fn, Pass::Revoke))
        .and_then(|_| do_one_pass(fs, sb, &mut info, tracker, checksum_fn, Pass::Replay));
    tracker.clear_all();
    result?;

    fs.dev().flush()?;

    log::info!(
        "[RECOVERY] recovery complete: transactions {}..{}, {} blocks replayed, {} revoked, {} revoke hits",
        info.start_transaction,
        info.end_transaction,
        info.nr_replays,
        info.nr_revokes,
        info.nr_revoke_hits
    );
    Ok(info)
}

/// 对日志扫描一遍
///
/// 对应 `do_one_pass()`
fn do_one_pass(
    fs: &JbdFs,
    sb: &JournalSuperblock,
    info: &mut RecoveryInfo,
    tracker: &mut dyn RevokeTracker,
    checksum_fn: ChecksumFn,
    pass: Pass,
) -> Result<()> {
    let ring = LogRing::new(sb.first, sb.maxlen, sb.start);
    let mut next_commit_id = sb.sequence;
    let mut next_log_block = sb.start;
    let mut scanned = 0u32;

    let verify = pass == Pass::Scan && sb.has_checksum();
    let mut checksum = TransactionChecksum::new(checksum_fn, verify);

    loop {
        if pass != Pass::Scan && !tid_gt(info.end_transaction, next_commit_id) {
            break;
        }
        if scanned >= ring.len() {
            log::warn!("[RECOVERY] scanned the whole log without finding its end");
            break;
        }

        let this_block = next_log_block;
        let data = fs.read_log_block(this_block)?;
        next_log_block = ring.wrap_next(next_log_block);
        scanned += 1;

        let Some(header) = JbdHeader::decode(&data) else {
            break;
        };
        if header.sequence != next_commit_id {
            break;
        }

        match header.block_type() {
            Some(BlockType::Descriptor) => {
                let tags = decode_descriptor_tags(&data);

                if pass != Pass::Replay {
                    if verify {
                        checksum.update(&data);
                        for _ in &tags {
                            let block = fs.read_log_block(next_log_block)?;
                            checksum.update(&block);
                            next_log_block = ring.wrap_next(next_log_block);
                        }
                    } else {
                        for _ in &tags {
                            next_log_block = ring.wrap_next(next_log_block);
                        }
                    }
                    scanned += tags.len() as u32;
                    continue;
                }

                for tag in tags {
                    let log_block = next_log_block;
                    next_log_block = ring.wrap_next(next_log_block);
                    scanned += 1;

                    let target = tag.blocknr as u64;
                    if tracker.is_revoked(target, next_commit_id) {
                        log::debug!(
                            "[RECOVERY] block {} of transaction {} is revoked",
                            target,
                            next_commit_id
                        );
                        info.nr_revoke_hits += 1;
                        continue;
                    }

                    let mut block = fs.read_log_block(log_block)?;
                    if tag.flags.contains(TagFlags::ESCAPE) {
                        block[..4].copy_from_slice(&JBD_MAGIC_NUMBER.to_be_bytes());
                    }
                    fs.dev().write_block(target, &block)?;
                    info.nr_replays += 1;
                }
            }
            Some(BlockType::Commit) => {
                if verify {
                    let commit = CommitHeader::decode(&data);
                    if !checksum.verify(&commit) {
                        log::warn!(
                            "[RECOVERY] checksum mismatch in commit block {} of transaction {}",
                            this_block,
                            next_commit_id
                        );
                        break;
                    }
                    checksum.reset();
                }
                next_commit_id = next_commit_id.wrapping_add(1);
                if pass == Pass::Scan {
                    info.head_block = next_log_block;
                }
            }
            Some(BlockType::Revoke) => {
                if pass != Pass::Revoke {
                    continue;
                }
                let Some(records) = decode_revoke_records(&data) else {
                    log::error!("[RECOVERY] corrupt revoke block {}", this_block);
                    return Err(JournalError::RecoveryFailed.into());
                };
                for blocknr in records {
                    tracker.record_revoke(blocknr as u64, next_commit_id);
                    info.nr_revokes += 1;
                }
            }
            _ => {
                log::debug!(
                    "[RECOVERY] unexpected block type {} at log block {}",
                    header.blocktype,
                    this_block
                );
                break;
            }
        }
    }

    if pass == Pass::Scan {
        info.end_transaction = next_commit_id;
        log::debug!(
            "[RECOVERY] scan found transactions {}..{}",
            info.start_transaction,
            info.end_transaction
        );
    } else if next_commit_id != info.end_transaction {
        log::error!(
            "[RECOVERY] {:?} pass ended at transaction {}, expected {}",
            pass,
            next_commit_id,
            info.end_transaction
        );
        return Err(JournalError::RecoveryFailed.into());
    }
    Ok(())
}
