//! JBD Journal 管理器
//!
//! 对应内核 `journal.c` 中的 `journal_t` 及其生命周期管理：
//! `journal_create()` / `journal_load()` / `journal_flush()` / `journal_destroy()`、
//! 错误状态（`journal_abort()` / `journal_errno()` / `journal_clear_err()` / `journal_ack_err()`）
//! 以及 superblock 更新。

use super::{
    checkpoint, commit,
    config::{JournalConfig, LogLimits},
    handle::Handle,
    jbd_buf::JournalLists,
    jbd_fs::{JbdFs, LogMapping},
    jbd_trans::{tid_geq, tid_gt, Tid, Transaction},
    kjournald::{self, CommitMessage},
    recovery::{self, RecoveryInfo},
    revoke::RevokeTable,
    ring::{LogBlockRange, LogRing},
    types::*,
    JournalError,
};
use crate::{
    block::BlockDevice,
    cache::{BlockCache, BufferRef},
    error::{Error, ErrorKind, Result},
};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::{
    ops::Range,
    sync::{mpsc, Arc},
    thread::{self, JoinHandle, ThreadId},
};

bitflags! {
    /// Journal 状态标志
    ///
    /// 对应 `JFS_ABORT` / `JFS_ACK_ERR` / `JFS_FLUSHED` / `JFS_UNMOUNT`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JournalFlags: u32 {
        /// 已中止，拒绝新的 handle
        const ABORT   = 0x001;
        /// 错误已被确认
        const ACK_ERR = 0x002;
        /// 磁盘上的 superblock 表示日志为空
        const FLUSHED = 0x004;
        /// 正在卸载
        const UNMOUNT = 0x008;
    }
}

/// Journal 统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// 完成提交的事务数
    pub transactions_committed: u64,
    /// 写入日志的块数（描述符块、数据块、revoke 块和提交块）
    pub blocks_logged: u64,
    /// 写入的 revoke 块数
    pub revoke_blocks: u64,
    /// 需要转义的数据块数
    pub escaped_blocks: u64,
    /// 开始过的 handle 数
    pub handles_started: u64,
    /// checkpoint 次数
    pub checkpoints: u64,
}

/// 受 state 锁保护的 journal 状态
///
/// 对应 `journal_t` 中受 `j_state_lock` 保护的字段
#[derive(Debug)]
pub(crate) struct JournalState {
    pub flags: JournalFlags,
    /// 记录的错误码（负的 errno）
    pub errno: i32,
    pub ring: LogRing,
    /// 日志中最旧事务的 tid
    pub tail_sequence: Tid,
    /// 下一个要分配的 tid
    pub transaction_sequence: Tid,
    /// 最近一个完成提交的 tid
    pub commit_sequence: Tid,
    /// 被请求提交的最大 tid
    pub commit_request: Tid,
    pub running: Option<Transaction>,
    pub committing: Option<Transaction>,
    pub stats: JournalStats,
}

impl JournalState {
    pub fn is_aborted(&self) -> bool {
        self.flags.contains(JournalFlags::ABORT)
    }

    /// 是否拒绝新的 handle
    ///
    /// 已中止，或者有未确认的错误
    pub fn refuses_handles(&self) -> bool {
        self.is_aborted() || (self.errno != 0 && !self.flags.contains(JournalFlags::ACK_ERR))
    }

    /// 新 handle 准入需要的日志空间
    ///
    /// 对应 `jbd_space_needed()`
    pub fn space_needed(&self, max_transaction_buffers: u32) -> u32 {
        max_transaction_buffers
            + self
                .committing
                .as_ref()
                .map_or(0, |t| t.outstanding_credits)
    }
}

/// 所有线程共享的 journal 内部状态
pub(crate) struct JournalShared {
    pub fs: JbdFs,
    pub cache: BlockCache,
    pub config: JournalConfig,
    /// 单个事务的 credits 上限
    pub max_tb: u32,
    /// 准入 handle 时扣除的保留块数
    pub reserved_blocks: u32,
    /// 提交块是否带校验和
    pub checksum: bool,
    pub uuid: [u8; UUID_SIZE],

    pub state: Mutex<JournalState>,
    pub lists: Mutex<JournalLists>,
    pub checkpoint_mutex: Mutex<()>,
    pub commit_mutex: Mutex<()>,
    pub sb: Mutex<JournalSuperblock>,

    /// 运行中事务被锁定或切换时唤醒
    pub wait_transaction_locked: Condvar,
    /// 事务的 handle 全部结束时唤醒
    pub wait_updates: Condvar,
    /// 事务提交完成时唤醒
    pub wait_done_commit: Condvar,

    pub daemon_tx: Mutex<Option<mpsc::Sender<CommitMessage>>>,
    pub daemon_thread: Mutex<Option<ThreadId>>,
}

impl JournalShared {
    pub fn is_aborted(&self) -> bool {
        self.state.lock().is_aborted()
    }

    /// 扣除保留块后的可用日志空间
    pub fn space_left(&self, state: &JournalState) -> u32 {
        state.ring.space_left(self.reserved_blocks)
    }

    /// 从块缓存取块；缓存被钉满时先把 checkpoint 上的块写回再重试
    ///
    /// 调用者可能持有 handle，所以这里不能等待任何提交
    pub fn cache_get(&self, get: impl Fn(&BlockCache) -> Result<BufferRef>) -> Result<BufferRef> {
        loop {
            match get(&self.cache) {
                Err(err) if err.kind() == ErrorKind::NoSpace => {
                    log::debug!("[CACHE] cache full, releasing checkpointed buffers");
                    if checkpoint::release_checkpointed_buffers(self)? == 0 {
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }

    /// 给提交线程发消息
    pub fn notify_daemon(&self, msg: CommitMessage) {
        if let Some(tx) = self.daemon_tx.lock().as_ref() {
            if tx.send(msg).is_err() {
                log::warn!("[JOURNAL] commit thread is gone");
            }
        }
    }

    /// 请求提交事务 `tid`
    ///
    /// 对应 `__log_start_commit()`
    ///
    /// # 返回
    ///
    /// 这是一个新的请求时返回 true
    pub fn log_start_commit(&self, state: &mut JournalState, tid: Tid) -> bool {
        if tid_geq(state.commit_request, tid) {
            return false;
        }
        state.commit_request = tid;
        log::debug!("[JOURNAL] commit of transaction {} requested", tid);
        self.notify_daemon(CommitMessage::CommitRequested(Some(tid)));
        true
    }

    /// 等待事务 `tid` 提交完成
    ///
    /// 对应 `log_wait_commit()`：journal 已中止时返回错误
    pub fn log_wait_commit(&self, tid: Tid) -> Result<()> {
        let mut state = self.state.lock();
        while tid_gt(tid, state.commit_sequence) && !state.is_aborted() {
            self.wait_done_commit.wait(&mut state);
        }
        if state.is_aborted() {
            return Err(JournalError::Aborted.into());
        }
        Ok(())
    }

    /// 当前线程不能等待提交线程（它就是提交线程，或者提交线程已停止）
    fn commits_inline(&self) -> bool {
        self.daemon_tx.lock().is_none()
            || *self.daemon_thread.lock() == Some(thread::current().id())
    }

    /// 提交事务 `tid` 并等待完成
    ///
    /// 提交线程不可用时在当前线程提交
    pub fn commit_and_wait(&self, tid: Tid) -> Result<()> {
        if self.commits_inline() {
            let is_running = self
                .state
                .lock()
                .running
                .as_ref()
                .is_some_and(|t| t.tid == tid);
            if is_running {
                commit::commit_transaction(self)?;
            }
        } else {
            let mut state = self.state.lock();
            self.log_start_commit(&mut state, tid);
        }
        self.log_wait_commit(tid)
    }

    /// 中止 journal
    ///
    /// 对应 `journal_abort()`：只记录第一个错误码，错误码写入 superblock，
    /// 唤醒所有等待者让它们尽快失败
    pub fn abort(&self, errno: i32) {
        let recorded = {
            let mut state = self.state.lock();
            if state.is_aborted() {
                return;
            }
            log::error!("[JOURNAL] aborting journal with error {}", errno);
            if state.errno == 0 {
                state.errno = errno;
            }
            state.flags.insert(JournalFlags::ABORT);
            state.errno
        };

        self.wait_transaction_locked.notify_all();
        self.wait_updates.notify_all();
        self.wait_done_commit.notify_all();
        self.notify_daemon(CommitMessage::CommitRequested(None));

        if errno != 0 {
            if let Err(err) = self.record_errno(recorded) {
                log::error!("[JOURNAL] failed to record error in superblock: {}", err);
            }
        }
    }

    /// 更新磁盘上的 superblock
    ///
    /// 对应 `journal_update_superblock()`
    ///
    /// # 参数
    ///
    /// * `start` - 日志中最旧事务的第一个块，0 表示日志为空
    /// * `sequence` - 该事务的 tid
    /// * `errno` - 要记录的错误码
    pub fn write_superblock(&self, start: u32, sequence: Tid, errno: i32) -> Result<()> {
        let mut sb = self.sb.lock();
        sb.start = start;
        sb.sequence = sequence;
        sb.errno = errno;
        log::debug!(
            "[JOURNAL] updating superblock: start={}, sequence={}, errno={}",
            start,
            sequence,
            errno
        );
        self.fs.write_superblock(&sb)
    }

    /// 只更新 superblock 中的错误码
    pub fn record_errno(&self, errno: i32) -> Result<()> {
        let mut sb = self.sb.lock();
        sb.errno = errno;
        self.fs.write_superblock(&sb)
    }

    /// superblock 标记为空日志时，在写日志块之前先写入真实的 tail
    ///
    /// 调用者持有 commit_mutex
    pub fn write_tail_if_flushed(&self) -> Result<()> {
        let (tail, sequence, errno) = {
            let state = self.state.lock();
            if !state.flags.contains(JournalFlags::FLUSHED) {
                return Ok(());
            }
            (state.ring.tail(), state.tail_sequence, state.errno)
        };
        self.write_superblock(tail, sequence, errno)?;
        self.state.lock().flags.remove(JournalFlags::FLUSHED);
        Ok(())
    }

    /// 把 superblock 标记为空日志
    ///
    /// 调用者持有 checkpoint_mutex，并且已经 checkpoint 完所有事务
    pub fn mark_log_empty(&self) -> Result<()> {
        let _commit = self.commit_mutex.lock();
        let (sequence, errno) = {
            let state = self.state.lock();
            (state.tail_sequence, state.errno)
        };
        self.write_superblock(0, sequence, errno)?;
        self.state.lock().flags.insert(JournalFlags::FLUSHED);
        Ok(())
    }
}

/// JBD Journal（日志管理器）
///
/// 对应内核 `journal_t`
///
/// 持有所有共享状态和提交线程。`destroy()` 干净地卸载 journal；
/// 直接 drop 只停止提交线程，不写任何东西（相当于崩溃）。
pub struct Journal {
    shared: Arc<JournalShared>,
    daemon: Option<JoinHandle<()>>,
    recovery: RecoveryInfo,
}

impl Journal {
    /// 在设备上创建新的 journal
    ///
    /// 对应 `journal_create()`：清零整个日志区域并写入新的 superblock
    ///
    /// # 参数
    ///
    /// * `device` - 块设备
    /// * `mapping` - 日志逻辑块映射
    /// * `range` - 日志块范围 `[first, last)`，逻辑块 0 保留给 superblock
    /// * `config` - 配置
    pub fn create(
        device: Arc<dyn BlockDevice>,
        mapping: LogMapping,
        range: Range<u32>,
        config: JournalConfig,
    ) -> Result<Self> {
        let fs = JbdFs::new(device, mapping)?;
        if fs.dev().is_read_only() {
            return Err(Error::new(ErrorKind::ReadOnly, "Cannot create journal on read-only device"));
        }
        if range.start == 0 || range.start >= range.end {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Journal log range must be non-empty and start after the superblock",
            ));
        }

        let block_size = fs.block_size();
        let limits = config.validate(range.end - range.start, block_size)?;
        fs.check_extent(range.end)?;

        let uuid = config
            .uuid
            .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
        let mut sb = JournalSuperblock::new(block_size as u32, range.end, range.start, uuid);
        if config.checksum {
            sb.feature_compat.insert(CompatFeatures::CHECKSUM);
        }
        sb.max_transaction = limits.max_transaction_buffers;

        let zero = vec![0u8; block_size];
        for block in range.clone() {
            fs.write_log_block(block, &zero)?;
        }
        fs.write_superblock(&sb)?;

        log::info!(
            "[JOURNAL] created journal: log blocks {}..{}, block size {}, max transaction {}, reserve {}",
            range.start,
            range.end,
            block_size,
            limits.max_transaction_buffers,
            limits.reserved_blocks
        );

        let recovery = RecoveryInfo::clean(sb.sequence, sb.first);
        Self::start(fs, sb, config, limits, recovery)
    }

    /// 加载已有的 journal，需要时执行恢复
    ///
    /// 对应 `journal_load()`：superblock 无效或带有未知特性时直接失败，不做任何重放
    pub fn load(
        device: Arc<dyn BlockDevice>,
        mapping: LogMapping,
        config: JournalConfig,
    ) -> Result<Self> {
        let fs = JbdFs::new(device, mapping)?;
        let mut sb = fs.read_superblock()?;
        sb.check_features()?;

        let limits = config.validate(sb.maxlen - sb.first, fs.block_size())?;

        let recovery = if sb.is_empty_log() {
            RecoveryInfo::clean(sb.sequence, sb.first)
        } else {
            let mut revoke = RevokeTable::new();
            let info = recovery::recover(&fs, &sb, &mut revoke, config.checksum_fn)?;
            sb.sequence = info.end_transaction;
            sb.start = 0;
            fs.write_superblock(&sb)?;
            info
        };

        if sb.errno != 0 {
            log::warn!(
                "[JOURNAL] journal carries error {} from a previous mount",
                sb.errno
            );
        }

        Self::start(fs, sb, config, limits, recovery)
    }

    fn start(
        fs: JbdFs,
        sb: JournalSuperblock,
        config: JournalConfig,
        limits: LogLimits,
        recovery: RecoveryInfo,
    ) -> Result<Self> {
        let sequence = sb.sequence;
        let state = JournalState {
            flags: JournalFlags::FLUSHED,
            errno: sb.errno,
            ring: LogRing::new(sb.first, sb.maxlen, recovery.head_block),
            tail_sequence: sequence,
            transaction_sequence: sequence,
            commit_sequence: sequence.wrapping_sub(1),
            commit_request: sequence.wrapping_sub(1),
            running: None,
            committing: None,
            stats: JournalStats::default(),
        };

        let shared = Arc::new(JournalShared {
            cache: BlockCache::new(limits.cache_capacity, fs.block_size()),
            fs,
            max_tb: limits.max_transaction_buffers,
            reserved_blocks: limits.reserved_blocks,
            checksum: sb.has_checksum(),
            uuid: sb.uuid,
            config,
            state: Mutex::new(state),
            lists: Mutex::new(JournalLists::new()),
            checkpoint_mutex: Mutex::new(()),
            commit_mutex: Mutex::new(()),
            sb: Mutex::new(sb),
            wait_transaction_locked: Condvar::new(),
            wait_updates: Condvar::new(),
            wait_done_commit: Condvar::new(),
            daemon_tx: Mutex::new(None),
            daemon_thread: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel();
        *shared.daemon_tx.lock() = Some(tx);
        let daemon = kjournald::spawn(Arc::clone(&shared), rx)?;

        Ok(Self {
            shared,
            daemon: Some(daemon),
            recovery,
        })
    }

    /// 开始一个 handle，预留 `nblocks` 个 buffer credits
    ///
    /// 对应 `journal_start()`，可能阻塞等待提交或 checkpoint
    pub fn start_handle(&self, nblocks: u32) -> Result<Handle> {
        Handle::start(&self.shared, nblocks)
    }

    /// 读取文件系统块（经过块缓存）
    pub fn get_buffer(&self, blocknr: u64) -> Result<BufferRef> {
        let dev = self.shared.fs.dev();
        self.shared.cache_get(|cache| cache.get_or_read(dev, blocknr))
    }

    /// 获取一个新分配的块，不读取设备
    pub fn get_new_buffer(&self, blocknr: u64) -> Result<BufferRef> {
        self.shared.cache_get(|cache| cache.getblk(blocknr))
    }

    /// 块缓存
    pub fn cache(&self) -> &BlockCache {
        &self.shared.cache
    }

    /// 块大小
    pub fn block_size(&self) -> usize {
        self.shared.fs.block_size()
    }

    /// 单个事务的 credits 上限
    pub fn max_transaction_buffers(&self) -> u32 {
        self.shared.max_tb
    }

    /// 请求提交运行中的事务
    ///
    /// # 参数
    ///
    /// * `sync` - 为 true 时等待提交完成
    ///
    /// # 返回
    ///
    /// 被提交的事务 tid；没有事务可提交时返回 None
    pub fn request_commit(&self, sync: bool) -> Result<Option<Tid>> {
        let tid = {
            let mut state = self.shared.state.lock();
            if state.is_aborted() {
                return Err(JournalError::Aborted.into());
            }
            match (&state.running, &state.committing) {
                (Some(t), _) => {
                    let tid = t.tid;
                    self.shared.log_start_commit(&mut state, tid);
                    tid
                }
                (None, Some(t)) => t.tid,
                (None, None) => return Ok(None),
            }
        };

        if sync {
            self.shared.log_wait_commit(tid)?;
        }
        Ok(Some(tid))
    }

    /// 等待事务 `tid` 提交完成
    pub fn wait_for_commit(&self, tid: Tid) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if tid_geq(tid, state.transaction_sequence) {
                return Err(Error::new(ErrorKind::InvalidInput, "Transaction has not been started"));
            }
        }
        self.shared.log_wait_commit(tid)
    }

    /// 中止 journal
    ///
    /// # 参数
    ///
    /// * `errno` - 负的错误码，记录到 superblock
    pub fn abort(&self, errno: i32) {
        self.shared.abort(errno);
    }

    /// 是否已中止
    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// 当前错误码
    ///
    /// 对应 `journal_errno()`：已中止时返回 -EROFS
    pub fn errno(&self) -> i32 {
        let state = self.shared.state.lock();
        if state.is_aborted() {
            -ErrorKind::ReadOnly.errno()
        } else {
            state.errno
        }
    }

    /// 清除错误码
    ///
    /// 对应 `journal_clear_err()`：已中止的 journal 不能清除，必须重新加载
    pub fn clear_err(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.is_aborted() {
                return Err(JournalError::Aborted.into());
            }
            state.errno = 0;
            state.flags.remove(JournalFlags::ACK_ERR);
        }
        self.shared.record_errno(0)
    }

    /// 确认错误，之后允许新的 handle
    ///
    /// 对应 `journal_ack_err()`
    pub fn ack_err(&self) {
        let mut state = self.shared.state.lock();
        if state.errno != 0 {
            state.flags.insert(JournalFlags::ACK_ERR);
        }
    }

    /// 执行一次 checkpoint
    pub fn checkpoint(&self) -> Result<()> {
        let _cp = self.shared.checkpoint_mutex.lock();
        checkpoint::log_do_checkpoint(&self.shared)
    }

    /// 把所有已提交的修改写回原始位置，清空日志
    ///
    /// 对应 `journal_flush()`
    pub fn flush(&self) -> Result<()> {
        let shared = &self.shared;

        let (running, committing) = {
            let mut state = shared.state.lock();
            if state.is_aborted() {
                return Err(JournalError::Aborted.into());
            }
            let running = state.running.as_ref().map(|t| t.tid);
            if let Some(tid) = running {
                shared.log_start_commit(&mut state, tid);
            }
            (running, state.committing.as_ref().map(|t| t.tid))
        };
        if let Some(tid) = committing {
            shared.log_wait_commit(tid)?;
        }
        if let Some(tid) = running {
            shared.log_wait_commit(tid)?;
        }

        let _cp = shared.checkpoint_mutex.lock();
        while !shared.lists.lock().checkpoint.is_empty() {
            checkpoint::log_do_checkpoint(shared)?;
        }
        checkpoint::cleanup_journal_tail(shared)?;
        shared.mark_log_empty()?;

        log::info!("[JOURNAL] journal flushed");
        Ok(())
    }

    /// 卸载 journal
    ///
    /// 对应 `journal_destroy()`：提交剩余事务，全部 checkpoint，
    /// 最后写入 `start=0` 的 superblock。已中止的 journal 保留日志内容，返回错误。
    pub fn destroy(mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        shared.state.lock().flags.insert(JournalFlags::UNMOUNT);
        self.stop_daemon();

        if shared.state.lock().running.is_some() {
            if let Err(err) = commit::commit_transaction(&shared) {
                log::error!("[JOURNAL] final commit failed: {}", err);
            }
        }

        if !shared.is_aborted() {
            let _cp = shared.checkpoint_mutex.lock();
            while !shared.lists.lock().checkpoint.is_empty() && !shared.is_aborted() {
                if let Err(err) = checkpoint::log_do_checkpoint(&shared) {
                    log::error!("[JOURNAL] checkpoint during unmount failed: {}", err);
                    break;
                }
            }
            checkpoint::cleanup_journal_tail(&shared)?;
        }

        let (aborted, sequence, errno) = {
            let state = shared.state.lock();
            (state.is_aborted(), state.transaction_sequence, state.errno)
        };
        if aborted {
            log::warn!("[JOURNAL] journal aborted, leaving log for recovery");
            return Err(JournalError::Aborted.into());
        }

        shared.write_superblock(0, sequence, errno)?;
        log::info!("[JOURNAL] journal unmounted cleanly at sequence {}", sequence);
        Ok(())
    }

    fn stop_daemon(&mut self) {
        if let Some(tx) = self.shared.daemon_tx.lock().take() {
            let _ = tx.send(CommitMessage::Shutdown);
        }
        if let Some(daemon) = self.daemon.take() {
            if daemon.join().is_err() {
                log::error!("[JOURNAL] commit thread panicked");
            }
        }
    }

    /// 日志空间快照
    pub fn log_state(&self) -> LogBlockRange {
        self.shared.state.lock().ring.snapshot()
    }

    /// 统计信息
    pub fn stats(&self) -> JournalStats {
        self.shared.state.lock().stats.clone()
    }

    /// 加载时的恢复结果
    pub fn recovery_info(&self) -> &RecoveryInfo {
        &self.recovery
    }

    /// 内存中的 superblock 副本
    pub fn superblock(&self) -> JournalSuperblock {
        *self.shared.sb.lock()
    }

    /// 运行中事务的 tid
    pub fn running_tid(&self) -> Option<Tid> {
        self.shared.state.lock().running.as_ref().map(|t| t.tid)
    }

    /// 最近一个完成提交的 tid
    pub fn commit_sequence(&self) -> Tid {
        self.shared.state.lock().commit_sequence
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<JournalShared> {
        &self.shared
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.stop_daemon();
    }
}

impl core::fmt::Debug for Journal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Journal")
            .field("ring", &state.ring.snapshot())
            .field("transaction_sequence", &state.transaction_sequence)
            .field("commit_sequence", &state.commit_sequence)
            .field("flags", &state.flags)
            .finish()
    }
}
