//! 提交线程
//!
//! 对应内核 `kjournald()`：
//! - 收到提交请求或运行中事务到期时提交
//! - 日志使用超过一半时顺便做一次 checkpoint
//! - 收到 `Shutdown` 或邮箱关闭时退出

use super::{
    checkpoint, commit,
    jbd_journal::JournalShared,
    jbd_trans::{tid_geq, Tid},
};
use crate::error::{Error, ErrorKind, Result};
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

/// 提交线程邮箱中的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMessage {
    /// 请求提交（`None` 表示只是唤醒检查状态）
    CommitRequested(Option<Tid>),
    /// 退出
    Shutdown,
}

/// 启动提交线程
pub(crate) fn spawn(
    shared: Arc<JournalShared>,
    rx: Receiver<CommitMessage>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("kjournald".into())
        .spawn(move || {
            *shared.daemon_thread.lock() = Some(thread::current().id());
            log::debug!("[KJOURNALD] commit thread started");
            run(&shared, &rx);
            *shared.daemon_thread.lock() = None;
            log::debug!("[KJOURNALD] commit thread exiting");
        })
        .map_err(|e| Error::with_cause(ErrorKind::Io, "Failed to spawn commit thread", e))
}

fn run(shared: &JournalShared, rx: &Receiver<CommitMessage>) {
    loop {
        let now = Instant::now();
        let (due, timeout, wants_checkpoint) = {
            let state = shared.state.lock();
            let wants_checkpoint = state.ring.free() < state.ring.len() / 2;
            match state.running.as_ref() {
                _ if state.is_aborted() => (false, shared.config.commit_interval, false),
                Some(t) => (
                    tid_geq(state.commit_request, t.tid) || t.is_expired(now),
                    t.expires.saturating_duration_since(now),
                    wants_checkpoint,
                ),
                None => (false, shared.config.commit_interval, wants_checkpoint),
            }
        };

        if due {
            if let Err(err) = commit::commit_transaction(shared) {
                log::error!("[KJOURNALD] commit failed: {}", err);
            }
            continue;
        }

        if wants_checkpoint {
            if let Some(_cp) = shared.checkpoint_mutex.try_lock() {
                if let Err(err) = checkpoint::log_do_checkpoint(shared) {
                    log::warn!("[KJOURNALD] checkpoint failed: {}", err);
                }
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(CommitMessage::CommitRequested(tid)) => {
                log::trace!("[KJOURNALD] woken for transaction {:?}", tid);
            }
            Ok(CommitMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
