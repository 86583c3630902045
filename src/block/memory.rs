//! 内存块设备
//!
//! 用于测试和模拟崩溃：数据保存在内存中，写入立即"落盘"。
//! 支持故障注入和 I/O 事件记录，便于验证 WAL 的写入顺序。

use super::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::{Condvar, Mutex};

/// 设备上发生过的写入类事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// 写入某个块
    Write(u64),
    /// 刷新写缓存
    Flush,
}

struct MemoryInner {
    data: Vec<u8>,
    events: Vec<IoEvent>,
    /// 再成功写入这么多次之后，所有写入失败
    fail_writes_after: Option<usize>,
    /// 写入这个块时失败
    fail_block: Option<u64>,
    fail_flush: bool,
    /// 写这个块时挂起，直到 `release_held_writes()`
    hold_block: Option<u64>,
    /// 有写入正挂起在 `hold_block` 上
    held: bool,
}

/// 内存块设备
pub struct MemoryDevice {
    block_size: u32,
    total_blocks: u64,
    inner: Mutex<MemoryInner>,
    hold_changed: Condvar,
}

impl MemoryDevice {
    /// 创建一个全零的内存设备
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            block_size,
            total_blocks,
            inner: Mutex::new(MemoryInner {
                data: vec![0u8; block_size as usize * total_blocks as usize],
                events: Vec::new(),
                fail_writes_after: None,
                fail_block: None,
                fail_flush: false,
                hold_block: None,
                held: false,
            }),
            hold_changed: Condvar::new(),
        }
    }

    fn range(&self, lba: u64) -> core::ops::Range<usize> {
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        start..start + bs
    }

    /// 直接读取块内容（不经过故障注入，不计入事件）
    pub fn block(&self, lba: u64) -> Vec<u8> {
        let range = self.range(lba);
        self.inner.lock().data[range].to_vec()
    }

    /// 直接改写块内容（不经过故障注入，不计入事件）
    pub fn set_block(&self, lba: u64, data: &[u8]) {
        let range = self.range(lba);
        let mut inner = self.inner.lock();
        let len = data.len().min(range.len());
        inner.data[range.start..range.start + len].copy_from_slice(&data[..len]);
    }

    /// 再成功写入 `n` 次之后，后续写入全部失败
    pub fn fail_writes_after(&self, n: usize) {
        self.inner.lock().fail_writes_after = Some(n);
    }

    /// 写入指定块时失败
    pub fn fail_writes_to(&self, lba: u64) {
        self.inner.lock().fail_block = Some(lba);
    }

    /// 让 flush 失败
    pub fn fail_flushes(&self, fail: bool) {
        self.inner.lock().fail_flush = fail;
    }

    /// 清除所有故障注入
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.fail_writes_after = None;
        inner.fail_block = None;
        inner.fail_flush = false;
    }

    /// 写入指定块时挂起写入线程，模拟一次迟迟不完成的 I/O
    pub fn hold_writes_to(&self, lba: u64) {
        self.inner.lock().hold_block = Some(lba);
    }

    /// 等待某个写入被 `hold_writes_to()` 挂起
    pub fn wait_for_held_write(&self) {
        let mut inner = self.inner.lock();
        while !inner.held {
            self.hold_changed.wait(&mut inner);
        }
    }

    /// 放行被挂起的写入
    pub fn release_held_writes(&self) {
        let mut inner = self.inner.lock();
        inner.hold_block = None;
        self.hold_changed.notify_all();
    }

    /// 获取事件记录
    pub fn events(&self) -> Vec<IoEvent> {
        self.inner.lock().events.clone()
    }

    /// 清空事件记录
    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(lba);
        let inner = self.inner.lock();
        buf.copy_from_slice(&inner.data[range]);
        Ok(())
    }

    fn write_block(&self, lba: u64, buf: &[u8]) -> Result<()> {
        let range = self.range(lba);
        let mut inner = self.inner.lock();

        if inner.hold_block == Some(lba) {
            inner.held = true;
            self.hold_changed.notify_all();
            while inner.hold_block == Some(lba) {
                self.hold_changed.wait(&mut inner);
            }
            inner.held = false;
        }

        if inner.fail_block == Some(lba) {
            return Err(Error::new(ErrorKind::Io, "Injected write failure"));
        }
        match inner.fail_writes_after {
            Some(0) => return Err(Error::new(ErrorKind::Io, "Injected write failure")),
            Some(n) => inner.fail_writes_after = Some(n - 1),
            None => {}
        }

        inner.data[range].copy_from_slice(buf);
        inner.events.push(IoEvent::Write(lba));
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_flush {
            return Err(Error::new(ErrorKind::Io, "Injected flush failure"));
        }
        inner.events.push(IoEvent::Flush);
        Ok(())
    }
}

impl core::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_events_recorded() {
        let dev = MemoryDevice::new(1024, 8);
        dev.write_block(2, &[1u8; 1024]).unwrap();
        dev.flush().unwrap();
        assert_eq!(dev.events(), vec![IoEvent::Write(2), IoEvent::Flush]);
        assert_eq!(dev.block(2), vec![1u8; 1024]);
    }

    #[test]
    fn test_fail_writes_after() {
        let dev = MemoryDevice::new(1024, 8);
        dev.fail_writes_after(1);
        assert!(dev.write_block(0, &[0u8; 1024]).is_ok());
        assert!(dev.write_block(1, &[0u8; 1024]).is_err());

        dev.clear_faults();
        assert!(dev.write_block(1, &[0u8; 1024]).is_ok());
    }

    #[test]
    fn test_fail_specific_block() {
        let dev = MemoryDevice::new(1024, 8);
        dev.fail_writes_to(5);
        assert!(dev.write_block(4, &[0u8; 1024]).is_ok());
        assert_eq!(dev.write_block(5, &[0u8; 1024]).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_held_write_waits_for_release() {
        let dev = std::sync::Arc::new(MemoryDevice::new(1024, 8));
        dev.hold_writes_to(3);

        let writer = {
            let dev = dev.clone();
            std::thread::spawn(move || dev.write_block(3, &[7u8; 1024]))
        };
        dev.wait_for_held_write();
        assert_eq!(dev.block(3), vec![0u8; 1024]);

        dev.release_held_writes();
        writer.join().unwrap().unwrap();
        assert_eq!(dev.block(3), vec![7u8; 1024]);
    }
}
