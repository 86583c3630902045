//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// journal 支持的最小块大小（superblock 占 1024 字节）
pub const MIN_BLOCK_SIZE: u32 = 1024;

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。journal 的提交线程和调用者线程会同时访问设备，
/// 因此所有方法都只需要 `&self`，由实现者自行处理内部同步。
///
/// # 示例
///
/// ```rust,ignore
/// use jbd_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn block_size(&self) -> u32 {
///         4096
///     }
///
///     fn total_blocks(&self) -> u64 {
///         1000000
///     }
///
///     fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
///         // 实现块读取
///         Ok(())
///     }
///
///     fn write_block(&self, lba: u64, buf: &[u8]) -> Result<()> {
///         // 实现块写入
///         Ok(())
///     }
/// }
/// ```
pub trait BlockDevice: Send + Sync {
    /// 块大小（字节）
    fn block_size(&self) -> u32;

    /// 总块数
    fn total_blocks(&self) -> u64;

    /// 读取一个块
    ///
    /// `buf` 的长度等于 `block_size()`
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<()>;

    /// 写入一个块
    ///
    /// `buf` 的长度等于 `block_size()`
    fn write_block(&self, lba: u64, buf: &[u8]) -> Result<()>;

    /// 刷新设备写缓存（barrier）
    ///
    /// 返回后，之前完成的所有写入都已落盘
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

/// I/O 统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// 读取块数
    pub reads: u64,
    /// 写入块数
    pub writes: u64,
    /// flush 次数
    pub flushes: u64,
}

/// 块设备包装器
///
/// 在底层设备之上做长度和范围检查，并统计 I/O 次数。
/// 可以在多个线程之间共享。
pub struct BlockDev {
    /// 底层设备
    device: Arc<dyn BlockDevice>,
    /// 块大小（字节）
    block_size: usize,
    /// 总块数
    total_blocks: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl BlockDev {
    /// 创建新的块设备包装器
    pub fn new(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let block_size = device.block_size();

        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Block size must be a power of two and at least 1024 bytes",
            ));
        }

        let total_blocks = device.total_blocks();

        Ok(Self {
            device,
            block_size: block_size as usize,
            total_blocks,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// 块大小（字节）
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 总块数
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// 底层设备是否只读
    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    fn check_range(&self, lba: u64) -> Result<()> {
        if lba >= self.total_blocks {
            return Err(Error::new(ErrorKind::InvalidInput, "Block number beyond end of device"));
        }
        Ok(())
    }

    /// 读取一个块，返回新分配的缓冲区
    pub fn read_block(&self, lba: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.read_into(lba, &mut buf)?;
        Ok(buf)
    }

    /// 读取一个块到给定缓冲区
    pub fn read_into(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(lba)?;
        if buf.len() != self.block_size {
            return Err(Error::new(ErrorKind::InvalidInput, "Buffer size does not match block size"));
        }
        self.device.read_block(lba, buf)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 写入一个块
    pub fn write_block(&self, lba: u64, data: &[u8]) -> Result<()> {
        self.check_range(lba)?;
        if data.len() != self.block_size {
            return Err(Error::new(ErrorKind::InvalidInput, "Buffer size does not match block size"));
        }
        if self.device.is_read_only() {
            return Err(Error::new(ErrorKind::ReadOnly, "Device is read-only"));
        }
        self.device.write_block(lba, data)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 刷新设备写缓存
    pub fn flush(&self) -> Result<()> {
        self.device.flush()?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 获取 I/O 统计信息
    pub fn stats(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDev")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("stats", &self.stats())
            .finish()
    }
}
