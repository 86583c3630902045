//! JBD 日志设备访问
//!
//! 负责 journal 逻辑块号到物理块号的映射，以及 journal superblock 的读写。
//!
//! journal 可以放在一段连续的设备区域上（[`LogMapping::Linear`]），
//! 也可以放在文件系统的一个普通文件里（[`LogMapping::File`]，通过 [`Bmap`] 映射）。

use super::{types::*, JournalError};
use crate::{
    block::{BlockDev, BlockDevice},
    error::{Error, Result},
};
use std::sync::Arc;

/// 文件型 journal 的块映射
///
/// 对应文件系统的 `bmap()`：journal 文件内的逻辑块号 → 设备物理块号
pub trait Bmap: Send + Sync {
    /// 映射一个逻辑块
    ///
    /// # 返回
    ///
    /// 逻辑块未分配时返回 `Ok(None)`，journal 会因此中止
    fn bmap(&self, logical: u32) -> Result<Option<u64>>;
}

/// journal 逻辑块到设备块的映射方式
#[derive(Clone)]
pub enum LogMapping {
    /// 连续设备区域：物理块号 = `offset` + 逻辑块号
    Linear {
        /// 逻辑块 0（superblock）所在的设备块
        offset: u64,
    },
    /// 文件型 journal
    File(Arc<dyn Bmap>),
}

impl core::fmt::Debug for LogMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LogMapping::Linear { offset } => f.debug_struct("Linear").field("offset", offset).finish(),
            LogMapping::File(_) => f.write_str("File(..)"),
        }
    }
}

/// JBD 日志设备实例
///
/// 持有块设备和映射方式，本身不可变，可以在线程之间共享
#[derive(Debug)]
pub struct JbdFs {
    /// 块设备（同时承载日志和文件系统块）
    dev: BlockDev,

    /// 逻辑块映射
    mapping: LogMapping,
}

impl JbdFs {
    /// 创建日志设备实例
    pub fn new(device: Arc<dyn BlockDevice>, mapping: LogMapping) -> Result<Self> {
        Ok(Self {
            dev: BlockDev::new(device)?,
            mapping,
        })
    }

    /// 块设备
    pub fn dev(&self) -> &BlockDev {
        &self.dev
    }

    /// 块大小
    pub fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    /// 将 journal 的逻辑块号映射到物理块号
    ///
    /// 对应 `journal_bmap()`
    pub fn bmap(&self, logical: u32) -> core::result::Result<u64, JournalError> {
        match &self.mapping {
            LogMapping::Linear { offset } => Ok(offset + logical as u64),
            LogMapping::File(map) => match map.bmap(logical) {
                Ok(Some(phys)) => Ok(phys),
                Ok(None) => {
                    log::error!("[JOURNAL] bmap miss for journal block {}", logical);
                    Err(JournalError::BmapMiss(logical))
                }
                Err(err) => {
                    log::error!("[JOURNAL] bmap of journal block {} failed: {}", logical, err);
                    Err(JournalError::IoError)
                }
            },
        }
    }

    /// 检查日志区域在设备范围之内
    pub fn check_extent(&self, maxlen: u32) -> Result<()> {
        if let LogMapping::Linear { offset } = self.mapping {
            if offset + maxlen as u64 > self.dev.total_blocks() {
                return Err(Error::from(JournalError::InvalidSuperblock));
            }
        }
        Ok(())
    }

    /// 读取一个日志块
    pub fn read_log_block(&self, logical: u32) -> Result<Vec<u8>> {
        let phys = self.bmap(logical)?;
        self.dev.read_block(phys)
    }

    /// 写入一个日志块
    pub fn write_log_block(&self, logical: u32, data: &[u8]) -> Result<()> {
        let phys = self.bmap(logical)?;
        self.dev.write_block(phys, data)
    }

    /// 读取 journal superblock（逻辑块 0）
    ///
    /// 对应 `journal_get_superblock()`：magic、块类型和块大小都要匹配
    pub fn read_superblock(&self) -> Result<JournalSuperblock> {
        let data = self.read_log_block(0)?;
        let sb = JournalSuperblock::decode(&data)?;

        if sb.blocksize as usize != self.block_size() {
            log::error!(
                "[JOURNAL] superblock block size {} does not match device block size {}",
                sb.blocksize,
                self.block_size()
            );
            return Err(Error::from(JournalError::InvalidSuperblock));
        }
        if sb.first == 0 || sb.first >= sb.maxlen {
            log::error!("[JOURNAL] corrupt journal extent first={} maxlen={}", sb.first, sb.maxlen);
            return Err(Error::from(JournalError::InvalidSuperblock));
        }
        self.check_extent(sb.maxlen)?;
        Ok(sb)
    }

    /// 写入 journal superblock 并刷新设备
    ///
    /// 对应 `journal_update_superblock()` 的 I/O 部分
    pub fn write_superblock(&self, sb: &JournalSuperblock) -> Result<()> {
        let mut data = vec![0u8; self.block_size()];
        sb.encode(&mut data);
        let phys = self.bmap(0)?;
        self.dev.write_block(phys, &data)?;
        self.dev.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    struct MapTable(HashMap<u32, u64>);

    impl Bmap for MapTable {
        fn bmap(&self, logical: u32) -> Result<Option<u64>> {
            Ok(self.0.get(&logical).copied())
        }
    }

    #[test]
    fn test_linear_mapping() {
        let mem = Arc::new(MemoryDevice::new(1024, 128));
        let fs = JbdFs::new(mem, LogMapping::Linear { offset: 20 }).unwrap();
        assert_eq!(fs.bmap(0).unwrap(), 20);
        assert_eq!(fs.bmap(5).unwrap(), 25);
        assert!(fs.check_extent(100).is_ok());
        assert!(fs.check_extent(120).is_err());
    }

    #[test]
    fn test_file_mapping_miss() {
        let mem = Arc::new(MemoryDevice::new(1024, 128));
        let table = MapTable(HashMap::from([(0, 90), (1, 77)]));
        let fs = JbdFs::new(mem, LogMapping::File(Arc::new(table))).unwrap();

        assert_eq!(fs.bmap(1).unwrap(), 77);
        assert!(matches!(fs.bmap(2), Err(JournalError::BmapMiss(2))));
    }

    #[test]
    fn test_superblock_round_trip_on_device() {
        let mem = Arc::new(MemoryDevice::new(1024, 128));
        let fs = JbdFs::new(mem.clone(), LogMapping::Linear { offset: 0 }).unwrap();

        let sb = JournalSuperblock::new(1024, 74, 10, [3u8; 16]);
        fs.write_superblock(&sb).unwrap();
        assert_eq!(fs.read_superblock().unwrap(), sb);

        // 块大小不匹配
        let bad = JournalSuperblock::new(4096, 74, 10, [3u8; 16]);
        fs.write_superblock(&bad).unwrap();
        assert_eq!(fs.read_superblock().unwrap_err().kind(), ErrorKind::Corrupted);
    }
}
