//! 块缓存实现（基于 lru crate）
//!
//! 对应内核 buffer cache 中 journal 依赖的部分：按块号查找唯一的 `BufferHead`，
//! 以及 checkpoint 时把脏块写回原始位置。
//!
//! # 驱逐策略
//!
//! 只驱逐"没人用"的干净块：
//! - 除缓存自身外没有其他引用（journal head、handle 都会持有 `Arc`）
//! - 没有 `DIRTY` / `JBDDIRTY` / `JBD` 标志
//!
//! 全部块都被钉住时返回 `NoSpace`，调用者应先 checkpoint 或 flush。

use super::buffer::{BufferFlags, BufferHead, BufferRef};
use crate::{
    block::BlockDev,
    error::{Error, ErrorKind, Result},
};
use core::num::NonZeroUsize;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// 默认缓存块数量
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 总访问次数
    pub total_accesses: u64,
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// 脏块写回次数
    pub writebacks: u64,
    /// 驱逐次数
    pub evictions: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_accesses as f64
        }
    }
}

struct CacheInner {
    cache: LruCache<u64, BufferRef>,
    stats: CacheStats,
}

/// 块缓存
///
/// 内部加锁，可以在线程之间共享。锁只保护索引，从不跨越设备 I/O。
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    block_size: usize,
}

fn is_pinned(buf: &BufferRef) -> bool {
    if Arc::strong_count(buf) > 1 {
        return true;
    }
    match buf.try_lock() {
        Some(state) => state
            .flags
            .intersects(BufferFlags::DIRTY | BufferFlags::JBDDIRTY | BufferFlags::JBD),
        None => true,
    }
}

impl CacheInner {
    fn lookup(&mut self, lba: u64) -> Option<BufferRef> {
        self.stats.total_accesses += 1;
        match self.cache.get(&lba) {
            Some(buf) => {
                self.stats.hits += 1;
                Some(Arc::clone(buf))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// 驱逐一个块为新块腾出空间
    ///
    /// lru crate 的 iter() 按 MRU 到 LRU 顺序遍历，所以从尾部开始找。
    fn evict_for_new_block(&mut self) -> Result<()> {
        let victim = self
            .cache
            .iter()
            .rev()
            .find(|(_, buf)| !is_pinned(buf))
            .map(|(lba, _)| *lba);

        match victim {
            Some(lba) => {
                self.cache.pop(&lba);
                self.stats.evictions += 1;
                log::trace!("[CACHE] Evicted clean block LBA={:#x}", lba);
                Ok(())
            }
            None => {
                log::error!("[CACHE] Cannot evict: all {} blocks are pinned", self.cache.len());
                Err(Error::new(
                    ErrorKind::NoSpace,
                    "All cache blocks are pinned, cannot evict",
                ))
            }
        }
    }

    /// 插入新块；如果其他线程已经插入了同一个块，返回已有的那个
    fn insert(&mut self, buf: BufferRef) -> Result<BufferRef> {
        if let Some(existing) = self.cache.get(&buf.blocknr()) {
            return Ok(Arc::clone(existing));
        }
        if self.cache.len() >= self.cache.cap().get() {
            self.evict_for_new_block()?;
        }
        self.cache.put(buf.blocknr(), Arc::clone(&buf));
        Ok(buf)
    }
}

impl BlockCache {
    /// 创建新的块缓存
    ///
    /// # 参数
    ///
    /// * `capacity` - 缓存容量（块数量，至少为 1）
    /// * `block_size` - 块大小（字节）
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                cache: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            block_size,
        }
    }

    /// 查找缓存块，不存在时从设备读取
    ///
    /// 对应 `__bread()`
    pub fn get_or_read(&self, dev: &BlockDev, lba: u64) -> Result<BufferRef> {
        if let Some(buf) = self.inner.lock().lookup(lba) {
            return Ok(buf);
        }

        // 读设备时不持有缓存锁
        let data = dev.read_block(lba)?;
        let buf = Arc::new(BufferHead::new(lba, data, BufferFlags::UPTODATE));
        log::trace!("[CACHE] read LBA={:#x} from device", lba);
        self.inner.lock().insert(buf)
    }

    /// 获取缓存块但不读取设备（新分配的块，内容全零）
    ///
    /// 对应 `__getblk()`
    pub fn getblk(&self, lba: u64) -> Result<BufferRef> {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.lookup(lba) {
            return Ok(buf);
        }
        let buf = Arc::new(BufferHead::new(
            lba,
            vec![0u8; self.block_size],
            BufferFlags::UPTODATE,
        ));
        inner.insert(buf)
    }

    /// 查找缓存块，不读取设备也不创建
    pub fn peek(&self, lba: u64) -> Option<BufferRef> {
        self.inner.lock().cache.peek(&lba).cloned()
    }

    /// 把一个脏块写回原始位置
    ///
    /// # 返回
    ///
    /// 真正发生写入时返回 true
    pub fn sync_buffer(&self, dev: &BlockDev, buf: &BufferRef) -> Result<bool> {
        let data = {
            let mut state = buf.lock();
            if !state.flags.contains(BufferFlags::DIRTY) {
                return Ok(false);
            }
            state.flags.remove(BufferFlags::DIRTY);
            state.snapshot()
        };

        if let Err(err) = dev.write_block(buf.blocknr(), &data) {
            buf.lock().flags.insert(BufferFlags::DIRTY);
            return Err(err);
        }

        self.inner.lock().stats.writebacks += 1;
        log::trace!("[CACHE] wrote back LBA={:#x}", buf.blocknr());
        Ok(true)
    }

    /// 写回所有普通脏块
    ///
    /// 对应 `sync_blockdev()`；被 journal 接管的块（JBDDIRTY）不在此列
    pub fn flush_all(&self, dev: &BlockDev) -> Result<usize> {
        let dirty: Vec<BufferRef> = {
            let inner = self.inner.lock();
            inner
                .cache
                .iter()
                .filter(|(_, buf)| buf.is_dirty())
                .map(|(_, buf)| Arc::clone(buf))
                .collect()
        };

        log::debug!("[CACHE] Flushing {} dirty blocks", dirty.len());

        let mut written = 0;
        for buf in &dirty {
            if self.sync_buffer(dev, buf)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// 使块无效（从缓存中移除）
    pub fn invalidate(&self, lba: u64) -> Option<BufferRef> {
        self.inner.lock().cache.pop(&lba)
    }

    /// 获取缓存统计信息
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// 获取缓存容量
    pub fn capacity(&self) -> usize {
        self.inner.lock().cache.cap().get()
    }

    /// 获取当前缓存块数量
    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// 检查缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.inner.lock().cache.is_empty()
    }

    /// 获取普通脏块数量
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .cache
            .iter()
            .filter(|(_, buf)| buf.is_dirty())
            .count()
    }
}

impl core::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BlockCache")
            .field("capacity", &inner.cache.cap())
            .field("len", &inner.cache.len())
            .field("block_size", &self.block_size)
            .field("stats", &inner.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;

    fn bdev(blocks: u64) -> (Arc<MemoryDevice>, BlockDev) {
        let mem = Arc::new(MemoryDevice::new(1024, blocks));
        let dev = BlockDev::new(mem.clone()).unwrap();
        (mem, dev)
    }

    #[test]
    fn test_get_reads_device_once() {
        let (mem, dev) = bdev(16);
        mem.set_block(3, &[0x5A; 1024]);
        let cache = BlockCache::new(8, 1024);

        let a = cache.get_or_read(&dev, 3).unwrap();
        let b = cache.get_or_read(&dev, 3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.snapshot()[0], 0x5A);
        assert_eq!(dev.stats().reads, 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction_skips_pinned() {
        let cache = BlockCache::new(2, 1024);

        let pinned = cache.getblk(1).unwrap();
        drop(cache.getblk(2).unwrap());

        // 块 1 被外部引用，应该驱逐块 2
        cache.getblk(3).unwrap();
        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_none());
        drop(pinned);
    }

    #[test]
    fn test_all_pinned_is_no_space() {
        let cache = BlockCache::new(1, 1024);
        let buf = cache.getblk(1).unwrap();
        buf.mark_dirty();
        drop(buf);

        let err = cache.getblk(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_sync_and_flush_all() {
        let (mem, dev) = bdev(16);
        let cache = BlockCache::new(8, 1024);

        for lba in 4..7 {
            let buf = cache.getblk(lba).unwrap();
            buf.with_data_mut(|d| d[0] = lba as u8);
            buf.mark_dirty();
        }
        assert_eq!(cache.dirty_count(), 3);

        assert_eq!(cache.flush_all(&dev).unwrap(), 3);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(mem.block(5)[0], 5);
        assert_eq!(cache.stats().writebacks, 3);
    }

    #[test]
    fn test_sync_failure_keeps_dirty() {
        let (mem, dev) = bdev(16);
        let cache = BlockCache::new(8, 1024);
        let buf = cache.getblk(9).unwrap();
        buf.mark_dirty();

        mem.fail_writes_to(9);
        assert!(cache.sync_buffer(&dev, &buf).is_err());
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_invalidate() {
        let cache = BlockCache::new(4, 1024);
        cache.getblk(10).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate(10).is_some());
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 4);
    }
}
