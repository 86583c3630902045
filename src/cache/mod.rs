//! 块缓存模块
//!
//! journal 下面的 buffer cache：每个文件系统块在内存中只有一个 [`BufferHead`]，
//! journal 在上面附加 journal head，checkpoint 通过这里把块写回原始位置。
//!
//! # 主要组件
//!
//! - [`BufferHead`] - 单个缓存块，数据写时复制，自带 per-buffer 锁
//! - [`BlockCache`] - 块缓存管理器，使用 lru crate 提供 LRU 驱逐
//! - [`BufferFlags`] - 缓存块状态标志
//! - [`CacheStats`] - 缓存统计信息
//!
//! # 与内核的对应关系
//!
//! | Linux                      | jbd_core                        |
//! |----------------------------|---------------------------------|
//! | `struct buffer_head`       | [`BufferHead`]                  |
//! | `BH_Dirty` / `BH_JBDDirty` | [`BufferFlags`]                 |
//! | `__bread()`                | [`BlockCache::get_or_read()`]   |
//! | `__getblk()`               | [`BlockCache::getblk()`]        |
//! | `sync_dirty_buffer()`      | [`BlockCache::sync_buffer()`]   |
//! | `sync_blockdev()`          | [`BlockCache::flush_all()`]     |

mod block_cache;
mod buffer;

pub use block_cache::{BlockCache, CacheStats, DEFAULT_CACHE_SIZE};
pub use buffer::{BufferFlags, BufferHead, BufferRef, BufferState};
