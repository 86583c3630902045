//! 块设备抽象
//!
//! 提供块设备接口和块级 I/O 操作。
//! block/device.rs 定义设备接口以及带统计的共享包装器 `BlockDev`
//! block/memory.rs 提供内存设备，用于测试和崩溃模拟

mod device;
mod memory;

pub use device::{BlockDev, BlockDevice, IoStats, MIN_BLOCK_SIZE};
pub use memory::{IoEvent, MemoryDevice};
