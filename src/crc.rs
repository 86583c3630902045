//! CRC32 校验和计算
//!
//! 为 journal commit block 提供默认的校验和函数

use crc32fast::Hasher;

/// 校验和函数类型：`(之前的值, 数据) -> 新值`
///
/// 任何满足追加语义的函数都可以作为 journal 的校验和
pub type ChecksumFn = fn(u32, &[u8]) -> u32;

/// 事务校验和的初始值
pub const JBD_CRC32_INIT: u32 = !0u32;

/// 计算 CRC32 校验和（一次性计算）
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 计算 CRC32 校验和（追加模式）
///
/// # 参数
/// * `crc` - 初始 CRC 值
/// * `data` - 要计算校验和的数据
///
/// # 返回
/// 更新后的 CRC32 值
#[inline]
pub fn crc32_append(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}
