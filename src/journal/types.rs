//! JBD 磁盘格式定义
//!
//! 这个模块定义了 journal 的所有磁盘格式结构以及它们的编码/解码。
//!
//! # 重要说明
//!
//! - **所有字段都是大端序（big-endian）**
//! - 使用 `byteorder::BigEndian` 按偏移读写字段，不做 packed 结构体转换
//!
//! # 对应关系
//!
//! 对应内核 `include/linux/jbd.h` 中的 `journal_header_t`、`journal_block_tag_t`、
//! `commit_header`、`journal_revoke_header_t` 和 `journal_superblock_t`

use super::JournalError;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

/// UUID 大小（128位）
pub const UUID_SIZE: usize = 16;

/// Journal 最大用户数
pub const JBD_USERS_MAX: usize = 48;

/// JBD magic number
pub const JBD_MAGIC_NUMBER: u32 = 0xC03B3998;

/// 块头大小：magic + blocktype + sequence
pub const JBD_HEADER_SIZE: usize = 12;

/// 描述符块中每个 tag 的大小：blocknr + flags
pub const JBD_TAG_SIZE: usize = 8;

/// revoke 块头大小：块头 + r_count
pub const JBD_REVOKE_HEADER_SIZE: usize = 16;

/// 磁盘上 superblock 的有效长度
pub const JBD_SUPERBLOCK_SIZE: usize = 1024;

/// commit 块中校验和数组的长度（u32 个数）
pub const JBD_CHECKSUM_WORDS: usize = 8;

/// CRC32 checksum size (bytes)
pub const JBD_CRC32_CHKSUM_SIZE: u8 = 4;

/// Commit 块头的编码长度
pub const JBD_COMMIT_HEADER_SIZE: usize = 60;

// =============================================================================
// Block Header and Types
// =============================================================================

/// 日志块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    /// 描述符块
    Descriptor = 1,
    /// 提交块
    Commit = 2,
    /// V1 superblock
    SuperblockV1 = 3,
    /// V2 superblock
    SuperblockV2 = 4,
    /// 撤销块
    Revoke = 5,
}

impl BlockType {
    /// 从磁盘值转换
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(BlockType::Descriptor),
            2 => Some(BlockType::Commit),
            3 => Some(BlockType::SuperblockV1),
            4 => Some(BlockType::SuperblockV2),
            5 => Some(BlockType::Revoke),
            _ => None,
        }
    }
}

/// 日志块头
///
/// 对应 `journal_header_t`，magic 字段不单独保存（解码时校验）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JbdHeader {
    /// 块类型（原始值，可能不是已知类型）
    pub blocktype: u32,
    /// 事务序列号
    pub sequence: u32,
}

impl JbdHeader {
    /// 创建新的块头
    pub fn new(blocktype: BlockType, sequence: u32) -> Self {
        Self {
            blocktype: blocktype as u32,
            sequence,
        }
    }

    /// 解码块头，magic 不匹配时返回 None
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < JBD_HEADER_SIZE || BigEndian::read_u32(&buf[0..4]) != JBD_MAGIC_NUMBER {
            return None;
        }
        Some(Self {
            blocktype: BigEndian::read_u32(&buf[4..8]),
            sequence: BigEndian::read_u32(&buf[8..12]),
        })
    }

    /// 编码到缓冲区开头
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], JBD_MAGIC_NUMBER);
        BigEndian::write_u32(&mut buf[4..8], self.blocktype);
        BigEndian::write_u32(&mut buf[8..12], self.sequence);
    }

    /// 已知的块类型
    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u32(self.blocktype)
    }
}

/// 块数据是否以 JBD magic 开头（需要转义）
pub fn starts_with_magic(data: &[u8]) -> bool {
    data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JBD_MAGIC_NUMBER
}

// =============================================================================
// Feature Flags
// =============================================================================

bitflags! {
    /// 兼容特性
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompatFeatures: u32 {
        /// commit 块携带描述符和数据块的 CRC32
        const CHECKSUM = 0x0000_0001;
    }

    /// 不兼容特性
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        /// 支持 revoke 块
        const REVOKE       = 0x0000_0001;
        /// 64 位块号
        const BIT64        = 0x0000_0002;
        /// 异步提交
        const ASYNC_COMMIT = 0x0000_0004;
        /// Checksum v2 (crc32c)
        const CSUM_V2      = 0x0000_0008;
        /// Checksum v3
        const CSUM_V3      = 0x0000_0010;
    }
}

/// 本实现能处理的兼容特性
pub const KNOWN_COMPAT_FEATURES: CompatFeatures = CompatFeatures::CHECKSUM;
/// 本实现能处理的不兼容特性
pub const KNOWN_INCOMPAT_FEATURES: IncompatFeatures = IncompatFeatures::REVOKE;
/// 本实现能处理的只读兼容特性（JBD 没有定义任何只读兼容特性）
pub const KNOWN_ROCOMPAT_FEATURES: u32 = 0;

// =============================================================================
// Block Tags (Descriptor Block)
// =============================================================================

bitflags! {
    /// 描述符 tag 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u32 {
        /// 数据块原本以 magic 开头，写入时已清零
        const ESCAPE    = 1;
        /// UUID 与前一个 tag 相同（tag 后面没有 UUID）
        const SAME_UUID = 2;
        /// 块已被本事务删除
        const DELETED   = 4;
        /// 描述符块中的最后一个 tag
        const LAST_TAG  = 8;
    }
}

/// 描述符块中的一个 tag
///
/// 对应 `journal_block_tag_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    /// 目标文件系统块号
    pub blocknr: u32,
    /// 标志
    pub flags: TagFlags,
}

impl BlockTag {
    /// 编码到缓冲区
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.blocknr);
        BigEndian::write_u32(&mut buf[4..8], self.flags.bits());
    }

    /// 从缓冲区解码
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            blocknr: BigEndian::read_u32(&buf[0..4]),
            flags: TagFlags::from_bits_retain(BigEndian::read_u32(&buf[4..8])),
        }
    }
}

/// 一个描述符块最多能容纳多少个 tag
///
/// 第一个 tag 后面跟着 16 字节 UUID，之后的 tag 都带 SAME_UUID
pub fn descriptor_capacity(block_size: usize) -> usize {
    let usable = block_size - JBD_HEADER_SIZE;
    if usable < JBD_TAG_SIZE + UUID_SIZE {
        return 0;
    }
    1 + (usable - JBD_TAG_SIZE - UUID_SIZE) / JBD_TAG_SIZE
}

/// 解码描述符块中的全部 tag
///
/// 遇到 LAST_TAG 或块结束时停止
pub fn decode_descriptor_tags(buf: &[u8]) -> Vec<BlockTag> {
    let mut tags = Vec::new();
    let mut offset = JBD_HEADER_SIZE;

    while offset + JBD_TAG_SIZE <= buf.len() {
        let tag = BlockTag::decode(&buf[offset..]);
        offset += JBD_TAG_SIZE;
        if !tag.flags.contains(TagFlags::SAME_UUID) {
            offset += UUID_SIZE;
        }
        tags.push(tag);
        if tag.flags.contains(TagFlags::LAST_TAG) {
            break;
        }
    }
    tags
}

// =============================================================================
// Commit Block
// =============================================================================

/// 校验和类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JbdChecksumType {
    Crc32 = 1,
    Md5 = 2,
    Sha1 = 3,
}

/// Commit 块头
///
/// 对应 `struct commit_header`
///
/// ```text
/// Offset  Size  Field
/// 0x0000  12    header
/// 0x000C  1     chksum_type
/// 0x000D  1     chksum_size
/// 0x000E  2     padding
/// 0x0010  32    chksum[8]
/// 0x0030  8     commit_sec
/// 0x0038  4     commit_nsec
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitHeader {
    /// 事务序列号
    pub sequence: u32,
    /// 校验和类型（0 表示没有）
    pub chksum_type: u8,
    /// 校验和长度
    pub chksum_size: u8,
    /// 校验和
    pub chksum: [u32; JBD_CHECKSUM_WORDS],
    /// 提交时间（秒）
    pub commit_sec: u64,
    /// 提交时间（纳秒）
    pub commit_nsec: u32,
}

impl CommitHeader {
    /// 不带校验和的 commit 块头
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            chksum_type: 0,
            chksum_size: 0,
            chksum: [0; JBD_CHECKSUM_WORDS],
            commit_sec: 0,
            commit_nsec: 0,
        }
    }

    /// 设置 CRC32 校验和
    pub fn set_crc32(&mut self, crc: u32) {
        self.chksum_type = JbdChecksumType::Crc32 as u8;
        self.chksum_size = JBD_CRC32_CHKSUM_SIZE;
        self.chksum[0] = crc;
    }

    /// 存储的 CRC32 校验和（类型不是 CRC32 时返回 None）
    pub fn crc32(&self) -> Option<u32> {
        (self.chksum_type == JbdChecksumType::Crc32 as u8
            && self.chksum_size == JBD_CRC32_CHKSUM_SIZE)
            .then_some(self.chksum[0])
    }

    /// 编码到缓冲区
    pub fn encode(&self, buf: &mut [u8]) {
        JbdHeader::new(BlockType::Commit, self.sequence).encode(buf);
        buf[12] = self.chksum_type;
        buf[13] = self.chksum_size;
        buf[14] = 0;
        buf[15] = 0;
        for (i, word) in self.chksum.iter().enumerate() {
            let off = 16 + i * 4;
            BigEndian::write_u32(&mut buf[off..off + 4], *word);
        }
        BigEndian::write_u64(&mut buf[48..56], self.commit_sec);
        BigEndian::write_u32(&mut buf[56..60], self.commit_nsec);
    }

    /// 解码（调用者已经确认块头是 commit 类型）
    pub fn decode(buf: &[u8]) -> Self {
        let mut chksum = [0u32; JBD_CHECKSUM_WORDS];
        for (i, word) in chksum.iter_mut().enumerate() {
            let off = 16 + i * 4;
            *word = BigEndian::read_u32(&buf[off..off + 4]);
        }
        Self {
            sequence: BigEndian::read_u32(&buf[8..12]),
            chksum_type: buf[12],
            chksum_size: buf[13],
            chksum,
            commit_sec: BigEndian::read_u64(&buf[48..56]),
            commit_nsec: BigEndian::read_u32(&buf[56..60]),
        }
    }
}

// =============================================================================
// Revoke Block
// =============================================================================

/// 一个 revoke 块最多能容纳多少条记录
pub fn revoke_capacity(block_size: usize) -> usize {
    (block_size - JBD_REVOKE_HEADER_SIZE) / 4
}

/// 编码 revoke 块
///
/// 对应 `journal_revoke_header_t`：`r_count` 是已用字节数（包含头部）
pub fn encode_revoke_block(buf: &mut [u8], sequence: u32, records: &[u32]) {
    assert!(records.len() <= revoke_capacity(buf.len()));

    JbdHeader::new(BlockType::Revoke, sequence).encode(buf);
    let used = JBD_REVOKE_HEADER_SIZE + records.len() * 4;
    BigEndian::write_u32(&mut buf[12..16], used as u32);

    let mut offset = JBD_REVOKE_HEADER_SIZE;
    for blocknr in records {
        BigEndian::write_u32(&mut buf[offset..offset + 4], *blocknr);
        offset += 4;
    }
}

/// 解码 revoke 块中的记录
///
/// `r_count` 越界时返回 None（视为损坏）
pub fn decode_revoke_records(buf: &[u8]) -> Option<Vec<u32>> {
    let used = BigEndian::read_u32(&buf[12..16]) as usize;
    if used < JBD_REVOKE_HEADER_SIZE || used > buf.len() {
        return None;
    }
    Some(
        buf[JBD_REVOKE_HEADER_SIZE..used]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect(),
    )
}

// =============================================================================
// Journal Superblock
// =============================================================================

/// Journal 超级块
///
/// 对应 `journal_superblock_t`
///
/// # 布局
///
/// ```text
/// Offset  Size  Field
/// 0x0000  12    header
/// 0x000C  4     blocksize
/// 0x0010  4     maxlen
/// 0x0014  4     first
/// 0x0018  4     sequence
/// 0x001C  4     start
/// 0x0020  4     errno
/// 0x0024  4     feature_compat
/// 0x0028  4     feature_incompat
/// 0x002C  4     feature_ro_compat
/// 0x0030  16    uuid
/// 0x0040  4     nr_users
/// 0x0044  4     dynsuper
/// 0x0048  4     max_transaction
/// 0x004C  4     max_trandata
/// 0x0100  768   users (48 * 16)
/// 0x0400  END
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSuperblock {
    /// V1 或 V2
    pub blocktype: BlockType,
    /// Journal device block size
    pub blocksize: u32,
    /// Total blocks in journal
    pub maxlen: u32,
    /// First block of log information
    pub first: u32,
    /// First commit ID expected in log
    pub sequence: u32,
    /// Block number of start of log (0 means the log is empty)
    pub start: u32,
    /// Error value (as set by abort)
    pub errno: i32,
    /// Compatible feature set
    pub feature_compat: CompatFeatures,
    /// Incompatible feature set
    pub feature_incompat: IncompatFeatures,
    /// Read-only compatible feature set
    pub feature_ro_compat: u32,
    /// 128-bit UUID for journal
    pub uuid: [u8; UUID_SIZE],
    /// Number of filesystems sharing log
    pub nr_users: u32,
    /// Block number of dynamic superblock copy
    pub dynsuper: u32,
    /// Limit of journal blocks per transaction
    pub max_transaction: u32,
    /// Limit of data blocks per transaction
    pub max_trandata: u32,
}

impl JournalSuperblock {
    /// 为新 journal 创建 V2 superblock
    ///
    /// 新 journal 的日志为空（`start == 0`），第一个事务的 tid 为 1
    pub fn new(blocksize: u32, maxlen: u32, first: u32, uuid: [u8; UUID_SIZE]) -> Self {
        Self {
            blocktype: BlockType::SuperblockV2,
            blocksize,
            maxlen,
            first,
            sequence: 1,
            start: 0,
            errno: 0,
            feature_compat: CompatFeatures::empty(),
            feature_incompat: IncompatFeatures::REVOKE,
            feature_ro_compat: 0,
            uuid,
            nr_users: 1,
            dynsuper: 0,
            max_transaction: 0,
            max_trandata: 0,
        }
    }

    /// 解码并校验 superblock
    ///
    /// magic 或块类型不对时返回 `InvalidSuperblock`；V1 superblock 没有特性字段
    pub fn decode(buf: &[u8]) -> core::result::Result<Self, JournalError> {
        if buf.len() < JBD_SUPERBLOCK_SIZE {
            return Err(JournalError::InvalidSuperblock);
        }
        let header = JbdHeader::decode(buf).ok_or(JournalError::InvalidSuperblock)?;
        let blocktype = match header.block_type() {
            Some(t @ (BlockType::SuperblockV1 | BlockType::SuperblockV2)) => t,
            _ => return Err(JournalError::InvalidSuperblock),
        };

        let mut sb = Self {
            blocktype,
            blocksize: BigEndian::read_u32(&buf[0x0C..0x10]),
            maxlen: BigEndian::read_u32(&buf[0x10..0x14]),
            first: BigEndian::read_u32(&buf[0x14..0x18]),
            sequence: BigEndian::read_u32(&buf[0x18..0x1C]),
            start: BigEndian::read_u32(&buf[0x1C..0x20]),
            errno: BigEndian::read_i32(&buf[0x20..0x24]),
            feature_compat: CompatFeatures::from_bits_retain(BigEndian::read_u32(&buf[0x24..0x28])),
            feature_incompat: IncompatFeatures::from_bits_retain(BigEndian::read_u32(
                &buf[0x28..0x2C],
            )),
            feature_ro_compat: BigEndian::read_u32(&buf[0x2C..0x30]),
            uuid: [0; UUID_SIZE],
            nr_users: BigEndian::read_u32(&buf[0x40..0x44]),
            dynsuper: BigEndian::read_u32(&buf[0x44..0x48]),
            max_transaction: BigEndian::read_u32(&buf[0x48..0x4C]),
            max_trandata: BigEndian::read_u32(&buf[0x4C..0x50]),
        };
        sb.uuid.copy_from_slice(&buf[0x30..0x40]);

        if blocktype == BlockType::SuperblockV1 {
            sb.feature_compat = CompatFeatures::empty();
            sb.feature_incompat = IncompatFeatures::empty();
            sb.feature_ro_compat = 0;
            sb.nr_users = 1;
        }
        Ok(sb)
    }

    /// 编码到缓冲区（只写前 1024 字节，块的其余部分保持不变）
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..JBD_SUPERBLOCK_SIZE].fill(0);
        JbdHeader::new(self.blocktype, 0).encode(buf);
        BigEndian::write_u32(&mut buf[0x0C..0x10], self.blocksize);
        BigEndian::write_u32(&mut buf[0x10..0x14], self.maxlen);
        BigEndian::write_u32(&mut buf[0x14..0x18], self.first);
        BigEndian::write_u32(&mut buf[0x18..0x1C], self.sequence);
        BigEndian::write_u32(&mut buf[0x1C..0x20], self.start);
        BigEndian::write_i32(&mut buf[0x20..0x24], self.errno);
        BigEndian::write_u32(&mut buf[0x24..0x28], self.feature_compat.bits());
        BigEndian::write_u32(&mut buf[0x28..0x2C], self.feature_incompat.bits());
        BigEndian::write_u32(&mut buf[0x2C..0x30], self.feature_ro_compat);
        buf[0x30..0x40].copy_from_slice(&self.uuid);
        BigEndian::write_u32(&mut buf[0x40..0x44], self.nr_users);
        BigEndian::write_u32(&mut buf[0x44..0x48], self.dynsuper);
        BigEndian::write_u32(&mut buf[0x48..0x4C], self.max_transaction);
        BigEndian::write_u32(&mut buf[0x4C..0x50], self.max_trandata);
        // users[0] 是本文件系统自己
        buf[0x100..0x110].copy_from_slice(&self.uuid);
    }

    /// 检查特性位，存在未知的不兼容或只读兼容特性时拒绝加载
    pub fn check_features(&self) -> core::result::Result<(), JournalError> {
        let unknown_incompat = self.feature_incompat.bits() & !KNOWN_INCOMPAT_FEATURES.bits();
        if unknown_incompat != 0 {
            return Err(JournalError::UnsupportedFeature(unknown_incompat));
        }
        let unknown_ro = self.feature_ro_compat & !KNOWN_ROCOMPAT_FEATURES;
        if unknown_ro != 0 {
            return Err(JournalError::UnsupportedFeature(unknown_ro));
        }
        Ok(())
    }

    /// 是否启用了 commit 校验和
    pub fn has_checksum(&self) -> bool {
        self.feature_compat.contains(CompatFeatures::CHECKSUM)
    }

    /// 日志为空（已 flush 或干净卸载）
    pub fn is_empty_log(&self) -> bool {
        self.start == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
