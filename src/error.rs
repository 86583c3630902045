//! 错误类型定义
//!
//! 提供 journal 操作的错误类型。
//!
//! 错误分为两类：
//! - 可恢复错误（`NoCredits`、`NoSpace` 等），由调用者自行重试或处理
//! - journal 级错误（`Io`、`Corrupted`、`ReadOnly`），会被记录到 journal 的 errno 中
//!
//! 真正的不变量破坏（对应 C 代码中的 `J_ASSERT`）直接 panic，不经过这里。

use core::fmt;

/// journal 操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数
    InvalidInput,
    /// 磁盘格式损坏
    Corrupted,
    /// 资源不存在
    NotFound,
    /// 空间不足
    NoSpace,
    /// 不支持的操作或特性
    Unsupported,
    /// 设备忙
    Busy,
    /// 无效状态
    InvalidState,
    /// handle 的 buffer credits 已用完（可重试）
    NoCredits,
    /// journal 已中止，只读
    ReadOnly,
}

impl ErrorKind {
    /// 对应的 errno 值（正数）
    pub const fn errno(self) -> i32 {
        match self {
            ErrorKind::Io => 5,            // EIO
            ErrorKind::InvalidInput => 22, // EINVAL
            ErrorKind::Corrupted => 117,   // EUCLEAN
            ErrorKind::NotFound => 2,      // ENOENT
            ErrorKind::NoSpace => 28,      // ENOSPC
            ErrorKind::Unsupported => 95,  // EOPNOTSUPP
            ErrorKind::Busy => 16,         // EBUSY
            ErrorKind::InvalidState => 22, // EINVAL
            ErrorKind::NoCredits => 28,    // ENOSPC
            ErrorKind::ReadOnly => 30,     // EROFS
        }
    }

    /// 是否可以由调用者重试
    pub const fn is_transient(self) -> bool {
        matches!(self, ErrorKind::NoCredits | ErrorKind::NoSpace | ErrorKind::Busy)
    }
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 创建带原因的错误
    ///
    /// 原因只会被记录到日志中，不会被保存
    pub fn with_cause(kind: ErrorKind, message: &'static str, cause: impl fmt::Debug) -> Self {
        log::debug!("{:?}: {} (cause: {:?})", kind, message, cause);
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 负的 errno 值，用于持久化到 journal superblock
    pub const fn errno(&self) -> i32 {
        -self.kind.errno()
    }

    /// 根据 journal superblock 中的 errno 还原错误类别
    pub fn from_errno(errno: i32) -> Self {
        let kind = match errno.abs() {
            5 => ErrorKind::Io,
            117 => ErrorKind::Corrupted,
            28 => ErrorKind::NoSpace,
            95 => ErrorKind::Unsupported,
            16 => ErrorKind::Busy,
            2 => ErrorKind::NotFound,
            30 => ErrorKind::ReadOnly,
            _ => ErrorKind::InvalidInput,
        };
        Self::new(kind, "journal recorded an error")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

// Journal error conversion
impl From<crate::journal::JournalError> for Error {
    fn from(err: crate::journal::JournalError) -> Self {
        use crate::journal::JournalError;
        match err {
            JournalError::InvalidSuperblock => Error::new(ErrorKind::Corrupted, "Invalid journal superblock"),
            JournalError::UnsupportedFeature(_) => Error::new(ErrorKind::Unsupported, "Unsupported journal feature"),
            JournalError::RecoveryFailed => Error::new(ErrorKind::Corrupted, "Journal recovery failed"),
            JournalError::NoSpace => Error::new(ErrorKind::NoSpace, "Journal has no space"),
            JournalError::IoError => Error::new(ErrorKind::Io, "Journal I/O error"),
            JournalError::Aborted => Error::new(ErrorKind::ReadOnly, "Journal has been aborted"),
            JournalError::NoCredits => Error::new(ErrorKind::NoCredits, "Handle has no buffer credits left"),
            JournalError::BmapMiss(_) => Error::new(ErrorKind::Io, "Journal block is not mapped"),
            JournalError::TooManyCredits(_) => Error::new(ErrorKind::InvalidInput, "Handle requested more credits than a transaction holds"),
            JournalError::NotJournaled => Error::new(ErrorKind::InvalidState, "Buffer has no write access in this transaction"),
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
