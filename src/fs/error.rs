use thiserror::Error;

/// 文件系统操作失败的原因, 对外以 POSIX 错误码的形式呈现
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("permission denied")]
    AccessDenied,
    #[error("file name too long")]
    NameTooLong,
    #[error("file exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("no space left on device")]
    NoSpace,
    #[error("file too large")]
    FileTooLarge,
    #[error("bad file descriptor")]
    BadDescriptor,
    /// 超级块魔数不对: 口令错误或者后备存储已损坏
    #[error("open failed: incorrect password or corrupted stores")]
    InvalidFilesystem,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// 对应的 (正的) errno, 交给挂载层取负后返回
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::AccessDenied => libc::EACCES,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::AlreadyExists => libc::EEXIST,
            Self::DirectoryNotEmpty => libc::ENOTEMPTY,
            Self::OperationNotPermitted => libc::EPERM,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
            Self::BadDescriptor => libc::EBADF,
            Self::InvalidFilesystem => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
