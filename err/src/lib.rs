#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(IoError),
    #[error("FS: {0}")]
    Fs(FsError),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("read failed at offset {offset}")]
    Read { offset: u64 },
    #[error("write failed at offset {offset}")]
    Write { offset: u64 },
    #[error("seek failed")]
    Seek,
    #[error("flush failed")]
    Flush,
    #[error("open failed")]
    Open,
    #[error("rename failed")]
    Rename,
    #[error("delete failed")]
    Delete,
    #[error("file is not open")]
    NotOpen,
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no space left on volume")]
    NoSpace,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("corruption: {0}")]
    Corruption(CorruptionKind),
    #[error("transaction: {0}")]
    Transaction(TransactionKind),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum CorruptionKind {
    #[error("CRC mismatch for cluster {cluster}")]
    ClusterCrc { cluster: u32 },
    #[error("FAT chain inconsistency at cluster {cluster}")]
    ChainInconsistency { cluster: u32 },
    #[error("cluster {cluster} is free but referenced by a chain")]
    DanglingReference { cluster: u32 },
    #[error("block-virtualization descriptor failed verification")]
    VirtualizationDescriptor,
    #[error("volume descriptor magic mismatch")]
    VolumeMagic,
}

#[derive(thiserror::Error, Debug)]
pub enum TransactionKind {
    #[error("a transaction is already in progress")]
    AlreadyStarted,
    #[error("commit called without a started transaction")]
    NotStarted,
    #[error("failed to restore volume state from the transaction log")]
    RestoreFailed,
    #[error("volume cannot expand beyond its configured maximum block count")]
    CannotExpand,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub fn not_found() -> Self {
        Error::Fs(FsError::NotFound)
    }

    pub fn invalid_argument(msg: &'static str) -> Self {
        Error::Fs(FsError::InvalidArgument(msg))
    }

    pub fn invalid_state(msg: &'static str) -> Self {
        Error::Fs(FsError::InvalidState(msg))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Fs(FsError::Corruption(_)))
    }
}
