use std::io;
use thiserror::Error;

/// Every failure the library can surface. Format-integrity errors are scoped
/// to the attribute or stream being read; none of them is fatal to the caller.
#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("malformed data-run header 0x{header:02X} at offset {offset}")]
    MalformedRunHeader { offset: usize, header: u8 },

    #[error("run list truncated at offset {offset} (bound {bound})")]
    TruncatedRunList { offset: usize, bound: usize },

    #[error(
        "run list covers VCN {actual_start}..={actual_end}, attribute declares {declared_start}..={declared_end}"
    )]
    RunListVcnMismatch {
        declared_start: u64,
        declared_end: u64,
        actual_start: u64,
        actual_end: u64,
    },

    #[error("corrupt run list: {0}")]
    CorruptRunList(String),

    #[error("seek to {target} outside stream of {length} bytes")]
    OutOfRange { target: i128, length: u64 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("disk read at 0x{offset:X} returned {got} of {wanted} bytes")]
    DiskReadShortfall { offset: u64, wanted: usize, got: usize },

    #[error("stream is closed")]
    StreamClosed,

    #[error("LZNT1 decompression failed: {0}")]
    Decompression(String),

    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("invalid MFT record: {0}")]
    InvalidRecord(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NtfsError>;

impl From<NtfsError> for io::Error {
    fn from(err: NtfsError) -> Self {
        let kind = match &err {
            NtfsError::Io(e) => return io::Error::new(e.kind(), err.to_string()),
            NtfsError::OutOfRange { .. } => io::ErrorKind::InvalidInput,
            NtfsError::Unsupported(_) => io::ErrorKind::Unsupported,
            NtfsError::DiskReadShortfall { .. } => io::ErrorKind::UnexpectedEof,
            NtfsError::StreamClosed => io::ErrorKind::NotConnected,
            NtfsError::NotFound(_) => io::ErrorKind::NotFound,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
