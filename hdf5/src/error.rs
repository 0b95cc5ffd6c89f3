use thiserror::Error;

#[derive(Error, Debug)]
pub enum Hdf5Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed file at offset {offset}: {detail}")]
    MalformedFile { offset: u64, detail: String },

    #[error("unsupported format at offset {offset}: {detail}")]
    UnsupportedFormat { offset: u64, detail: String },

    #[error("invalid fixed-point width: {0}")]
    InvalidWidth(u8),

    #[error("malformed heap at offset {offset}: {detail}")]
    MalformedHeap { offset: u64, detail: String },

    #[error("malformed B-tree at offset {offset}: {detail}")]
    MalformedTree { offset: u64, detail: String },

    #[error("malformed string at offset {offset}")]
    MalformedString { offset: u64 },

    #[error("malformed {kind} message at offset {offset}: {detail}")]
    MalformedMessage {
        kind: &'static str,
        offset: u64,
        detail: String,
    },

    #[error("duplicate link name {name:?} in group at offset {offset}")]
    DuplicateLink { name: String, offset: u64 },

    #[error("checksum mismatch at offset {offset}: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("misaligned read: offset {offset} / length {length} not a multiple of element size {element_size}")]
    MisalignedRead {
        offset: u64,
        length: u64,
        element_size: u64,
    },

    #[error("unsupported fill value: {0}")]
    UnsupportedFill(String),

    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    #[error("allocation of {requested} bytes exceeds configured limit of {limit}")]
    AllocationLimit { requested: u64, limit: u64 },
}

pub type Result<T> = std::result::Result<T, Hdf5Error>;
