use std::fmt;
use std::io;

/// The three regions a hash set maps inside its segment, in layout order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Entry,
    Meta,
    Slots,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Entry => "entry",
            Region::Meta => "meta",
            Region::Slots => "slots",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("segment is not enough to map hash set {region}: need {required} bytes, have {available}")]
    InsufficientSegment {
        region: Region,
        required: usize,
        available: usize,
    },

    #[error("segment base {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: usize, align: usize },

    #[error("invalid hash set parameter: {0}")]
    InvalidParameter(&'static str),

    #[error(
        "segment was created with capacity {found_capacity} and {found_buckets} buckets, \
         attach requested capacity {capacity} and {buckets} buckets"
    )]
    LayoutMismatch {
        capacity: u32,
        buckets: u32,
        found_capacity: u32,
        found_buckets: u32,
    },

    #[error("invalid entry handle (index {index}, generation {generation})")]
    InvalidHandle { index: u32, generation: u32 },

    #[error("hash set corrupted: {0}")]
    Corrupted(&'static str),

    #[error("invalid shared metrics file: {0}")]
    BadHeader(&'static str),

    #[error("shared metrics region header is not published yet")]
    Unpublished,

    #[error("invalid store config: {0}")]
    Config(String),

    #[error("failed to parse store config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("shared memory metrics are not supported on this platform")]
    Unsupported,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
