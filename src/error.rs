use thiserror::Error;

/// Runtime failures of the allocator.
///
/// Caller bugs such as freeing a foreign pointer are not reported here; they panic at the
/// offending call instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsfError {
    #[error("backing allocator could not supply a region of {size} bytes")]
    BackingExhausted { size: usize },

    #[error("request of {size} bytes exceeds the largest block of {limit} bytes")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("pool registry is full ({limit} regions)")]
    PoolLimit { limit: usize },

    #[error("external region of {size} bytes cannot hold a single block")]
    ExternalTooSmall { size: usize },
}

/// First broken invariant found by `Tlsf::check_integrity`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("block at {addr:#x} has tag {tag:#x}")]
    BadTag { addr: usize, tag: u32 },

    #[error("block at {addr:#x} belongs to another allocator")]
    ForeignOwner { addr: usize },

    #[error("block at {addr:#x} does not start where its predecessor ends")]
    NotAdjacent { addr: usize },

    #[error("block at {addr:#x} has a stale back link")]
    BrokenPoolLink { addr: usize },

    #[error("blocks at {first:#x} and {second:#x} are both free")]
    UncoalescedNeighbors { first: usize, second: usize },

    #[error("region at {addr:#x} spans {walked} bytes of blocks instead of {expected}")]
    RegionSizeMismatch {
        addr: usize,
        walked: usize,
        expected: usize,
    },

    #[error("free block at {addr:#x} is in bucket ({first}, {second}) but its size maps elsewhere")]
    WrongBucket {
        addr: usize,
        first: usize,
        second: usize,
    },

    #[error("bucket ({first}, {second}) list is inconsistent at {addr:#x}")]
    BrokenFreeLink {
        addr: usize,
        first: usize,
        second: usize,
    },

    #[error("bitmap disagrees with bucket ({first}, {second})")]
    BitmapMismatch { first: usize, second: usize },

    #[error("{indexed} blocks are indexed but {walked} free blocks were found in the regions")]
    FreeCountMismatch { indexed: usize, walked: usize },

    #[error("{recorded} bytes are recorded as used but {walked} were found")]
    UsedBytesMismatch { recorded: usize, walked: usize },
}
