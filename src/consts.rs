/// Allocation granule. Every block size and every payload address is a multiple of this.
pub const LINE_SIZE: usize = 64;
pub const LINE_SIZE_LOG2: u32 = 6;

/// In-memory size of `BlockHeader`. One cache line.
pub const HEADER_SIZE: usize = 64;

/// A split remainder must hold a header and at least one line to become a new block.
pub const MINIMUM_SPLIT_SIZE: usize = HEADER_SIZE + LINE_SIZE;

/// Signature written into every live block header.
pub const BLOCK_TAG: u32 = 0x7F5B_C0DE;
/// Written over the tag of a header absorbed by coalescing.
pub const DEAD_TAG: u32 = 0xDEAD_B10C;

/// Number of exponential (first level) size classes.
pub const FIRST_INDEX_COUNT: usize = 32;
/// log2 of the number of linear sub-classes per first level class.
pub const SECOND_INDEX_LOG2: u32 = 6;
pub const SECOND_INDEX_COUNT: usize = 1 << SECOND_INDEX_LOG2;

/// Total number of buckets in the free-list index.
pub const TOTAL_COUNT: usize = FIRST_INDEX_COUNT * SECOND_INDEX_COUNT;

/// Largest request, in lines, whose search bucket still lands inside the last first level class.
///
/// The last class covers `[2^36, 2^37)` lines in steps of `2^30` lines, so rounding anything above
/// the start of its last bucket up to a bucket boundary would overflow the index.
pub const MAX_REQUEST_LINES: usize = (1 << 37) - (1 << 30);
/// Largest payload byte count `allocate` accepts.
pub const MAX_REQUEST_SIZE: usize = MAX_REQUEST_LINES << LINE_SIZE_LOG2;

/// Maximum number of contiguous regions one allocator can track.
pub const MAX_REGIONS: usize = 64;

/// Largest payload a single block may span; bigger sizes would map past the last class.
pub const MAX_BLOCK_SIZE: usize = ((1 << 37) - 1) << LINE_SIZE_LOG2;
/// Largest region the allocator carves; larger memory is clipped to this.
pub const MAX_REGION_SIZE: usize = MAX_BLOCK_SIZE + HEADER_SIZE;
