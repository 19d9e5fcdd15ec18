use super::consts::*;

/// Calculate most significant bit of value.
///
/// If given value is 0, function is failed and returned empty value.
///
/// # Arguments
///
/// * 'value' - target value to calculate.
#[inline]
pub fn calculate_msb(value: u64) -> Option<u32> {
    if value == 0 {
        None
    } else {
        Some(u64::BITS - 1 - value.leading_zeros())
    }
}

/// Calculate least significant bit of given value.
///
/// If given value is 0, function is failed and return empty value.
///
/// # Arguments
///
/// * 'value' - target value to calculate.
#[inline]
pub fn calculate_lsb(value: u64) -> Option<u32> {
    if value == 0 {
        None
    } else {
        Some(value.trailing_zeros())
    }
}

/// Calculate mapping indices that represents which bucket holds a free block of `block_size`.
///
/// # Arguments
///
/// * 'block_size' - Line aligned payload size of the block.
pub fn calculate_mapping_indices(block_size: usize) -> (usize, usize) {
    debug_assert!(is_aligned(block_size));
    let lines = (block_size >> LINE_SIZE_LOG2) as u64;

    if lines < SECOND_INDEX_COUNT as u64 {
        // Linear region, one line per bucket.
        (0, lines as usize)
    } else {
        // * Example
        // 64 lines: msb is 6, so (6 - 5, (64 >> 0) - 64) = (1, 0).
        // 99 lines: (1, 35).
        // 128 lines: msb is 7, (2, (128 >> 1) - 64) = (2, 0).
        //
        // * Fragmentation
        // [64, 128) lines => 1 line * 64. (1, x)
        // [128, 256) lines => 2 lines * 64. (2, x)
        // ...
        let msb = calculate_msb(lines).unwrap_or(0);
        let first = (msb - (SECOND_INDEX_LOG2 - 1)) as usize;
        let second = ((lines >> (msb - SECOND_INDEX_LOG2)) as usize) - SECOND_INDEX_COUNT;
        debug_assert!(first < FIRST_INDEX_COUNT);
        (first, second)
    }
}

/// Round a line aligned size up to the smallest size of the next bucket boundary.
///
/// Every block at least this large lives in the bucket of the rounded size or above it.
/// Return `None` when the rounded size falls outside the index.
pub fn round_up_bucket(size: usize) -> Option<usize> {
    debug_assert!(is_aligned(size));
    let mut lines = size >> LINE_SIZE_LOG2;
    if lines > MAX_REQUEST_LINES {
        return None;
    }

    if lines >= SECOND_INDEX_COUNT {
        let msb = calculate_msb(lines as u64)?;
        let t = (1usize << (msb - SECOND_INDEX_LOG2)) - 1;
        lines += t;
        lines &= !t;
    }
    Some(lines << LINE_SIZE_LOG2)
}

/// Calculate the first bucket whose every block can hold `size` bytes.
///
/// The size is rounded up to the next bucket boundary before mapping, so a block taken from the
/// returned bucket (or any bucket above it) is never smaller than `size`.
pub fn calculate_searching_indices(size: usize) -> Option<(usize, usize)> {
    round_up_bucket(size).map(calculate_mapping_indices)
}

/// Calculate actual block payload size of given request size.
///
/// Zero-byte requests still take one line. Return `None` if the request is larger than
/// `MAX_REQUEST_SIZE`.
///
/// # Arguments
///
/// * 'size' - Requested allocation size.
#[inline]
pub fn calculate_allocation_size(size: usize) -> Option<usize> {
    if size > MAX_REQUEST_SIZE {
        None
    } else {
        Some(round_up_line(std::cmp::max(size, LINE_SIZE)))
    }
}

/// Round up to 'LINE_SIZE'.
///
/// # Arguments
///
/// * 'value' - Value to round up.
#[inline(always)]
pub const fn round_up_line(value: usize) -> usize {
    const MASK: usize = LINE_SIZE - 1;
    (value + MASK) & !MASK
}

/// Round down to 'LINE_SIZE'.
///
/// # Arguments
///
/// * 'value' - Value to round down.
#[inline(always)]
pub const fn round_down_line(value: usize) -> usize {
    const MASK: usize = LINE_SIZE - 1;
    value & !MASK
}

/// Check given value is aligned to 'LINE_SIZE'.
#[inline(always)]
pub const fn is_aligned(value: usize) -> bool {
    (value & (LINE_SIZE - 1)) == 0
}

/// Calculate index to insert into freed block item map.
///
/// # Arguments
///
/// * 'mapping_indices' - first and second level index to calculate.
#[inline(always)]
pub const fn calculate_index(mapping_indices: (usize, usize)) -> usize {
    let (first, second) = mapping_indices;
    first * SECOND_INDEX_COUNT + second
}

#[inline(always)]
pub const fn megabytes_of(size: usize) -> usize {
    size * 1024 * 1024
}

/// Size of the pool to request so that a block of `needed` payload bytes fits in it.
///
/// Never smaller than `default_pool_size`.
pub fn next_pool_size(default_pool_size: usize, needed: usize) -> usize {
    std::cmp::max(round_up_line(needed) + HEADER_SIZE, default_pool_size)
}

/// Round up to 'LINE_SIZE', or return `None` if the result does not fit in `usize`.
#[inline]
pub fn checked_round_up_line(value: usize) -> Option<usize> {
    value.checked_add(LINE_SIZE - 1).map(round_down_line)
}

/// Split `pool_size` into equally sized regions no larger than `limit`.
///
/// Return `(region_size, region_count)`. When `pool_size` exceeds `limit`, the pool is rounded up
/// to a whole number of `limit` sized regions.
///
/// # Arguments
///
/// * 'limit' - Largest region size, at least one line.
pub fn calculate_region_layout(pool_size: usize, limit: usize) -> (usize, usize) {
    let limit = round_down_line(limit);
    debug_assert!(limit > 0);
    if pool_size <= limit {
        (pool_size, 1)
    } else {
        let count = pool_size / limit + usize::from(pool_size % limit != 0);
        (limit, count)
    }
}
