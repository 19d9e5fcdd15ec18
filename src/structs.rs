//! In-memory layout of the allocator: block headers, the free-list index and pool regions.
//!
//! Every raw pointer dereference of the crate lives in this module. Callers hand in
//! `NonNull<BlockHeader>` values that point at headers written by `initialize_region` or
//! `BlockHeader::split`, and the methods here keep the header links consistent.

use super::{consts::*, function::*};
use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifies the allocator instance that produced a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Draw a fresh identifier. Identifiers are never reused within a process.
    pub fn next() -> Self {
        static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Header that precedes to actual buffer memory in a pool region.
///
/// Exactly one cache line, so payloads stay line aligned.
#[repr(C, align(64))]
pub struct BlockHeader {
    /// Payload byte count, excluding this header.
    size: usize,
    /// Address-adjacent blocks of the same region.
    prev_in_pool: Option<NonNull<BlockHeader>>,
    next_in_pool: Option<NonNull<BlockHeader>>,
    /// Bucket list links, only meaningful while the block is free.
    prev_free: Option<NonNull<BlockHeader>>,
    next_free: Option<NonNull<BlockHeader>>,
    owner: OwnerId,
    tag: u32,
    is_free: bool,
}

const _: () = assert!(mem::size_of::<BlockHeader>() == HEADER_SIZE);
const _: () = assert!(mem::align_of::<BlockHeader>() == LINE_SIZE);

impl BlockHeader {
    /// Create new free block header with no neighbors.
    ///
    /// # Arguments
    ///
    /// * 'buffer_size' - Line aligned payload size.
    /// * 'owner' - Allocator instance owning the block.
    pub fn new(buffer_size: usize, owner: OwnerId) -> Self {
        debug_assert!(is_aligned(buffer_size));
        Self {
            size: buffer_size,
            prev_in_pool: None,
            next_in_pool: None,
            prev_free: None,
            next_free: None,
            owner,
            tag: BLOCK_TAG,
            is_free: true,
        }
    }

    /// Recover the header preceding a payload pointer.
    ///
    /// # Safety
    ///
    /// `buffer` must be at least `HEADER_SIZE` bytes past the start of a readable allocation.
    pub unsafe fn from_buffer_ptr(buffer: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked(buffer.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader)
    }

    /// Get the payload pointer of a block, keeping the provenance of `block_ptr`.
    ///
    /// # Safety
    ///
    /// `block_ptr` must point to a header inside a region.
    pub unsafe fn payload_ptr(block_ptr: NonNull<BlockHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(block_ptr.as_ptr().cast::<u8>().add(HEADER_SIZE))
    }

    /// Get payload size.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Get block header and buffer combined byte size.
    pub fn buffer_size_with_header(&self) -> usize {
        HEADER_SIZE + self.size
    }

    /// Set new buffer size.
    ///
    /// # Arguments
    ///
    /// * 'size' - 'LINE_SIZE' aligned new buffer size.
    pub fn set_buffer_size(&mut self, size: usize) {
        debug_assert!(is_aligned(size));
        self.size = size;
    }

    /// Get the payload pointer following this header.
    pub fn buffer_ptr(&self) -> NonNull<u8> {
        let ptr = (self as *const Self) as *mut u8;
        // A header is never the last byte of the address space, so the offset is non-null.
        unsafe { NonNull::new_unchecked(ptr.add(HEADER_SIZE)) }
    }

    /// Address one past the end of the payload, i.e. where an adjacent block would start.
    pub fn buffer_end_addr(&self) -> usize {
        self.buffer_ptr().as_ptr() as usize + self.size
    }

    pub fn is_freed(&self) -> bool {
        self.is_free
    }

    pub fn set_freed(&mut self, is_free: bool) {
        self.is_free = is_free;
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn has_valid_tag(&self) -> bool {
        self.tag == BLOCK_TAG
    }

    /// Mark header as no longer describing a block.
    pub fn invalidate(&mut self) {
        self.tag = DEAD_TAG;
        self.is_free = false;
        self.prev_free = None;
        self.next_free = None;
    }

    pub fn prev_in_pool(&self) -> Option<NonNull<BlockHeader>> {
        self.prev_in_pool
    }

    pub fn next_in_pool(&self) -> Option<NonNull<BlockHeader>> {
        self.next_in_pool
    }

    pub fn prev_free(&self) -> Option<NonNull<BlockHeader>> {
        self.prev_free
    }

    pub fn next_free(&self) -> Option<NonNull<BlockHeader>> {
        self.next_free
    }

    /// Cut the payload down to `size` bytes and write a new free header right after it.
    ///
    /// The new block takes the rest of the payload minus one header and is spliced into the
    /// region's adjacency chain. It is not inserted into any free list.
    ///
    /// # Safety
    ///
    /// `block_ptr` must point to a valid header with `buffer_size() >= size + MINIMUM_SPLIT_SIZE`.
    pub unsafe fn split(block_ptr: NonNull<BlockHeader>, size: usize) -> NonNull<BlockHeader> {
        let new_block_ptr = NonNull::new_unchecked(
            Self::payload_ptr(block_ptr).as_ptr().add(size) as *mut BlockHeader,
        );
        let block = &mut *block_ptr.as_ptr();
        debug_assert!(block.buffer_size() >= size + MINIMUM_SPLIT_SIZE);

        let remained_size = block.buffer_size() - size;
        let new_buffer_size = remained_size - HEADER_SIZE;
        ptr::write(
            new_block_ptr.as_ptr(),
            BlockHeader::new(new_buffer_size, block.owner),
        );

        // Splice new block between `block` and its old successor.
        let new_block = &mut *new_block_ptr.as_ptr();
        new_block.prev_in_pool = Some(block_ptr);
        new_block.next_in_pool = block.next_in_pool;
        if let Some(next_block) = block.next_in_pool {
            (*next_block.as_ptr()).prev_in_pool = Some(new_block_ptr);
        }
        block.next_in_pool = Some(new_block_ptr);
        block.set_buffer_size(size);

        new_block_ptr
    }

    /// Absorb the address-following block into this one and invalidate its header.
    ///
    /// # Safety
    ///
    /// `block_ptr` must have a `next_in_pool` neighbor that is not linked in any free list.
    pub unsafe fn absorb_next(block_ptr: NonNull<BlockHeader>) {
        let block = &mut *block_ptr.as_ptr();
        let next_ptr = match block.next_in_pool {
            None => return,
            Some(next_ptr) => next_ptr,
        };
        debug_assert_eq!(block.buffer_end_addr(), next_ptr.as_ptr() as usize);
        let next_block = &mut *next_ptr.as_ptr();

        block.set_buffer_size(block.buffer_size() + next_block.buffer_size_with_header());
        block.next_in_pool = next_block.next_in_pool;
        if let Some(after) = next_block.next_in_pool {
            (*after.as_ptr()).prev_in_pool = Some(block_ptr);
        }
        next_block.invalidate();
    }
}

/// Write a single free block spanning a whole region.
///
/// # Arguments
///
/// * 'region' - Line aligned start of the region.
/// * 'region_size' - Line aligned region size, at least `MINIMUM_SPLIT_SIZE`.
///
/// # Safety
///
/// `region` must be valid for writes of `region_size` bytes.
pub unsafe fn initialize_region(
    region: NonNull<u8>,
    region_size: usize,
    owner: OwnerId,
) -> NonNull<BlockHeader> {
    assert!(
        is_aligned(region_size) && is_aligned(region.as_ptr() as usize),
        "Region is not aligned properly."
    );
    debug_assert!(region_size >= MINIMUM_SPLIT_SIZE);

    let block_ptr = region.cast::<BlockHeader>();
    ptr::write(
        block_ptr.as_ptr(),
        BlockHeader::new(region_size - HEADER_SIZE, owner),
    );
    block_ptr
}

/// Manages freed block pointers in a two-level segregated map.
///
/// This item does not own any of freed block item, just keeping pointer into container.
/// A bit of `sl_bitmap[fl]` is set iff the matching bucket head is non-null, and bit `fl` of
/// `fl_bitmap` is set iff `sl_bitmap[fl]` is non-zero.
pub struct FreeListIndex {
    fl_bitmap: u32,
    sl_bitmap: [u64; FIRST_INDEX_COUNT],
    heads: [Option<NonNull<BlockHeader>>; TOTAL_COUNT],
}

impl FreeListIndex {
    pub fn new() -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0u64; FIRST_INDEX_COUNT],
            heads: [None; TOTAL_COUNT],
        }
    }

    /// Forget every free block.
    pub fn reset(&mut self) {
        self.fl_bitmap = 0;
        self.sl_bitmap = [0u64; FIRST_INDEX_COUNT];
        self.heads = [None; TOTAL_COUNT];
    }

    pub fn fl_bitmap(&self) -> u32 {
        self.fl_bitmap
    }

    pub fn sl_bitmap(&self, first: usize) -> u64 {
        self.sl_bitmap[first]
    }

    pub fn head(&self, mapping_indices: (usize, usize)) -> Option<NonNull<BlockHeader>> {
        self.heads[calculate_index(mapping_indices)]
    }

    /// Push a free block onto the head of its bucket.
    ///
    /// # Safety
    ///
    /// `block_ptr` must be a valid free header that is not linked in any bucket.
    pub unsafe fn insert_block(&mut self, mut block_ptr: NonNull<BlockHeader>) {
        let block = block_ptr.as_mut();
        debug_assert!(block.is_freed());

        let mapping_indices = calculate_mapping_indices(block.buffer_size());
        let index = calculate_index(mapping_indices);

        // Connect original head to new item.
        block.prev_free = None;
        block.next_free = self.heads[index];
        if let Some(old_head) = self.heads[index] {
            (*old_head.as_ptr()).prev_free = Some(block_ptr);
        }
        self.heads[index] = Some(block_ptr);

        // Update flag.
        let (first, second) = mapping_indices;
        self.fl_bitmap |= 1u32 << first;
        self.sl_bitmap[first] |= 1u64 << second;
    }

    /// Find suitable indices (first, second) for a line aligned request size.
    ///
    /// If size is too big for the index, or there is no freed block large enough in the
    /// container, just return 'None'.
    pub fn find_suitable_indices(&self, size: usize) -> Option<(usize, usize)> {
        let (first, second) = calculate_searching_indices(size)?;

        let second_masked_bits = self.sl_bitmap[first] & (!0u64 << second);
        if let Some(second) = calculate_lsb(second_masked_bits) {
            return Some((first, second as usize));
        }

        let first_bitmask = (!0u32).checked_shl(first as u32 + 1).unwrap_or(0);
        let first = calculate_lsb(u64::from(self.fl_bitmap & first_bitmask))? as usize;
        let second = calculate_lsb(self.sl_bitmap[first])? as usize;
        Some((first, second))
    }

    /// Pop the head block of the given bucket.
    pub fn extract_root_block(
        &mut self,
        mapping_indices: (usize, usize),
    ) -> Option<NonNull<BlockHeader>> {
        let block_ptr = self.head(mapping_indices)?;
        unsafe { self.extract_freed_block(block_ptr) };
        Some(block_ptr)
    }

    /// Unlink a free block from its bucket.
    ///
    /// # Safety
    ///
    /// `block_ptr` must be a valid free header currently linked in this index.
    pub unsafe fn extract_freed_block(&mut self, mut block_ptr: NonNull<BlockHeader>) {
        let block = block_ptr.as_mut();
        debug_assert!(block.is_freed());

        // Discard chain between a neighborhoods.
        if let Some(next_block) = block.next_free {
            (*next_block.as_ptr()).prev_free = block.prev_free;
        }
        if let Some(prev_block) = block.prev_free {
            (*prev_block.as_ptr()).next_free = block.next_free;
        }

        // Update root item and bit-flags if the block was the bucket head.
        let mapping_indices = calculate_mapping_indices(block.buffer_size());
        let index = calculate_index(mapping_indices);
        if self.heads[index] == Some(block_ptr) {
            self.heads[index] = block.next_free;
            if block.next_free.is_none() {
                let (first, second) = mapping_indices;
                self.sl_bitmap[first] &= !(1u64 << second);
                if self.sl_bitmap[first] == 0 {
                    self.fl_bitmap &= !(1u32 << first);
                }
            }
        }

        block.prev_free = None;
        block.next_free = None;
    }

    /// Iterate over every free block, bucket by bucket.
    pub fn iter(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            index: self,
            bucket: 0,
            cursor: None,
        }
    }
}

impl Default for FreeListIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the free blocks of a `FreeListIndex`.
pub struct FreeBlocks<'a> {
    index: &'a FreeListIndex,
    bucket: usize,
    cursor: Option<NonNull<BlockHeader>>,
}

impl<'a> Iterator for FreeBlocks<'a> {
    type Item = &'a BlockHeader;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor.is_none() {
            if self.bucket >= TOTAL_COUNT {
                return None;
            }
            self.cursor = self.index.heads[self.bucket];
            self.bucket += 1;
        }

        let block = unsafe { &*self.cursor?.as_ptr() };
        self.cursor = block.next_free;
        Some(block)
    }
}

/// Who is responsible for returning a region's memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Requested from the backing allocator and returned to it on dispose.
    Backing,
    /// Supplied by the caller; never handed to the backing allocator.
    External,
}

/// A contiguous memory region blocks are carved from.
#[derive(Clone, Copy, Debug)]
pub struct PoolRegion {
    pub ptr: NonNull<u8>,
    pub size: usize,
    /// Logical pool this region belongs to.
    pub pool: usize,
    pub provenance: Provenance,
}

impl PoolRegion {
    pub(crate) fn first_block(&self) -> NonNull<BlockHeader> {
        self.ptr.cast::<BlockHeader>()
    }

    /// Check whether `addr` lies inside this region.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }
}
