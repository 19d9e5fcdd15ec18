//! Cache-line granular TLSF (Two-level segregated fit) allocator.
//!
//! `Tlsf` serves allocations out of pools requested from a `BackingAllocator` in bounded time.
//! Every block is preceded by a 64-byte header and every size is a multiple of 64 bytes. Free
//! blocks are kept in 32 x 64 segregated lists indexed by a two-level bitmap, and adjacent free
//! blocks are merged eagerly on free.
//!
//! The allocator is not thread-safe. Wrap it in `SpinTlsf` (or any lock) to share it.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("line_tlsf supports only 64-bit targets.");

mod backing;
mod config;
mod consts;
mod error;
mod function;
mod structs;

pub use backing::{BackingAllocator, SystemBacking};
pub use config::{log_growth, GrowthEvent, GrowthHook, TlsfConfig};
pub use consts::{HEADER_SIZE, LINE_SIZE, MAX_REGIONS, MAX_REQUEST_SIZE};
pub use error::{IntegrityError, TlsfError};
pub use structs::{OwnerId, PoolRegion, Provenance};

use function::*;
use std::{
    cmp,
    convert::TryFrom,
    ptr::{self, NonNull},
};
use structs::{initialize_region, BlockHeader, FreeListIndex};

use consts::{FIRST_INDEX_COUNT, MAX_REGION_SIZE, MINIMUM_SPLIT_SIZE, SECOND_INDEX_COUNT};

extern crate arrayvec;
use arrayvec::ArrayVec;

extern crate spin;
use spin::{Mutex, MutexGuard};

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsfStats {
    /// Bytes of allocated blocks, headers included.
    pub bytes_used: usize,
    /// Bytes of every region the allocator manages.
    pub bytes_total: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    pub free_blocks: usize,
    /// Payload size of the largest free block.
    pub largest_free: usize,
    pub pools: usize,
    pub regions: usize,
}

/// A free block as seen by `Tlsf::free_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    /// Payload address the block would be handed out at.
    pub address: NonNull<u8>,
    pub size: usize,
}

/// Two-level segregated fit allocator over line granular blocks.
pub struct Tlsf<B: BackingAllocator = SystemBacking> {
    backing: B,
    config: TlsfConfig,
    owner: OwnerId,
    index: Box<FreeListIndex>,
    regions: ArrayVec<PoolRegion, MAX_REGIONS>,
    pool_count: usize,
    used_memory_size: usize,
    maximum_memory_size: usize,
    growth_hook: GrowthHook,
}

// Regions are owned by the allocator and only touched through `&mut self`.
unsafe impl<B: BackingAllocator + Send> Send for Tlsf<B> {}

impl<B: BackingAllocator> Tlsf<B> {
    /// Create allocator with one pool of `default_pool_size` bytes.
    ///
    /// # Arguments
    ///
    /// * 'backing' - Allocator pools are requested from.
    /// * 'default_pool_size' - Initial and minimum pool size, a multiple of `LINE_SIZE`.
    /// * 'warn_on_growth' - Report pools grown from inside `allocate`.
    pub fn new(
        backing: B,
        default_pool_size: usize,
        warn_on_growth: bool,
    ) -> Result<Self, TlsfError> {
        Self::with_config(
            backing,
            TlsfConfig::default()
                .with_default_pool_size(default_pool_size)
                .with_warn_on_growth(warn_on_growth),
        )
    }

    /// Create allocator from a full configuration.
    ///
    /// A zero `default_pool_size` creates no initial pool.
    pub fn with_config(backing: B, mut config: TlsfConfig) -> Result<Self, TlsfError> {
        debug_assert!(
            config.is_valid(),
            "Pool size must be a multiple of {} bytes.",
            LINE_SIZE
        );
        config.default_pool_size = checked_round_up_line(config.default_pool_size)
            .ok_or(TlsfError::PoolLimit { limit: MAX_REGIONS })?;

        let mut tlsf = Self {
            backing,
            config,
            owner: OwnerId::next(),
            index: Box::new(FreeListIndex::new()),
            regions: ArrayVec::new(),
            pool_count: 0,
            used_memory_size: 0,
            maximum_memory_size: 0,
            growth_hook: Box::new(log_growth),
        };
        log::debug!(
            "Tlsf::new(owner {}, default pool {} bytes)",
            tlsf.owner.get(),
            config.default_pool_size
        );

        if config.default_pool_size > 0 {
            tlsf.grow(LINE_SIZE, false)?;
        }
        Ok(tlsf)
    }

    /// Replace the diagnostic called when `allocate` has to grow the pool set.
    pub fn set_growth_hook(&mut self, hook: GrowthHook) {
        self.growth_hook = hook;
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn config(&self) -> &TlsfConfig {
        &self.config
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Return `(bytes_used, bytes_total)`.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.used_memory_size as u64,
            self.maximum_memory_size as u64,
        )
    }

    /// Collect occupancy figures, walking the free lists.
    pub fn detailed_stats(&self) -> TlsfStats {
        let mut stats = TlsfStats {
            bytes_used: self.used_memory_size,
            bytes_total: self.maximum_memory_size,
            pools: self.pool_count,
            regions: self.regions.len(),
            ..TlsfStats::default()
        };
        for block in self.index.iter() {
            stats.free_blocks += 1;
            stats.free_bytes += block.buffer_size();
            stats.largest_free = cmp::max(stats.largest_free, block.buffer_size());
        }
        stats
    }

    pub fn pool_count(&self) -> usize {
        self.pool_count
    }

    pub fn regions(&self) -> &[PoolRegion] {
        &self.regions
    }

    /// Iterate over every free block, smallest size class first.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlockInfo> + '_ {
        self.index.iter().map(|block| FreeBlockInfo {
            address: block.buffer_ptr(),
            size: block.buffer_size(),
        })
    }

    /// Add a pool of at least `min_size` payload bytes.
    ///
    /// The pool is never smaller than the configured default pool size. When `min_size` fits in
    /// one backing allocation the pool serves a request of `min_size` bytes; otherwise it is carved
    /// from several regions and only adds capacity.
    pub fn add_pool(&mut self, min_size: u64) -> Result<(), TlsfError> {
        let min_size = usize::try_from(min_size).unwrap_or(usize::MAX);
        let needed = calculate_allocation_size(min_size).ok_or(TlsfError::RequestTooLarge {
            size: min_size,
            limit: MAX_REQUEST_SIZE,
        })?;
        self.grow(needed, false).map(|_| ())
    }

    /// Seed the allocator with memory whose lifetime the caller manages.
    ///
    /// `base` is rounded up and `size` down to `LINE_SIZE`. The region is never handed to the
    /// backing allocator; `dispose` simply forgets it.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes, unused by anything else, and
    /// outlive this allocator (or the next `dispose` call).
    pub unsafe fn add_external_memory(
        &mut self,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), TlsfError> {
        let addr = base.as_ptr() as usize;
        let offset = round_up_line(addr) - addr;
        if size < offset + MINIMUM_SPLIT_SIZE {
            return Err(TlsfError::ExternalTooSmall { size });
        }
        if self.regions.is_full() {
            return Err(TlsfError::PoolLimit { limit: MAX_REGIONS });
        }

        let region_size = cmp::min(round_down_line(size - offset), MAX_REGION_SIZE);
        let region = NonNull::new_unchecked(base.as_ptr().add(offset));
        let pool = self.pool_count;
        self.pool_count += 1;
        self.register_region(region, region_size, pool, Provenance::External);

        log::debug!(
            "Tlsf::add_external_memory({:p}, {}) -> pool {}",
            region,
            region_size,
            pool
        );
        Ok(())
    }

    /// Allocate `size` bytes aligned to `LINE_SIZE`.
    ///
    /// Grows the pool set once if no free block fits.
    ///
    /// # Panics
    ///
    /// In debug builds, if `alignment` is not `LINE_SIZE`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<NonNull<u8>, TlsfError> {
        debug_assert_eq!(
            alignment, LINE_SIZE as u64,
            "Tlsf only serves {}-byte aligned requests.",
            LINE_SIZE
        );

        let size = usize::try_from(size).unwrap_or(usize::MAX);
        let aligned_size = calculate_allocation_size(size).ok_or(TlsfError::RequestTooLarge {
            size,
            limit: MAX_REQUEST_SIZE,
        })?;

        let block_ptr = match self.take_suitable_block(aligned_size) {
            Some(block_ptr) => block_ptr,
            None => {
                let event = self.grow(aligned_size, true)?;
                if self.config.warn_on_growth {
                    (self.growth_hook)(&event);
                }
                self.take_suitable_block(aligned_size)
                    .ok_or(TlsfError::RequestTooLarge {
                        size,
                        limit: event.pool_size / event.regions - HEADER_SIZE,
                    })?
            }
        };

        let ptr = unsafe { self.commit_block(block_ptr, aligned_size) };
        log::trace!("Tlsf::allocate({}) -> {:p}", size, ptr);
        Ok(ptr)
    }

    /// Allocate `size` bytes and zero the whole usable payload.
    pub fn allocate_zeroed(&mut self, size: u64) -> Result<NonNull<u8>, TlsfError> {
        let ptr = self.allocate(size, LINE_SIZE as u64)?;
        unsafe {
            let usable_size = BlockHeader::from_buffer_ptr(ptr).as_ref().buffer_size();
            ptr::write_bytes(ptr.as_ptr(), 0, usable_size);
        }
        Ok(ptr)
    }

    /// Return an allocation to the allocator, merging it with free neighbors.
    ///
    /// # Panics
    ///
    /// If `ptr` is null, was not produced by this allocator, or is already free.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer returned by `allocate` on this allocator (the checks above
    /// read the header in front of it), and must not be used after this call.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        assert!(!ptr.is_null(), "Tlsf::free called with a null pointer.");
        let mut block_ptr = self.checked_block(NonNull::new_unchecked(ptr));
        log::trace!("Tlsf::free({:p})", ptr);

        {
            let block = &mut *block_ptr.as_ptr();
            self.used_memory_size -= block.buffer_size_with_header();
            block.set_freed(true);
        }

        // Get next block and merge it when next block is exist and freed.
        if let Some(next_block) = (*block_ptr.as_ptr()).next_in_pool() {
            if (*next_block.as_ptr()).is_freed() {
                log::trace!("merge {:p} <- {:p}", block_ptr, next_block);
                self.index.extract_freed_block(next_block);
                BlockHeader::absorb_next(block_ptr);
            }
        }

        // Get previous block and merge it when previous block is exist and freed.
        if let Some(prev_block) = (*block_ptr.as_ptr()).prev_in_pool() {
            if (*prev_block.as_ptr()).is_freed() {
                log::trace!("merge {:p} <- {:p}", prev_block, block_ptr);
                self.index.extract_freed_block(prev_block);
                BlockHeader::absorb_next(prev_block);
                block_ptr = prev_block;
            }
        }

        self.index.insert_block(block_ptr);
    }

    /// Usable payload size of a live allocation. At least the requested size.
    ///
    /// # Panics
    ///
    /// Under the same conditions as `free`.
    ///
    /// # Safety
    ///
    /// Same as `free`, except the allocation stays live.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.checked_block(ptr).as_ref().buffer_size()
    }

    /// Return every owned region to the backing allocator and forget external ones.
    ///
    /// All outstanding allocations become dangling. The allocator stays usable and grows anew on
    /// the next `allocate`.
    pub fn dispose(&mut self) {
        let mut released = 0;
        for region in self.regions.drain(..) {
            if region.provenance == Provenance::Backing {
                unsafe { self.backing.deallocate(region.ptr, region.size) };
                released += region.size;
            }
        }

        self.index.reset();
        self.pool_count = 0;
        self.used_memory_size = 0;
        self.maximum_memory_size = 0;
        log::debug!(
            "Tlsf::dispose(owner {}) released {} bytes",
            self.owner.get(),
            released
        );
    }

    /// Walk every region and bucket and verify the block invariants.
    ///
    /// Checks tags, owners, adjacency links, that no two neighbors are free, that regions are
    /// fully covered, that every free block sits in the bucket its size maps to, that bitmaps
    /// mirror bucket heads, and that used-byte accounting matches the blocks.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let mut walked_free = 0;
        let mut walked_used = 0;

        for region in self.regions.iter() {
            let mut cursor = Some(region.first_block());
            let mut expected_addr = region.ptr.as_ptr() as usize;
            let mut previous: Option<NonNull<BlockHeader>> = None;
            let mut previous_free = false;
            let mut walked = 0;

            while let Some(block_ptr) = cursor {
                let addr = block_ptr.as_ptr() as usize;
                if addr != expected_addr {
                    return Err(IntegrityError::NotAdjacent { addr });
                }

                let block = unsafe { block_ptr.as_ref() };
                if !block.has_valid_tag() {
                    return Err(IntegrityError::BadTag {
                        addr,
                        tag: block.tag(),
                    });
                }
                if block.owner() != self.owner {
                    return Err(IntegrityError::ForeignOwner { addr });
                }
                if block.prev_in_pool() != previous {
                    return Err(IntegrityError::BrokenPoolLink { addr });
                }

                if block.is_freed() {
                    if previous_free {
                        return Err(IntegrityError::UncoalescedNeighbors {
                            first: previous.map_or(0, |p| p.as_ptr() as usize),
                            second: addr,
                        });
                    }
                    walked_free += 1;
                } else {
                    walked_used += block.buffer_size_with_header();
                }

                walked += block.buffer_size_with_header();
                if walked > region.size {
                    break;
                }
                expected_addr = block.buffer_end_addr();
                previous = Some(block_ptr);
                previous_free = block.is_freed();
                cursor = block.next_in_pool();
            }

            if walked != region.size {
                return Err(IntegrityError::RegionSizeMismatch {
                    addr: region.ptr.as_ptr() as usize,
                    walked,
                    expected: region.size,
                });
            }
        }

        let mut indexed = 0;
        for first in 0..FIRST_INDEX_COUNT {
            let sl_bitmap = self.index.sl_bitmap(first);
            if (self.index.fl_bitmap() >> first) & 1 != u32::from(sl_bitmap != 0) {
                return Err(IntegrityError::BitmapMismatch { first, second: 0 });
            }

            for second in 0..SECOND_INDEX_COUNT {
                let head = self.index.head((first, second));
                if ((sl_bitmap >> second) & 1 == 1) != head.is_some() {
                    return Err(IntegrityError::BitmapMismatch { first, second });
                }

                let mut previous = None;
                let mut cursor = head;
                while let Some(block_ptr) = cursor {
                    let addr = block_ptr.as_ptr() as usize;
                    let block = unsafe { block_ptr.as_ref() };
                    if !block.has_valid_tag() || !block.is_freed() || block.prev_free() != previous
                    {
                        return Err(IntegrityError::BrokenFreeLink {
                            addr,
                            first,
                            second,
                        });
                    }
                    if calculate_mapping_indices(block.buffer_size()) != (first, second) {
                        return Err(IntegrityError::WrongBucket {
                            addr,
                            first,
                            second,
                        });
                    }

                    indexed += 1;
                    if indexed > walked_free {
                        return Err(IntegrityError::FreeCountMismatch {
                            indexed,
                            walked: walked_free,
                        });
                    }
                    previous = cursor;
                    cursor = block.next_free();
                }
            }
        }

        if indexed != walked_free {
            return Err(IntegrityError::FreeCountMismatch {
                indexed,
                walked: walked_free,
            });
        }
        if walked_used != self.used_memory_size {
            return Err(IntegrityError::UsedBytesMismatch {
                recorded: self.used_memory_size,
                walked: walked_used,
            });
        }
        Ok(())
    }

    /// Request a new pool of at least `needed` payload bytes.
    ///
    /// Pools larger than the backing limit are carved from several equally sized regions. If
    /// `needed` fits in one region the pool holds a free block the search for `needed` finds.
    /// With `whole_block` set, `needed` must fit in one region.
    fn grow(&mut self, needed: usize, whole_block: bool) -> Result<GrowthEvent, TlsfError> {
        let limit = round_down_line(cmp::min(
            cmp::min(self.config.max_backing_allocation, self.backing.max_allocation_size()),
            MAX_REGION_SIZE,
        ));
        let too_large = TlsfError::RequestTooLarge {
            size: needed,
            limit: limit.saturating_sub(HEADER_SIZE),
        };
        if limit < MINIMUM_SPLIT_SIZE {
            return Err(too_large);
        }

        // The new block has to reach the bucket the search for `needed` starts from.
        let needed = cmp::max(needed, LINE_SIZE);
        let needed = match round_up_bucket(needed) {
            Some(rounded) if rounded + HEADER_SIZE <= limit => rounded,
            _ if whole_block => return Err(too_large),
            _ => needed,
        };

        let pool_size = next_pool_size(self.config.default_pool_size, needed);
        let (region_size, region_count) = calculate_region_layout(pool_size, limit);
        if self.regions.remaining_capacity() < region_count {
            return Err(TlsfError::PoolLimit { limit: MAX_REGIONS });
        }

        let pool = self.pool_count;
        for added in 0..region_count {
            let ptr = match self.backing.allocate(region_size) {
                Some(ptr) => ptr,
                None => {
                    // Regions already carved stay usable as a smaller pool.
                    if added > 0 {
                        self.pool_count = pool + 1;
                    }
                    return Err(TlsfError::BackingExhausted { size: region_size });
                }
            };
            unsafe { self.register_region(ptr, region_size, pool, Provenance::Backing) };
        }
        self.pool_count = pool + 1;

        log::debug!(
            "Tlsf::grow({}) -> pool {} of {} x {} bytes",
            needed,
            pool,
            region_count,
            region_size
        );
        Ok(GrowthEvent {
            requested: needed,
            pool_size: region_size * region_count,
            regions: region_count,
            bytes_total: self.maximum_memory_size,
        })
    }

    /// Turn a region into one free block and index it.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes, and the registry must have room.
    unsafe fn register_region(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
        pool: usize,
        provenance: Provenance,
    ) {
        let block = initialize_region(ptr, size, self.owner);
        self.regions.push(PoolRegion {
            ptr,
            size,
            pool,
            provenance,
        });
        self.maximum_memory_size += size;
        self.index.insert_block(block);
    }

    /// Pop a free block of at least `aligned_size` bytes.
    fn take_suitable_block(&mut self, aligned_size: usize) -> Option<NonNull<BlockHeader>> {
        let mapping_indices = self.index.find_suitable_indices(aligned_size)?;
        self.index.extract_root_block(mapping_indices)
    }

    /// Split the remainder off a popped block, mark it used and return its payload.
    ///
    /// # Safety
    ///
    /// `block_ptr` must be a free block just removed from the index.
    unsafe fn commit_block(
        &mut self,
        block_ptr: NonNull<BlockHeader>,
        aligned_size: usize,
    ) -> NonNull<u8> {
        let buffer_size = block_ptr.as_ref().buffer_size();
        debug_assert!(buffer_size >= aligned_size);

        // Check remained size can be independent another block. Otherwise it stays with the
        // taken block.
        if buffer_size - aligned_size >= MINIMUM_SPLIT_SIZE {
            let new_block = BlockHeader::split(block_ptr, aligned_size);
            log::trace!("split {:p} -> {:p}", block_ptr, new_block);
            self.index.insert_block(new_block);
        }

        let block = &mut *block_ptr.as_ptr();
        block.set_freed(false);
        self.used_memory_size += block.buffer_size_with_header();

        BlockHeader::payload_ptr(block_ptr)
    }

    /// Recover and validate the header of a live allocation.
    ///
    /// # Safety
    ///
    /// `HEADER_SIZE` bytes in front of `ptr` must be readable.
    unsafe fn checked_block(&self, ptr: NonNull<u8>) -> NonNull<BlockHeader> {
        assert!(
            is_aligned(ptr.as_ptr() as usize),
            "Pointer {:p} is not {}-byte aligned.",
            ptr,
            LINE_SIZE
        );

        let block_ptr = BlockHeader::from_buffer_ptr(ptr);
        let block = block_ptr.as_ref();
        assert!(
            block.has_valid_tag(),
            "Pointer {:p} was not allocated by Tlsf.",
            ptr
        );
        assert!(
            block.owner() == self.owner,
            "Pointer {:p} belongs to another Tlsf instance.",
            ptr
        );
        assert!(!block.is_freed(), "Pointer {:p} is already freed.", ptr);
        block_ptr
    }
}

impl<B: BackingAllocator> Drop for Tlsf<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// `Tlsf` behind a spin lock, for callers that share one allocator between threads.
pub struct SpinTlsf<B: BackingAllocator = SystemBacking> {
    pool: Mutex<Tlsf<B>>,
}

impl<B: BackingAllocator> SpinTlsf<B> {
    pub const fn new(tlsf: Tlsf<B>) -> Self {
        Self {
            pool: Mutex::new(tlsf),
        }
    }

    /// Lock the allocator for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Tlsf<B>> {
        self.pool.lock()
    }

    pub fn allocate(&self, size: u64) -> Result<NonNull<u8>, TlsfError> {
        self.pool.lock().allocate(size, LINE_SIZE as u64)
    }

    /// # Safety
    ///
    /// Same as `Tlsf::free`.
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.pool.lock().free(ptr);
    }

    pub fn stats(&self) -> (u64, u64) {
        self.pool.lock().stats()
    }

    pub fn into_inner(self) -> Tlsf<B> {
        self.pool.into_inner()
    }
}
