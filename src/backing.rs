use super::consts::LINE_SIZE;
use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
};

/// Upstream allocator the pools are requested from.
pub trait BackingAllocator {
    /// Allocate `size` bytes aligned to `LINE_SIZE`.
    ///
    /// Return `None` when the request cannot be satisfied.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Return memory obtained from `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must match an earlier `allocate` call on this allocator, and the memory
    /// must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Largest size a single `allocate` call accepts.
    fn max_allocation_size(&self) -> usize {
        usize::MAX
    }
}

/// Backing allocator over the system allocator.
///
/// Memory is zeroed on allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBacking;

impl SystemBacking {
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, LINE_SIZE).ok()
    }
}

impl BackingAllocator for SystemBacking {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        // To allocate memory without going through rust's global allocator (which may be
        // this allocator's host), use the system allocator directly.
        let layout = Self::layout(size)?;
        NonNull::new(unsafe { System.alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = Self::layout(size) {
            System.dealloc(ptr.as_ptr(), layout);
        }
    }

    fn max_allocation_size(&self) -> usize {
        // `Layout` rejects sizes that overflow `isize` once rounded up to the alignment.
        isize::MAX as usize - (LINE_SIZE - 1)
    }
}

impl<B: BackingAllocator + ?Sized> BackingAllocator for &mut B {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        (**self).allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        (**self).deallocate(ptr, size)
    }

    fn max_allocation_size(&self) -> usize {
        (**self).max_allocation_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_backing_is_line_aligned_and_zeroed() {
        let mut backing = SystemBacking;
        let ptr = backing.allocate(4096).unwrap();
        assert_eq!(ptr.as_ptr() as usize % LINE_SIZE, 0);

        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe { backing.deallocate(ptr, 4096) };
    }

    #[test]
    fn system_backing_rejects_empty_and_huge() {
        let mut backing = SystemBacking;
        assert!(backing.allocate(0).is_none());
        assert!(backing.allocate(usize::MAX).is_none());
    }
}
