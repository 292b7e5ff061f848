//! Global allocator over non-paged pool
//!
//! The sample table and the image name copies are touched at DISPATCH_LEVEL
//! and above, so every allocation comes from non-paged pool.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use super::nt;

/// Pool tag 'HpcM'
pub const POOL_TAG: u32 = u32::from_le_bytes(*b"HpcM");

/// Alignment pool allocations are guaranteed to have on x86
const POOL_ALIGNMENT: usize = 8;

struct PoolAllocator;

unsafe impl GlobalAlloc for PoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > POOL_ALIGNMENT {
            return ptr::null_mut();
        }
        nt::ExAllocatePoolWithTag(nt::NON_PAGED_POOL, layout.size(), POOL_TAG).cast()
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        nt::ExFreePoolWithTag(p.cast(), POOL_TAG);
    }
}

#[global_allocator]
static ALLOCATOR: PoolAllocator = PoolAllocator;
