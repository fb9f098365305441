//! Memory services consumed by the hypervisor.

use abyss::addressing::{Pa, Va, PAGE_SIZE};

/// Physical page allocator.
///
/// Pages come back zeroed and stay mapped at [`PageAllocator::phys_to_virt`]
/// for the lifetime of the hypervisor.
pub trait PageAllocator: Sync {
    /// Allocate `count` physically contiguous, zeroed pages.
    fn alloc_pages(&self, count: usize) -> Option<Pa>;

    /// Free pages obtained from [`PageAllocator::alloc_pages`].
    fn free_pages(&self, pa: Pa, count: usize);

    /// Hypervisor virtual address of a physical address.
    fn phys_to_virt(&self, pa: Pa) -> Va;

    /// Physical address of a hypervisor virtual address.
    fn virt_to_phys(&self, va: Va) -> Pa;

    /// Write back the cache lines covering `[va, va + len)` so that a
    /// non-snooping device observes the data.
    fn flush_cache(&self, va: Va, len: usize);

    /// Pages currently handed out, if the allocator keeps count.
    fn used_pages(&self) -> Option<usize> {
        None
    }

    /// Pages of a physically contiguous buffer of `len` bytes.
    fn pages_for(&self, len: usize) -> usize {
        (len + PAGE_SIZE - 1) / PAGE_SIZE
    }
}
