//! Mmio interface.

use crate::addressing::{Va, PAGE_SIZE};

/// A page of memory-mapped device registers.
#[derive(Clone, Copy, Debug)]
pub struct MmioPage {
    base: Va,
}

unsafe impl Send for MmioPage {}
unsafe impl Sync for MmioPage {}

impl MmioPage {
    /// Access the register page mapped at `base`.
    ///
    /// # Safety
    /// `base` must map one page of device registers, uncached, for the
    /// lifetime of the returned value.
    #[inline]
    pub const unsafe fn new(base: Va) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn ptr<T>(&self, offset: usize) -> *mut T {
        assert!(offset + core::mem::size_of::<T>() <= PAGE_SIZE);
        (self.base.into_usize() + offset) as *mut T
    }

    /// Read the 32-bit register at `offset`.
    #[inline(always)]
    pub fn read32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.ptr::<u32>(offset)) }
    }

    /// Write the 32-bit register at `offset`.
    #[inline(always)]
    pub fn write32(&self, offset: usize, v: u32) {
        unsafe { core::ptr::write_volatile(self.ptr::<u32>(offset), v) }
    }

    /// Read the 64-bit register at `offset`.
    #[inline(always)]
    pub fn read64(&self, offset: usize) -> u64 {
        unsafe { core::ptr::read_volatile(self.ptr::<u64>(offset)) }
    }

    /// Write the 64-bit register at `offset`.
    #[inline(always)]
    pub fn write64(&self, offset: usize, v: u64) {
        unsafe { core::ptr::write_volatile(self.ptr::<u64>(offset), v) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Page([u8; PAGE_SIZE]);

    #[test]
    fn register_access() {
        let mut page = Page([0; PAGE_SIZE]);
        let va = Va::new(page.0.as_mut_ptr() as usize).unwrap();
        let regs = unsafe { MmioPage::new(va) };
        regs.write64(0x20, 0x1234_5678_9abc_def0);
        regs.write32(0x1c, 0x8000_0000);
        assert_eq!(regs.read32(0x20), 0x9abc_def0);
        assert_eq!(regs.read64(0x20), 0x1234_5678_9abc_def0);
        assert_eq!(regs.read32(0x1c), 0x8000_0000);
    }

    #[test]
    #[should_panic]
    fn access_past_the_page() {
        let mut page = Page([0; PAGE_SIZE]);
        let va = Va::new(page.0.as_mut_ptr() as usize).unwrap();
        let regs = unsafe { MmioPage::new(va) };
        regs.read64(PAGE_SIZE - 4);
    }
}
