//! MSR bitmap shared by all processors.
//!
//! The bitmap is four 1 KiB regions: reads of MSRs 0 - 0x1fff, reads of
//! 0xc0000000 - 0xc0001fff, and the same two ranges for writes. A set bit
//! makes the access trap.
//!
//! In xAPIC mode the x2APIC range follows a fixed policy: registers that are
//! harmless to read pass through, everything that could let a cell disturb
//! other processors traps. In x2APIC mode the whole range passes through
//! except writes of the interrupt command register.

use crate::{
    apic::{MSR_X2APIC_BASE, MSR_X2APIC_END, MSR_X2APIC_ICR},
    mm::PageAllocator,
};
use abyss::addressing::Pa;

const REGION: usize = 0x400;
const READ_LOW: usize = 0;
const READ_HIGH: usize = REGION;
const WRITE_LOW: usize = 2 * REGION;
const WRITE_HIGH: usize = 3 * REGION;

const X2APIC_BYTES: usize = ((MSR_X2APIC_END - MSR_X2APIC_BASE + 1) / 8) as usize;

/// Read policy for MSRs 0x800 - 0x83f, one bit per register.
const X2APIC_READ_POLICY: [u8; X2APIC_BYTES] = [
    0x0c, // 0x800 - 0x807: id and version pass, 0x802/0x803 trap
    0xa5, // 0x808 - 0x80f
    0xff, // 0x810 - 0x817
    0xff, // 0x818 - 0x81f
    0xff, // 0x820 - 0x827
    0x81, // 0x828 - 0x82f
    0xfd, // 0x830 - 0x837
    0x43, // 0x838 - 0x83f
];

/// Write policy for MSRs 0x800 - 0x83f.
const X2APIC_WRITE_POLICY: [u8; X2APIC_BYTES] = [
    0x00, 0x89, 0x00, 0x00, 0x00, 0x81, 0xfd, 0xc1,
];

/// The MSR bitmap.
#[derive(Debug)]
pub struct MsrBitmap {
    pa: Pa,
}

impl MsrBitmap {
    /// Build the bitmap for the interrupt controller mode of the machine.
    pub fn new<M: PageAllocator + ?Sized>(mm: &M, x2apic: bool) -> Option<Self> {
        let pa = mm.alloc_pages(1)?;
        let bitmap = Self { pa };
        let bytes = bitmap.bytes(mm);
        let x2apic_offset = (MSR_X2APIC_BASE / 8) as usize;
        let read = READ_LOW + x2apic_offset..READ_LOW + x2apic_offset + X2APIC_BYTES;
        let write = WRITE_LOW + x2apic_offset..WRITE_LOW + x2apic_offset + X2APIC_BYTES;
        if x2apic {
            bytes[read].fill(0);
            bytes[write].fill(0);
            bytes[WRITE_LOW + (MSR_X2APIC_ICR / 8) as usize] = 1 << (MSR_X2APIC_ICR % 8);
        } else {
            bytes[read].copy_from_slice(&X2APIC_READ_POLICY);
            bytes[write].copy_from_slice(&X2APIC_WRITE_POLICY);
        }
        Some(bitmap)
    }

    fn bytes<'a, M: PageAllocator + ?Sized>(&self, mm: &M) -> &'a mut [u8; 4 * REGION] {
        unsafe { mm.phys_to_virt(self.pa).as_mut::<[u8; 4 * REGION]>() }
    }

    pub fn pa(&self) -> Pa {
        self.pa
    }

    fn traps<M: PageAllocator + ?Sized>(&self, mm: &M, msr: u32, low: usize, high: usize) -> bool {
        let (region, index) = match msr {
            0..=0x1fff => (low, msr as usize),
            0xc000_0000..=0xc000_1fff => (high, (msr - 0xc000_0000) as usize),
            _ => return true,
        };
        self.bytes(mm)[region + index / 8] & (1 << (index % 8)) != 0
    }

    /// Whether RDMSR of `msr` causes a VM exit.
    pub fn traps_read<M: PageAllocator + ?Sized>(&self, mm: &M, msr: u32) -> bool {
        self.traps(mm, msr, READ_LOW, READ_HIGH)
    }

    /// Whether WRMSR of `msr` causes a VM exit.
    pub fn traps_write<M: PageAllocator + ?Sized>(&self, mm: &M, msr: u32) -> bool {
        self.traps(mm, msr, WRITE_LOW, WRITE_HIGH)
    }

    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        mm.free_pages(self.pa, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestMemory;

    #[test]
    fn xapic_policy() {
        let mm = TestMemory::new();
        let bm = MsrBitmap::new(&mm, false).unwrap();
        // ID and version read through, TPR traps.
        assert!(!bm.traps_read(&mm, 0x802 - 2));
        assert!(bm.traps_read(&mm, 0x802));
        assert!(bm.traps_read(&mm, 0x803));
        assert!(!bm.traps_read(&mm, 0x804));
        assert!(bm.traps_read(&mm, 0x808));
        // ICR writes always trap.
        assert!(bm.traps_write(&mm, MSR_X2APIC_ICR));
        assert!(bm.traps_read(&mm, MSR_X2APIC_ICR));
        assert!(!bm.traps_write(&mm, 0x800));
        assert!(bm.traps_write(&mm, 0x808));
        assert!(bm.traps_write(&mm, 0x83f));
        // Outside the x2APIC range nothing traps.
        assert!(!bm.traps_read(&mm, 0x1b));
        assert!(!bm.traps_write(&mm, 0xc000_0080));
        bm.release(&mm);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn x2apic_passes_all_but_icr_writes() {
        let mm = TestMemory::new();
        let bm = MsrBitmap::new(&mm, true).unwrap();
        for msr in MSR_X2APIC_BASE..=MSR_X2APIC_END {
            assert!(!bm.traps_read(&mm, msr));
            assert_eq!(bm.traps_write(&mm, msr), msr == MSR_X2APIC_ICR);
        }
        bm.release(&mm);
    }
}
