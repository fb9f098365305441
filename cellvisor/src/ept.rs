//! Extended Page Table.
//!
//! Each cell owns one EPT that maps exactly its configured memory regions,
//! plus the APIC access page at [`XAPIC_BASE`] so that guest accesses to the
//! local APIC trap.
use crate::{
    apic::XAPIC_BASE,
    config::{MemFlags, MemoryRegion},
    mm::PageAllocator,
    paging::{Coherency, MappingError, PageTable},
    vcpu::MEMORY_TYPE_WB,
};
use abyss::addressing::{Pa, PAGE_SIZE};

bitflags::bitflags! {
    /// Permission and memory type bits of an EPT entry.
    pub struct EptFlags: u64 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Execute access.
        const EXECUTE = 1 << 2;
        /// Write-back memory type of a leaf.
        const WB_TYPE = MEMORY_TYPE_WB << 3;
    }
}

impl EptFlags {
    /// Leaf flags for a memory region.
    pub fn from_region(flags: MemFlags) -> Self {
        let mut ept = EptFlags::WB_TYPE;
        if flags.contains(MemFlags::READ) {
            ept |= EptFlags::READ;
        }
        if flags.contains(MemFlags::WRITE) {
            ept |= EptFlags::WRITE;
        }
        if flags.contains(MemFlags::EXECUTE) {
            ept |= EptFlags::EXECUTE;
        }
        ept
    }
}

/// Page-walk length minus one, as encoded in the EPT pointer.
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;
const EPT_LEVELS: usize = 4;

/// Extended page table of a cell.
#[derive(Debug)]
pub struct ExtendedPageTable {
    table: PageTable,
}

impl ExtendedPageTable {
    /// Create an empty table.
    pub fn new<M: PageAllocator + ?Sized>(mm: &M) -> Result<Self, MappingError> {
        Ok(Self {
            table: PageTable::new(mm, EPT_LEVELS, Coherency::NonCoherent)?,
        })
    }

    /// Map `mem` with its access rights and write-back caching.
    pub fn map_region<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        mem: &MemoryRegion,
    ) -> Result<(), MappingError> {
        let leaf = EptFlags::from_region(mem.flags);
        let table = leaf - EptFlags::WB_TYPE;
        self.table.map(
            mm,
            mem.virt_start,
            mem.phys_start,
            mem.size,
            leaf.bits(),
            table.bits(),
        )
    }

    /// Remove the guest-physical window of `mem`.
    pub fn unmap_region<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        mem: &MemoryRegion,
    ) -> Result<(), MappingError> {
        self.table.unmap(mm, mem.virt_start, mem.size)
    }

    /// Map the hypervisor's APIC access page at the local APIC address.
    pub fn map_apic_access_page<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        page: Pa,
    ) -> Result<(), MappingError> {
        let rw = EptFlags::READ | EptFlags::WRITE;
        self.table.map(
            mm,
            XAPIC_BASE,
            page.into_u64(),
            PAGE_SIZE as u64,
            (rw | EptFlags::WB_TYPE).bits(),
            rw.bits(),
        )
    }

    /// Value of the VMCS EPT pointer field.
    pub fn eptp(&self) -> u64 {
        self.table.root().into_u64() | MEMORY_TYPE_WB | EPTP_WALK_LENGTH_4
    }

    /// Translate a guest-physical address.
    pub fn translate<M: PageAllocator + ?Sized>(
        &self,
        mm: &M,
        gpa: u64,
    ) -> Option<(u64, EptFlags)> {
        self.table
            .translate(mm, gpa)
            .map(|(hpa, flags)| (hpa, EptFlags::from_bits_truncate(flags)))
    }

    /// Free every table page.
    pub fn destroy<M: PageAllocator + ?Sized>(self, mm: &M) {
        self.table.destroy(mm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestMemory;

    #[test]
    fn region_permissions_are_exact() {
        let mm = TestMemory::new();
        let mut ept = ExtendedPageTable::new(&mm).unwrap();
        let ro = MemoryRegion {
            phys_start: 0x4000_0000,
            virt_start: 0x0,
            size: 0x2000,
            flags: MemFlags::READ | MemFlags::EXECUTE,
        };
        let rw = MemoryRegion::identity(0x10_0000, 0x1000, MemFlags::READ | MemFlags::WRITE);
        ept.map_region(&mm, &ro).unwrap();
        ept.map_region(&mm, &rw).unwrap();

        assert_eq!(
            ept.translate(&mm, 0x1008),
            Some((
                0x4000_1008,
                EptFlags::READ | EptFlags::EXECUTE | EptFlags::WB_TYPE
            ))
        );
        assert_eq!(
            ept.translate(&mm, 0x10_0000).map(|(_, f)| f),
            Some(EptFlags::READ | EptFlags::WRITE | EptFlags::WB_TYPE)
        );
        assert_eq!(ept.translate(&mm, 0x2000), None);
        assert_eq!(ept.translate(&mm, 0x10_1000), None);

        ept.unmap_region(&mm, &ro).unwrap();
        assert_eq!(ept.translate(&mm, 0x0), None);
        assert!(ept.translate(&mm, 0x10_0000).is_some());
        ept.destroy(&mm);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn apic_page_and_pointer() {
        let mm = TestMemory::new();
        let mut ept = ExtendedPageTable::new(&mm).unwrap();
        let page = mm.alloc_pages(1).unwrap();
        ept.map_apic_access_page(&mm, page).unwrap();
        assert_eq!(
            ept.translate(&mm, XAPIC_BASE),
            Some((
                page.into_u64(),
                EptFlags::READ | EptFlags::WRITE | EptFlags::WB_TYPE
            ))
        );
        assert_eq!(ept.eptp() & 0xfff, 0x1e);
        mm.free_pages(page, 1);
        ept.destroy(&mm);
        assert_eq!(mm.outstanding(), 0);
    }
}
