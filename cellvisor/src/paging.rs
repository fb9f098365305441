//! Multi-level page tables shared by the EPT and the VT-d second-level
//! translation.
//!
//! Both formats use 512-entry tables with the output address in bits 12..51
//! and the access rights in the low bits; an entry is present as soon as any
//! of the read/write/execute bits is set. Tables are 3 or 4 levels deep and
//! every mapping is built from 4 KiB leaves.

use crate::mm::PageAllocator;
use abyss::addressing::{Pa, PAGE_SIZE};

/// Number of entries in a table.
pub const ENTRIES: usize = 512;

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const PRESENT_MASK: u64 = 0x7;

/// Errors while building a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// Address or size not aligned to a page.
    Unaligned,
    /// The range does not fit in the input address width of the table.
    OutOfRange,
    /// A page table could not be allocated.
    OutOfMemory,
}

/// How table updates reach the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coherency {
    /// Every written entry is flushed from the CPU caches; for walkers that
    /// do not snoop them.
    Coherent,
    /// The walker snoops the CPU caches.
    NonCoherent,
}

/// Entry of a page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Get a physical address pointed by this entry.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new((self.0 & ADDR_MASK) as usize)
        } else {
            None
        }
    }

    /// Get the flag bits of this entry.
    #[inline]
    pub const fn flags(&self) -> u64 {
        self.0 & !ADDR_MASK
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PRESENT_MASK != 0
    }

    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// A page table owned by exactly one cell or IOMMU domain.
///
/// The table is not freed on drop: [`PageTable::destroy`] consumes it and
/// returns every table page to the allocator exactly once.
#[derive(Debug)]
pub struct PageTable {
    root: Pa,
    levels: usize,
    coherency: Coherency,
}

#[inline]
fn index(addr: u64, level: usize) -> usize {
    ((addr >> (12 + 9 * (level - 1))) & 0x1ff) as usize
}

#[inline]
fn span(level: usize) -> u64 {
    1 << (12 + 9 * (level - 1))
}

impl PageTable {
    /// Allocate an empty table with `levels` levels.
    pub fn new<M: PageAllocator + ?Sized>(
        mm: &M,
        levels: usize,
        coherency: Coherency,
    ) -> Result<Self, MappingError> {
        debug_assert!(levels == 3 || levels == 4);
        let root = mm.alloc_pages(1).ok_or(MappingError::OutOfMemory)?;
        let table = Self {
            root,
            levels,
            coherency,
        };
        table.sync(mm, root, 0, ENTRIES);
        Ok(table)
    }

    /// Physical address of the top-level table.
    pub fn root(&self) -> Pa {
        self.root
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Size of the input address space.
    pub fn limit(&self) -> u64 {
        span(self.levels + 1)
    }

    fn entries<'a, M: PageAllocator + ?Sized>(mm: &M, table: Pa) -> &'a mut [u64; ENTRIES] {
        unsafe { mm.phys_to_virt(table).as_mut::<[u64; ENTRIES]>() }
    }

    fn sync<M: PageAllocator + ?Sized>(&self, mm: &M, table: Pa, first: usize, count: usize) {
        if self.coherency == Coherency::Coherent {
            mm.flush_cache(mm.phys_to_virt(table) + first * 8, count * 8);
        }
    }

    fn check_range(&self, addr: u64, size: u64) -> Result<(), MappingError> {
        if addr as usize % PAGE_SIZE != 0 || size as usize % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned);
        }
        match addr.checked_add(size) {
            Some(end) if end <= self.limit() => Ok(()),
            _ => Err(MappingError::OutOfRange),
        }
    }

    /// Map `[virt, virt + size)` to `[phys, phys + size)`.
    ///
    /// Leaves get `leaf_flags`; intermediate entries get `table_flags` ORed in,
    /// so a table shared by differently privileged regions never narrows the
    /// rights of its leaves. Existing leaves in the range are replaced. On
    /// failure the pages mapped so far stay mapped.
    pub fn map<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        virt: u64,
        phys: u64,
        size: u64,
        leaf_flags: u64,
        table_flags: u64,
    ) -> Result<(), MappingError> {
        self.check_range(virt, size)?;
        if phys as usize % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned);
        }
        let mut offset = 0;
        while offset < size {
            let (table, idx) = self.leaf_slot(mm, virt + offset, table_flags)?;
            Self::entries(mm, table)[idx] = ((phys + offset) & ADDR_MASK) | leaf_flags;
            self.sync(mm, table, idx, 1);
            offset += PAGE_SIZE as u64;
        }
        Ok(())
    }

    // Walk down to the last-level table covering `addr`, creating tables on
    // the way.
    fn leaf_slot<M: PageAllocator + ?Sized>(
        &self,
        mm: &M,
        addr: u64,
        table_flags: u64,
    ) -> Result<(Pa, usize), MappingError> {
        let mut table = self.root;
        for level in (2..=self.levels).rev() {
            let idx = index(addr, level);
            let entries = Self::entries(mm, table);
            let entry = PageTableEntry(entries[idx]);
            let next = match entry.pa() {
                Some(next) => {
                    if entry.flags() & table_flags != table_flags {
                        entries[idx] |= table_flags;
                        self.sync(mm, table, idx, 1);
                    }
                    next
                }
                None => {
                    let next = mm.alloc_pages(1).ok_or(MappingError::OutOfMemory)?;
                    self.sync(mm, next, 0, ENTRIES);
                    entries[idx] = next.into_u64() | table_flags;
                    self.sync(mm, table, idx, 1);
                    next
                }
            };
            table = next;
        }
        Ok((table, index(addr, 1)))
    }

    /// Remove every mapping in `[virt, virt + size)`.
    ///
    /// Holes are skipped; tables that become empty are freed.
    pub fn unmap<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        virt: u64,
        size: u64,
    ) -> Result<(), MappingError> {
        self.check_range(virt, size)?;
        if size != 0 {
            self.unmap_in(mm, self.root, self.levels, virt, virt + size);
        }
        Ok(())
    }

    // Returns whether `table` is empty afterwards.
    fn unmap_in<M: PageAllocator + ?Sized>(
        &self,
        mm: &M,
        table: Pa,
        level: usize,
        start: u64,
        end: u64,
    ) -> bool {
        let entries = Self::entries(mm, table);
        let mut addr = start;
        while addr < end {
            let idx = index(addr, level);
            let next_boundary = (addr & !(span(level) - 1)) + span(level);
            let chunk_end = next_boundary.min(end);
            let entry = PageTableEntry(entries[idx]);
            if level == 1 {
                entries[idx] = 0;
                self.sync(mm, table, idx, 1);
            } else if let Some(next) = entry.pa() {
                if self.unmap_in(mm, next, level - 1, addr, chunk_end) {
                    entries[idx] = 0;
                    self.sync(mm, table, idx, 1);
                    mm.free_pages(next, 1);
                }
            }
            addr = chunk_end;
        }
        entries.iter().all(|e| !PageTableEntry(*e).is_present())
    }

    /// Translate `virt`, returning the output address and the leaf flags.
    pub fn translate<M: PageAllocator + ?Sized>(&self, mm: &M, virt: u64) -> Option<(u64, u64)> {
        if virt >= self.limit() {
            return None;
        }
        let mut table = self.root;
        for level in (2..=self.levels).rev() {
            table = PageTableEntry(Self::entries(mm, table)[index(virt, level)]).pa()?;
        }
        let leaf = PageTableEntry(Self::entries(mm, table)[index(virt, 1)]);
        leaf.pa()
            .map(|pa| (pa.into_u64() | (virt & (PAGE_SIZE as u64 - 1)), leaf.flags()))
    }

    /// Free every table page.
    pub fn destroy<M: PageAllocator + ?Sized>(self, mm: &M) {
        Self::free_tree(mm, self.root, self.levels);
    }

    fn free_tree<M: PageAllocator + ?Sized>(mm: &M, table: Pa, level: usize) {
        if level > 1 {
            for entry in Self::entries(mm, table).iter() {
                if let Some(next) = PageTableEntry(*entry).pa() {
                    Self::free_tree(mm, next, level - 1);
                }
            }
        }
        mm.free_pages(table, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestMemory;

    const RW: u64 = 0x3;

    #[test]
    fn map_translate_unmap() {
        let mm = TestMemory::new();
        let mut pt = PageTable::new(&mm, 4, Coherency::NonCoherent).unwrap();
        pt.map(&mm, 0x20_0000, 0x8000_0000, 0x3000, RW, RW).unwrap();
        assert_eq!(pt.translate(&mm, 0x20_1234), Some((0x8000_1234, RW)));
        assert_eq!(pt.translate(&mm, 0x20_3000), None);
        // root, PDPT, PD, PT
        assert_eq!(mm.outstanding(), 4);

        pt.unmap(&mm, 0x20_1000, 0x1000).unwrap();
        assert_eq!(pt.translate(&mm, 0x20_1000), None);
        assert!(pt.translate(&mm, 0x20_2000).is_some());

        pt.unmap(&mm, 0x0, 0x4000_0000).unwrap();
        assert_eq!(pt.translate(&mm, 0x20_0000), None);
        // Only the root survives once everything is unmapped.
        assert_eq!(mm.outstanding(), 1);
        pt.destroy(&mm);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn intermediate_rights_accumulate() {
        let mm = TestMemory::new();
        let mut pt = PageTable::new(&mm, 3, Coherency::NonCoherent).unwrap();
        pt.map(&mm, 0x0, 0x0, 0x1000, 0x1, 0x1).unwrap();
        pt.map(&mm, 0x1000, 0x1000, 0x1000, RW, RW).unwrap();
        let root = PageTable::entries(&mm, pt.root());
        assert_eq!(PageTableEntry(root[0]).flags(), RW);
        assert_eq!(pt.translate(&mm, 0x0).map(|(_, f)| f), Some(0x1));
        pt.destroy(&mm);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn rejects_bad_ranges() {
        let mm = TestMemory::new();
        let mut pt = PageTable::new(&mm, 3, Coherency::NonCoherent).unwrap();
        assert_eq!(pt.map(&mm, 0x10, 0, 0x1000, RW, RW), Err(MappingError::Unaligned));
        assert_eq!(pt.map(&mm, 0, 0x10, 0x1000, RW, RW), Err(MappingError::Unaligned));
        assert_eq!(
            pt.map(&mm, 1 << 39, 0, 0x1000, RW, RW),
            Err(MappingError::OutOfRange)
        );
        pt.destroy(&mm);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mm = TestMemory::new();
        let mut pt = PageTable::new(&mm, 4, Coherency::NonCoherent).unwrap();
        mm.fail_after(1);
        assert_eq!(
            pt.map(&mm, 0, 0, 0x1000, RW, RW),
            Err(MappingError::OutOfMemory)
        );
        mm.fail_after(usize::MAX);
        pt.destroy(&mm);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn coherent_tables_are_flushed() {
        let mm = TestMemory::new();
        let mut pt = PageTable::new(&mm, 3, Coherency::Coherent).unwrap();
        let before = mm.flushes();
        pt.map(&mm, 0, 0, 0x2000, RW, RW).unwrap();
        assert!(mm.flushes() > before);
        pt.destroy(&mm);
    }
}
