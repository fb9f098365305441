//! VT-d DMA remapping.
//!
//! Every cell is one remapping domain with the cell id as domain id. A domain
//! translates device addresses through its own second-level page table, which
//! maps only the cell's DMA-capable memory regions. Devices are bound to a
//! domain through the root and context tables shared by all units.
//!
//! Without a DMAR table the manager is inactive and every operation succeeds
//! without effect.

pub mod dmar;
pub mod regs;

use crate::{
    config::{MemFlags, MemoryRegion, PciDevice},
    mm::PageAllocator,
    paging::{Coherency, MappingError, PageTable},
    poll::spin_until,
    VmError,
};
use abyss::{
    addressing::{Pa, PAGE_SIZE},
    println, warning,
};
use alloc::vec::Vec;
use regs::DmarUnit;

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const PAGE_READ: u64 = 1 << 0;
const PAGE_WRITE: u64 = 1 << 1;

const ROOT_PRESENT: u64 = 1 << 0;
const CTX_PRESENT: u64 = 1 << 0;
/// Fault processing disable.
const CTX_FPD: u64 = 1 << 1;
const CTX_AGAW_39: u64 = 1;
const CTX_AGAW_48: u64 = 2;
const CTX_DID_SHIFT: u64 = 8;

/// A root or context table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VtdEntry {
    pub lo: u64,
    pub hi: u64,
}

impl VtdEntry {
    #[inline]
    pub fn is_present(&self) -> bool {
        self.lo & CTX_PRESENT != 0
    }

    /// Domain a context entry binds its device to.
    #[inline]
    pub fn domain_id(&self) -> u32 {
        ((self.hi >> CTX_DID_SHIFT) & 0xffff) as u32
    }
}

/// DMA address space of one cell.
#[derive(Debug)]
pub struct DmaDomain {
    id: u32,
    table: PageTable,
}

impl DmaDomain {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Physical address of the second-level table.
    #[inline]
    pub fn root(&self) -> Pa {
        self.table.root()
    }

    /// Make a DMA-capable region reachable by the domain's devices. Other
    /// regions are ignored.
    pub fn map_region<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        mem: &MemoryRegion,
    ) -> Result<(), MappingError> {
        if !mem.flags.contains(MemFlags::DMA) {
            return Ok(());
        }
        let mut flags = 0;
        if mem.flags.contains(MemFlags::READ) {
            flags |= PAGE_READ;
        }
        if mem.flags.contains(MemFlags::WRITE) {
            flags |= PAGE_WRITE;
        }
        self.table.map(
            mm,
            mem.virt_start,
            mem.phys_start,
            mem.size,
            flags,
            PAGE_READ | PAGE_WRITE,
        )
    }

    /// Remove the DMA window `[addr, addr + size)` if `flags` mark it DMA
    /// capable.
    pub fn unmap_range<M: PageAllocator + ?Sized>(
        &mut self,
        mm: &M,
        addr: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<(), MappingError> {
        if !flags.contains(MemFlags::DMA) {
            return Ok(());
        }
        self.table.unmap(mm, addr, size)
    }

    /// Device address translation.
    pub fn translate<M: PageAllocator + ?Sized>(&self, mm: &M, addr: u64) -> Option<(u64, u64)> {
        self.table.translate(mm, addr)
    }

    pub fn destroy<M: PageAllocator + ?Sized>(self, mm: &M) {
        self.table.destroy(mm)
    }
}

/// The IOMMU isolation manager.
pub struct Vtd<U: DmarUnit> {
    units: Vec<U>,
    pt_levels: usize,
    num_did: u32,
    root_table: Option<Pa>,
}

impl<U: DmarUnit> Vtd<U> {
    /// A manager for a machine without remapping hardware.
    pub const fn disabled() -> Self {
        Self {
            units: Vec::new(),
            pt_levels: 0,
            num_did: u32::MAX,
            root_table: None,
        }
    }

    /// Discover the remapping units listed in the firmware `dmar` table.
    ///
    /// `map_unit` makes the register page at a physical address accessible.
    pub fn init<M: PageAllocator + ?Sized>(
        mm: &M,
        dmar: Option<&[u8]>,
        mut map_unit: impl FnMut(u64) -> Result<U, VmError>,
    ) -> Result<Self, VmError> {
        let table = match dmar {
            Some(table) => table,
            None => {
                warning!("No VT-d support found!");
                return Ok(Self::disabled());
            }
        };

        let mut vtd = Self::disabled();
        for drhd in dmar::parse(table)? {
            println!("Found DMAR @{:#x}", drhd.register_base);
            let unit = map_unit(drhd.register_base)?;

            let cap = unit.read64(regs::CAP);
            let pt_levels = if cap & regs::CAP_SAGAW39 != 0 {
                3
            } else if cap & regs::CAP_SAGAW48 != 0 {
                4
            } else {
                return Err(VmError::UnsupportedHardware("vt-d page table width"));
            };
            if vtd.pt_levels != 0 && vtd.pt_levels != pt_levels {
                return Err(VmError::UnsupportedHardware("vt-d units disagree on width"));
            }
            vtd.pt_levels = pt_levels;

            if cap & regs::CAP_CM != 0 {
                return Err(VmError::UnsupportedHardware("vt-d caching mode"));
            }
            if regs::iotlb_offset(unit.read64(regs::ECAP)) + 16 > PAGE_SIZE {
                return Err(VmError::UnsupportedHardware("vt-d iotlb registers"));
            }
            if unit.read32(regs::GSTS) & regs::GSTS_TES != 0 {
                return Err(VmError::IommuBusy);
            }
            vtd.num_did = vtd.num_did.min(regs::num_domains(cap));
            vtd.units.push(unit);
        }
        vtd.root_table = Some(mm.alloc_pages(1).ok_or(VmError::OutOfMemory)?);
        Ok(vtd)
    }

    /// Whether any remapping hardware is managed.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.units.is_empty()
    }

    pub fn units(&self) -> &[U] {
        &self.units
    }

    /// Levels of the second-level tables; 0 when inactive.
    pub fn pt_levels(&self) -> usize {
        self.pt_levels
    }

    /// Smallest number of domain ids over all units.
    pub fn num_domains(&self) -> u32 {
        self.num_did
    }

    /// Create the empty domain of cell `id`; `None` when inactive.
    pub fn create_domain<M: PageAllocator + ?Sized>(
        &self,
        mm: &M,
        id: u32,
    ) -> Result<Option<DmaDomain>, VmError> {
        if !self.is_active() {
            return Ok(None);
        }
        if id >= self.num_did {
            return Err(VmError::DomainOutOfRange {
                id,
                limit: self.num_did,
            });
        }
        let table = PageTable::new(mm, self.pt_levels, Coherency::Coherent)?;
        Ok(Some(DmaDomain { id, table }))
    }

    fn table<'a, M: PageAllocator + ?Sized>(mm: &M, pa: Pa) -> &'a mut [VtdEntry; 256] {
        unsafe { mm.phys_to_virt(pa).as_mut::<[VtdEntry; 256]>() }
    }

    // Context table referenced by a root entry.
    fn context_table_pa(root: &VtdEntry) -> Option<Pa> {
        if root.lo & ROOT_PRESENT == 0 {
            return None;
        }
        Pa::new((root.lo & ADDR_MASK) as usize)
    }

    fn flush_entry<M: PageAllocator + ?Sized>(mm: &M, table: Pa, index: usize) {
        let size = core::mem::size_of::<VtdEntry>();
        mm.flush_cache(mm.phys_to_virt(table) + index * size, size);
    }

    /// Let `dev` issue DMA through `domain`.
    pub fn add_device<M: PageAllocator + ?Sized>(
        &self,
        mm: &M,
        domain: &DmaDomain,
        dev: &PciDevice,
        cell_name: &str,
    ) -> Result<(), VmError> {
        let root_table = match self.root_table {
            Some(root_table) => root_table,
            None => return Ok(()),
        };
        println!("Adding PCI device {} to cell \"{}\"", dev, cell_name);

        let bus = dev.bus as usize;
        let root = &mut Self::table(mm, root_table)[bus];
        let contexts = match Self::context_table_pa(root) {
            Some(contexts) => contexts,
            None => {
                let contexts = mm.alloc_pages(1).ok_or(VmError::OutOfMemory)?;
                root.lo = ROOT_PRESENT | contexts.into_u64();
                Self::flush_entry(mm, root_table, bus);
                contexts
            }
        };

        let agaw = if self.pt_levels == 3 {
            CTX_AGAW_39
        } else {
            CTX_AGAW_48
        };
        let devfn = dev.devfn as usize;
        let ctx = &mut Self::table(mm, contexts)[devfn];
        ctx.lo = CTX_PRESENT | CTX_FPD | domain.root().into_u64();
        ctx.hi = agaw | (domain.id() as u64) << CTX_DID_SHIFT;
        Self::flush_entry(mm, contexts, devfn);
        Ok(())
    }

    /// Detach `dev` from whatever domain it is bound to.
    ///
    /// The context table of the bus is freed with its last device.
    pub fn remove_device<M: PageAllocator + ?Sized>(&self, mm: &M, dev: &PciDevice, cell_name: &str) {
        let root_table = match self.root_table {
            Some(root_table) => root_table,
            None => return,
        };
        let bus = dev.bus as usize;
        let root = &mut Self::table(mm, root_table)[bus];
        let contexts = match Self::context_table_pa(root) {
            Some(contexts) => contexts,
            None => return,
        };
        let entries = Self::table(mm, contexts);
        let devfn = dev.devfn as usize;
        if entries[devfn].lo & CTX_PRESENT == 0 {
            return;
        }
        println!("Removing PCI device {} from cell \"{}\"", dev, cell_name);
        entries[devfn].lo &= !CTX_PRESENT;
        Self::flush_entry(mm, contexts, devfn);

        if entries.iter().any(|c| c.lo & CTX_PRESENT != 0) {
            return;
        }
        root.lo &= !ROOT_PRESENT;
        Self::flush_entry(mm, root_table, bus);
        mm.free_pages(contexts, 1);
    }

    /// Context entry of `dev`, if its bus has a context table.
    pub fn context_entry<M: PageAllocator + ?Sized>(&self, mm: &M, dev: &PciDevice) -> Option<VtdEntry> {
        let root = Self::table(mm, self.root_table?)[dev.bus as usize];
        Self::context_table_pa(&root).map(|contexts| Self::table(mm, contexts)[dev.devfn as usize])
    }

    /// Domain `dev` is currently bound to.
    pub fn device_domain<M: PageAllocator + ?Sized>(&self, mm: &M, dev: &PciDevice) -> Option<u32> {
        self.context_entry(mm, dev)
            .filter(VtdEntry::is_present)
            .map(|ctx| ctx.domain_id())
    }

    fn flush_unit(unit: &U, ctx_scope: u64, iotlb_scope: u64) {
        unit.write64(regs::CCMD, ctx_scope | regs::CCMD_ICC);
        spin_until("context cache invalidation", || {
            unit.read64(regs::CCMD) & regs::CCMD_ICC == 0
        });

        let iotlb = regs::iotlb_offset(unit.read64(regs::ECAP)) + 8;
        unit.write64(
            iotlb,
            iotlb_scope | regs::IOTLB_DW | regs::IOTLB_DR | regs::IOTLB_IVT,
        );
        spin_until("IOTLB invalidation", || {
            unit.read64(iotlb) & regs::IOTLB_IVT == 0
        });
    }

    /// Invalidate cached context entries and translations of domain `id`.
    pub fn flush_domain(&self, id: u32) {
        for unit in self.units.iter() {
            Self::flush_unit(
                unit,
                regs::CCMD_CIRG_DOMAIN | id as u64,
                regs::IOTLB_IIRG_DOMAIN | (id as u64) << regs::IOTLB_DID_SHIFT,
            );
        }
    }

    /// Point every unit at the root table and turn translation on.
    ///
    /// Units already translating are left alone.
    pub fn enable(&self) {
        let root = match self.root_table {
            Some(root) => root,
            None => return,
        };
        for unit in self.units.iter() {
            if unit.read32(regs::GSTS) & regs::GSTS_TES != 0 {
                continue;
            }
            unit.write64(regs::RTADDR, root.into_u64());
            unit.write32(regs::GCMD, regs::GCMD_SRTP);
            spin_until("root table pointer", || {
                unit.read32(regs::GSTS) & regs::GSTS_RTPS != 0
            });

            Self::flush_unit(unit, regs::CCMD_CIRG_GLOBAL, regs::IOTLB_IIRG_GLOBAL);

            unit.write32(regs::GCMD, regs::GCMD_TE);
            spin_until("DMA translation enable", || {
                unit.read32(regs::GSTS) & regs::GSTS_TES != 0
            });
        }
    }

    /// Turn translation off on every unit.
    pub fn shutdown(&self) {
        for unit in self.units.iter() {
            unit.write32(regs::GCMD, 0);
            spin_until("DMA translation disable", || {
                unit.read32(regs::GSTS) & regs::GSTS_TES == 0
            });
        }
    }

    /// Free the root table and every context table.
    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        if let Some(root_table) = self.root_table {
            for root in Self::table(mm, root_table).iter() {
                if let Some(contexts) = Self::context_table_pa(root) {
                    mm.free_pages(contexts, 1);
                }
            }
            mm.free_pages(root_table, 1);
        }
    }
}

const _: () = assert!(core::mem::size_of::<[VtdEntry; 256]>() == PAGE_SIZE);
