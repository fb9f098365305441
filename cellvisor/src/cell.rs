//! Cells and the movement of resources between them.
//!
//! The host cell starts out owning every processor, memory region, port and
//! device of its configuration. Creating a cell takes the cell's resources
//! away from the host; destroying it hands back whatever the host's own
//! configuration lists.

use crate::{
    config::{CellConfig, CpuSet, MemoryRegion, PciDevice, SystemConfig, HEADER_LEN},
    ept::{EptFlags, ExtendedPageTable},
    mm::PageAllocator,
    msr_bitmap::MsrBitmap,
    pio::PioBitmap,
    vcpu::{CellVmxConfig, VmxGlobals},
    vtd::{regs::DmarUnit, DmaDomain, Vtd},
    VmError,
};
use abyss::{
    addressing::{Pa, PAGE_SIZE},
    println, warning,
};
use alloc::{collections::BTreeMap, vec};

/// Cell identifier. Also the DMA remapping domain id of the cell.
pub type CellId = u32;

/// Id of the host cell.
pub const ROOT_CELL: CellId = 0;

/// Largest configuration blob accepted from the host.
const MAX_CONFIG_SIZE: usize = 64 * PAGE_SIZE;

/// A partition of the machine.
#[derive(Debug)]
pub struct Cell {
    id: CellId,
    config: CellConfig,
    ept: ExtendedPageTable,
    pio: PioBitmap,
    dma: Option<DmaDomain>,
    cpus: CpuSet,
}

impl Cell {
    /// Build the address maps of a cell without any processor.
    ///
    /// Every page allocated on the way is freed again on failure.
    fn build<M: PageAllocator + ?Sized, U: DmarUnit>(
        mm: &M,
        id: CellId,
        config: CellConfig,
        apic_page: Pa,
        vtd: &Vtd<U>,
    ) -> Result<Self, VmError> {
        let ept = ExtendedPageTable::new(mm)?;
        let pio = match PioBitmap::new(mm, &config.pio_bitmap) {
            Some(pio) => pio,
            None => {
                ept.destroy(mm);
                return Err(VmError::OutOfMemory);
            }
        };
        let dma = match vtd.create_domain(mm, id) {
            Ok(dma) => dma,
            Err(e) => {
                pio.release(mm);
                ept.destroy(mm);
                return Err(e);
            }
        };
        let mut cell = Self {
            id,
            config,
            ept,
            pio,
            dma,
            cpus: CpuSet::new(),
        };
        match cell.map_memory(mm, apic_page) {
            Ok(()) => Ok(cell),
            Err(e) => {
                cell.release(mm);
                Err(e)
            }
        }
    }

    fn map_memory<M: PageAllocator + ?Sized>(&mut self, mm: &M, apic_page: Pa) -> Result<(), VmError> {
        for mem in self.config.memory_regions.iter() {
            self.ept.map_region(mm, mem)?;
            if let Some(dma) = self.dma.as_mut() {
                dma.map_region(mm, mem)?;
            }
        }
        self.ept.map_apic_access_page(mm, apic_page)?;
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> CellId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    /// Processors currently running the cell.
    #[inline]
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    #[inline]
    pub fn ept(&self) -> &ExtendedPageTable {
        &self.ept
    }

    #[inline]
    pub fn pio(&self) -> &PioBitmap {
        &self.pio
    }

    #[inline]
    pub fn dma(&self) -> Option<&DmaDomain> {
        self.dma.as_ref()
    }

    /// Per-cell structures a processor loads into its VMCS.
    pub fn vmx_config(&self) -> CellVmxConfig {
        CellVmxConfig {
            io_bitmap_a: self.pio.pa_a(),
            io_bitmap_b: self.pio.pa_b(),
            eptp: self.ept.eptp(),
        }
    }

    /// Free the tables of the cell.
    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        self.ept.destroy(mm);
        self.pio.release(mm);
        if let Some(dma) = self.dma {
            dma.destroy(mm);
        }
    }
}

fn overlaps(a: &MemoryRegion, start: u64, size: u64) -> bool {
    a.phys_start < start.saturating_add(size) && start < a.phys_start.saturating_add(a.size)
}

/// Every cell of the machine.
///
/// Shared by all processors behind the lock of
/// [`Setup`](crate::setup::Setup), through which it serves the cell
/// management hypercalls.
pub struct Cells<'m, M: PageAllocator + ?Sized, U: DmarUnit> {
    mm: &'m M,
    system: SystemConfig,
    vtd: Vtd<U>,
    msr_bitmap: MsrBitmap,
    apic_page: Pa,
    root: Cell,
    cells: BTreeMap<CellId, Cell>,
    /// Devices assigned to a cell other than the host, and their holder.
    lent: BTreeMap<PciDevice, CellId>,
    shut_down: bool,
}

impl<'m, M: PageAllocator + ?Sized, U: DmarUnit> Cells<'m, M, U> {
    /// Build the host cell of `system`.
    ///
    /// The host cell owns no processor until [`Cells::register_root_cpu`].
    pub fn new(mm: &'m M, system: SystemConfig, vtd: Vtd<U>) -> Result<Self, VmError> {
        if let Err(e) = system.check() {
            vtd.release(mm);
            return Err(e);
        }
        let msr_bitmap = match MsrBitmap::new(mm, system.x2apic) {
            Some(msr_bitmap) => msr_bitmap,
            None => {
                vtd.release(mm);
                return Err(VmError::OutOfMemory);
            }
        };
        let apic_page = match mm.alloc_pages(1) {
            Some(apic_page) => apic_page,
            None => {
                msr_bitmap.release(mm);
                vtd.release(mm);
                return Err(VmError::OutOfMemory);
            }
        };
        let root = match Cell::build(mm, ROOT_CELL, system.root_cell.clone(), apic_page, &vtd) {
            Ok(root) => root,
            Err(e) => {
                mm.free_pages(apic_page, 1);
                msr_bitmap.release(mm);
                vtd.release(mm);
                return Err(e);
            }
        };
        let cells = Self {
            mm,
            system,
            vtd,
            msr_bitmap,
            apic_page,
            root,
            cells: BTreeMap::new(),
            lent: BTreeMap::new(),
            shut_down: false,
        };
        let bound = cells.bind_devices(&cells.root);
        match bound {
            Ok(()) => Ok(cells),
            Err(e) => {
                cells.release();
                Err(e)
            }
        }
    }

    #[inline]
    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    #[inline]
    pub fn vtd(&self) -> &Vtd<U> {
        &self.vtd
    }

    #[inline]
    pub fn root(&self) -> &Cell {
        &self.root
    }

    /// Cell `id`, the host cell included.
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        if id == ROOT_CELL {
            Some(&self.root)
        } else {
            self.cells.get(&id)
        }
    }

    fn cell_mut(&mut self, id: CellId) -> Result<&mut Cell, VmError> {
        if id == ROOT_CELL {
            Ok(&mut self.root)
        } else {
            self.cells.get_mut(&id).ok_or(VmError::NoSuchCell(id))
        }
    }

    /// Number of cells, the host cell included.
    pub fn len(&self) -> usize {
        self.cells.len() + 1
    }

    /// Cell currently running on `cpu`.
    pub fn cell_of(&self, cpu: usize) -> Option<CellId> {
        if self.root.cpus.contains(cpu) {
            return Some(ROOT_CELL);
        }
        self.cells
            .values()
            .find(|cell| cell.cpus.contains(cpu))
            .map(Cell::id)
    }

    /// Holder of a lent device.
    pub fn holder_of(&self, dev: &PciDevice) -> Option<CellId> {
        self.lent.get(dev).copied()
    }

    /// Hand processor `cpu` to the host cell at boot.
    pub fn register_root_cpu(&mut self, cpu: usize) -> Result<(), VmError> {
        if !self.system.root_cell.cpu_set.contains(cpu) {
            return Err(VmError::InvalidArgument);
        }
        self.root.cpus.insert(cpu);
        Ok(())
    }

    /// Structures shared by every processor.
    pub fn vmx_globals(&self) -> VmxGlobals {
        VmxGlobals {
            msr_bitmap: self.msr_bitmap.pa(),
            apic_access_page: self.apic_page,
        }
    }

    /// VMX view of the cell running on `cpu`.
    pub fn vmx_config(&self, cpu: usize) -> Option<CellVmxConfig> {
        self.cell_of(cpu)
            .and_then(|id| self.cell(id))
            .map(Cell::vmx_config)
    }

    /// Start DMA remapping once the host cell's devices are bound.
    pub fn activate_iommu(&self) {
        self.vtd.enable();
    }

    /// Create cell `id` from `config` with resources taken from the host.
    ///
    /// On failure the host cell is left as it was.
    pub fn create_cell(&mut self, id: CellId, config: CellConfig) -> Result<(), VmError> {
        if id == ROOT_CELL || self.cells.contains_key(&id) {
            return Err(VmError::CellExists(id));
        }
        config.check_memory_regions()?;
        let limit = 1u64 << 48;
        if config
            .memory_regions
            .iter()
            .any(|m| m.phys_start + m.size > limit || m.virt_start + m.size > limit)
        {
            return Err(VmError::InvalidConfig("memory region beyond the address width"));
        }
        let hv = &self.system.hypervisor_memory;
        if config
            .memory_regions
            .iter()
            .any(|m| overlaps(m, hv.phys_start, hv.size))
        {
            return Err(VmError::InvalidConfig("memory region overlaps the hypervisor"));
        }
        if config.cpu_set.is_empty() {
            return Err(VmError::InvalidConfig("cell without cpus"));
        }
        if let Some(cpu) = config.cpu_set.iter().find(|cpu| !self.root.cpus.contains(*cpu)) {
            return Err(VmError::CpuBusy(cpu));
        }
        if let Some(dev) = config.pci_devices.iter().find(|dev| self.lent.contains_key(dev)) {
            return Err(VmError::DeviceBusy(*dev));
        }
        if config.memory_regions.iter().any(|m| {
            self.cells
                .values()
                .flat_map(|cell| cell.config.memory_regions.iter())
                .any(|other| overlaps(m, other.phys_start, other.size))
        }) {
            return Err(VmError::InvalidConfig("memory region belongs to another cell"));
        }

        let mut cell = Cell::build(self.mm, id, config, self.apic_page, &self.vtd)?;
        // Binding a device to the new domain replaces the host's binding in
        // place, so the host keeps its context tables.
        let result = self
            .bind_devices(&cell)
            .and_then(|_| self.shrink_root(&cell.config));
        if let Err(e) = result {
            if self.return_to_root(&cell).is_err() {
                warning!("Failed to restore the host cell after a failed creation");
            }
            cell.release(self.mm);
            return Err(e);
        }
        self.vtd.flush_domain(id);

        for cpu in cell.config.cpu_set.iter() {
            self.root.cpus.remove(cpu);
            cell.cpus.insert(cpu);
        }
        for dev in cell.config.pci_devices.iter() {
            self.lent.insert(*dev, id);
        }
        println!("Created cell \"{}\"", cell.name());
        self.cells.insert(id, cell);
        Ok(())
    }

    fn bind_devices(&self, cell: &Cell) -> Result<(), VmError> {
        if let Some(dma) = cell.dma.as_ref() {
            for dev in cell.config.pci_devices.iter() {
                self.vtd.add_device(self.mm, dma, dev, cell.name())?;
            }
        }
        Ok(())
    }

    /// Take the memory, ports and devices of `config` away from the host.
    ///
    /// The host's view of a region is its identity window at `phys_start`.
    /// Devices already bound to another domain are left alone.
    pub fn shrink_root(&mut self, config: &CellConfig) -> Result<(), VmError> {
        let mm = self.mm;
        for mem in config.memory_regions.iter() {
            let host_view = MemoryRegion::identity(mem.phys_start, mem.size, mem.flags);
            self.root.ept.unmap_region(mm, &host_view)?;
            if let Some(dma) = self.root.dma.as_mut() {
                dma.unmap_range(mm, mem.phys_start, mem.size, mem.flags)?;
            }
        }
        self.root.pio.shrink(mm, &config.pio_bitmap);
        for dev in config.pci_devices.iter() {
            if self.vtd.device_domain(mm, dev) == Some(ROOT_CELL) {
                self.vtd.remove_device(mm, dev, self.root.name());
            }
        }
        self.vtd.flush_domain(ROOT_CELL);
        Ok(())
    }

    // Map the parts of `mem` the host configuration owns back into the host.
    fn remap_to_root(&mut self, mem: &MemoryRegion) -> Result<(), VmError> {
        let mm = self.mm;
        let end = mem.phys_start + mem.size;
        for host in self.system.root_cell.memory_regions.iter() {
            if !overlaps(host, mem.phys_start, mem.size) {
                continue;
            }
            let start = mem.phys_start.max(host.phys_start);
            let region = MemoryRegion {
                phys_start: start,
                virt_start: host.virt_start + (start - host.phys_start),
                size: end.min(host.phys_start + host.size) - start,
                flags: host.flags,
            };
            self.root.ept.map_region(mm, &region)?;
            if let Some(dma) = self.root.dma.as_mut() {
                dma.map_region(mm, &region)?;
            }
        }
        Ok(())
    }

    // Hand the devices, memory, ports and processors of `cell` back to the
    // host. Keeps going after a failure and reports the first one.
    fn return_to_root(&mut self, cell: &Cell) -> Result<(), VmError> {
        let mm = self.mm;
        let mut result = Ok(());

        for dev in cell.config.pci_devices.iter() {
            self.lent.remove(dev);
            let returned = self.root.config.has_device(dev)
                && match self.root.dma.as_ref() {
                    Some(dma) => self.vtd.add_device(mm, dma, dev, self.root.name()).is_ok(),
                    None => true,
                };
            if !returned {
                self.vtd.remove_device(mm, dev, cell.name());
                warning!("Failed to re-assign PCI device {} to host cell", dev);
            }
        }
        self.vtd.flush_domain(cell.id);
        self.vtd.flush_domain(ROOT_CELL);

        for mem in cell.config.memory_regions.iter() {
            if let Err(e) = self.remap_to_root(mem) {
                result = result.and(Err(e));
            }
        }
        self.root.pio.restore(
            mm,
            &cell.config.pio_bitmap,
            &self.system.root_cell.pio_bitmap,
        );
        for cpu in cell.cpus.iter() {
            self.root.cpus.insert(cpu);
        }
        result
    }

    /// Take cell `id` out of the registry and return its resources to the
    /// host. Its tables stay allocated until the [`Detached`] is released.
    pub fn detach_cell(&mut self, id: CellId) -> Result<Detached, VmError> {
        if id == ROOT_CELL {
            return Err(VmError::InvalidArgument);
        }
        let cell = self.cells.remove(&id).ok_or(VmError::NoSuchCell(id))?;
        let result = self.return_to_root(&cell);
        println!("Closing cell \"{}\"", cell.name());
        Ok(Detached { cell, result })
    }

    /// Destroy cell `id` while none of its processors is in guest mode.
    ///
    /// The cell is gone even if the host could not take everything back.
    pub fn destroy_cell(&mut self, id: CellId) -> Result<(), VmError> {
        self.detach_cell(id)?.release(self.mm)
    }

    /// Map an additional region into cell `id`.
    pub fn map_memory_region(&mut self, id: CellId, mem: &MemoryRegion) -> Result<(), VmError> {
        mem.check()?;
        let mm = self.mm;
        let cell = self.cell_mut(id)?;
        cell.ept.map_region(mm, mem)?;
        if let Some(dma) = cell.dma.as_mut() {
            dma.map_region(mm, mem)?;
        }
        Ok(())
    }

    /// Remove a region from cell `id`.
    pub fn unmap_memory_region(&mut self, id: CellId, mem: &MemoryRegion) -> Result<(), VmError> {
        mem.check()?;
        let mm = self.mm;
        let cell = self.cell_mut(id)?;
        cell.ept.unmap_region(mm, mem)?;
        if let Some(dma) = cell.dma.as_mut() {
            dma.unmap_range(mm, mem.virt_start, mem.size, mem.flags)?;
        }
        self.vtd.flush_domain(id);
        Ok(())
    }

    /// Stop DMA remapping before the hypervisor leaves.
    ///
    /// Refused while cells other than the host exist. Later calls only
    /// confirm the first.
    pub fn shutdown(&mut self) -> Result<(), VmError> {
        if !self.cells.is_empty() {
            return Err(VmError::CellsActive);
        }
        if !self.shut_down {
            println!("Shutting down hypervisor");
            self.vtd.shutdown();
            self.shut_down = true;
        }
        Ok(())
    }

    // Copy guest-physical memory of the host cell through its EPT.
    fn read_host(&self, gpa: u64, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = gpa
                .checked_add(done as u64)
                .ok_or(VmError::InvalidArgument)?;
            let (hpa, flags) = self
                .root
                .ept
                .translate(self.mm, addr)
                .ok_or(VmError::InvalidArgument)?;
            if !flags.contains(EptFlags::READ) {
                return Err(VmError::InvalidArgument);
            }
            let len = (PAGE_SIZE - addr as usize % PAGE_SIZE).min(buf.len() - done);
            let src = self
                .mm
                .phys_to_virt(Pa::new(hpa as usize).ok_or(VmError::InvalidArgument)?);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr::<u8>(),
                    buf[done..].as_mut_ptr(),
                    len,
                );
            }
            done += len;
        }
        Ok(())
    }

    fn check_config_window(&self, gpa: u64, len: usize) -> Result<(), VmError> {
        if let Some(window) = self.system.config_memory.as_ref() {
            let end = gpa
                .checked_add(len as u64)
                .ok_or(VmError::InvalidArgument)?;
            if gpa < window.virt_start || end > window.virt_start + window.size {
                return Err(VmError::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Read and decode the configuration blob at host address `gpa`.
    pub fn read_config(&self, gpa: u64) -> Result<CellConfig, VmError> {
        self.check_config_window(gpa, HEADER_LEN)?;
        let mut header = [0u8; HEADER_LEN];
        self.read_host(gpa, &mut header)?;
        let len = CellConfig::blob_len(&header)?;
        if len > MAX_CONFIG_SIZE {
            return Err(VmError::InvalidConfig("configuration too large"));
        }
        self.check_config_window(gpa, len)?;
        let mut blob = vec![0u8; len];
        self.read_host(gpa, &mut blob)?;
        CellConfig::parse(&blob)
    }

    /// Smallest unused cell id. Ids are bounded by the remapping domains.
    pub fn next_free_id(&self) -> Result<CellId, VmError> {
        let limit = self.vtd.num_domains().max(2);
        (1..limit)
            .find(|id| !self.cells.contains_key(id))
            .ok_or(VmError::DomainOutOfRange { id: limit, limit })
    }

    /// Free everything, the remapping structures included.
    pub fn release(self) {
        let mm = self.mm;
        for (_, cell) in self.cells {
            cell.release(mm);
        }
        self.root.release(mm);
        self.msr_bitmap.release(mm);
        mm.free_pages(self.apic_page, 1);
        self.vtd.release(mm);
    }
}

impl<'m, M: PageAllocator + ?Sized, U: DmarUnit> Cells<'m, M, U> {
    fn check_caller(&self, cpu: usize) -> Result<(), VmError> {
        if self.cell_of(cpu) != Some(ROOT_CELL) {
            return Err(VmError::PermissionDenied);
        }
        Ok(())
    }

    /// Disable hypercall issued on `cpu`.
    pub fn request_shutdown(&mut self, cpu: usize) -> Result<(), VmError> {
        self.check_caller(cpu)?;
        self.shutdown()
    }

    /// Cell-create hypercall issued on `cpu` with the blob at `config_addr`.
    ///
    /// The calling processor can not be given to the new cell. Returns the
    /// processors that left the host and still run its guest.
    pub fn request_create(&mut self, cpu: usize, config_addr: u64) -> Result<CpuSet, VmError> {
        self.check_caller(cpu)?;
        let config = self.read_config(config_addr)?;
        if config.cpu_set.contains(cpu) {
            return Err(VmError::CpuBusy(cpu));
        }
        let id = self.next_free_id()?;
        let moved = config.cpu_set.clone();
        self.create_cell(id, config)?;
        Ok(moved)
    }

    /// Cell-destroy hypercall issued on `cpu`.
    pub fn request_destroy(&mut self, cpu: usize, id: u64) -> Result<Detached, VmError> {
        self.check_caller(cpu)?;
        let id = CellId::try_from(id).map_err(|_| VmError::InvalidArgument)?;
        self.detach_cell(id)
    }
}

/// A destroyed cell whose processors may still run on its tables.
#[must_use]
pub struct Detached {
    cell: Cell,
    result: Result<(), VmError>,
}

impl Detached {
    /// Processors handed back to the host.
    pub fn cpus(&self) -> &CpuSet {
        self.cell.cpus()
    }

    /// Free the tables once no processor uses them. Fails if the host did
    /// not get everything back.
    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) -> Result<(), VmError> {
        self.cell.release(mm);
        self.result
    }
}
