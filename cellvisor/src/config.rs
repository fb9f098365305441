//! Static cell configuration.
//!
//! A cell is described once, before it is created, by a [`CellConfig`]. The
//! host cell's record is part of the [`SystemConfig`] handed to the
//! hypervisor at boot; the records of other cells arrive as binary blobs with
//! the cell-create hypercall and are decoded by [`CellConfig::parse`].

use crate::VmError;
use abyss::addressing::is_page_aligned;
use alloc::{string::String, vec, vec::Vec};

bitflags::bitflags! {
    /// Access rights of a memory region.
    pub struct MemFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Devices of the cell may target the region.
        const DMA = 1 << 3;
    }
}

/// A contiguous guest-physical window backed by host-physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: MemFlags,
}

impl MemoryRegion {
    /// Identity mapped region.
    pub const fn identity(start: u64, size: u64, flags: MemFlags) -> Self {
        Self {
            phys_start: start,
            virt_start: start,
            size,
            flags,
        }
    }

    /// Check alignment, size and overflow. Unknown flag bits are rejected
    /// when the region is decoded.
    pub fn check(&self) -> Result<(), VmError> {
        if !is_page_aligned(self.phys_start)
            || !is_page_aligned(self.virt_start)
            || !is_page_aligned(self.size)
        {
            return Err(VmError::InvalidConfig("unaligned memory region"));
        }
        if self.size == 0 {
            return Err(VmError::InvalidConfig("empty memory region"));
        }
        if self.phys_start.checked_add(self.size).is_none()
            || self.virt_start.checked_add(self.size).is_none()
        {
            return Err(VmError::InvalidConfig("memory region overflows"));
        }
        Ok(())
    }
}

/// PCI device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciDevice {
    pub domain: u16,
    pub bus: u8,
    pub devfn: u8,
}

impl PciDevice {
    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        Self {
            domain: 0,
            bus,
            devfn: (dev << 3) | (func & 7),
        }
    }

    /// Requester id (bus << 8 | devfn).
    pub const fn bdf(&self) -> u16 {
        ((self.bus as u16) << 8) | self.devfn as u16
    }
}

impl core::fmt::Display for PciDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain,
            self.bus,
            self.devfn >> 3,
            self.devfn & 7
        )
    }
}

/// Bitmap of logical CPU ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    bits: Vec<u64>,
}

impl CpuSet {
    pub const fn new() -> Self {
        Self { bits: Vec::new() }
    }

    /// Decode little endian bitmap bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bits = vec![0u64; (bytes.len() + 7) / 8];
        for (i, b) in bytes.iter().enumerate() {
            bits[i / 8] |= (*b as u64) << ((i % 8) * 8);
        }
        Self { bits }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.bits
            .get(cpu / 64)
            .map_or(false, |w| w & (1u64 << (cpu % 64)) != 0)
    }

    pub fn insert(&mut self, cpu: usize) {
        if self.bits.len() <= cpu / 64 {
            self.bits.resize(cpu / 64 + 1, 0);
        }
        self.bits[cpu / 64] |= 1u64 << (cpu % 64);
    }

    pub fn remove(&mut self, cpu: usize) {
        if let Some(w) = self.bits.get_mut(cpu / 64) {
            *w &= !(1u64 << (cpu % 64));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(i, w)| {
            (0..64)
                .filter(move |b| w & (1u64 << *b) != 0)
                .map(move |b| i * 64 + b)
        })
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

/// Immutable description of a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellConfig {
    pub name: String,
    pub cpu_set: CpuSet,
    pub memory_regions: Vec<MemoryRegion>,
    pub pci_devices: Vec<PciDevice>,
    /// One bit per port; a set bit denies the port.
    pub pio_bitmap: Vec<u8>,
}

/// Magic at the start of a configuration blob.
pub const CONFIG_SIGNATURE: &[u8; 8] = b"CELLCONF";
const NAME_LEN: usize = 32;
/// Size of the fixed part of a blob, up to the variable-length sections.
pub const HEADER_LEN: usize = 8 + NAME_LEN + 4 * 4;
const REGION_LEN: usize = 32;
const DEVICE_LEN: usize = 4;

// Little endian reader over a blob.
struct Reader<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], VmError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.blob.len())
            .ok_or(VmError::InvalidConfig("truncated configuration"))?;
        let bytes = &self.blob[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, VmError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, VmError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, VmError> {
        let mut v = [0; 8];
        v.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(v))
    }
}

impl CellConfig {
    /// Total blob size announced by the header at the start of `blob`.
    pub fn blob_len(blob: &[u8]) -> Result<usize, VmError> {
        let mut r = Reader { blob, pos: 0 };
        if r.take(8)? != CONFIG_SIGNATURE {
            return Err(VmError::InvalidConfig("bad signature"));
        }
        r.take(NAME_LEN)?;
        let cpu_set_size = r.u32()? as usize;
        let num_regions = r.u32()? as usize;
        let pio_bitmap_size = r.u32()? as usize;
        let num_devices = r.u32()? as usize;
        Ok(HEADER_LEN
            + cpu_set_size
            + num_regions * REGION_LEN
            + pio_bitmap_size
            + num_devices * DEVICE_LEN)
    }

    /// Decode a configuration blob.
    pub fn parse(blob: &[u8]) -> Result<Self, VmError> {
        let mut r = Reader { blob, pos: 0 };
        if r.take(8)? != CONFIG_SIGNATURE {
            return Err(VmError::InvalidConfig("bad signature"));
        }
        let raw_name = r.take(NAME_LEN)?;
        let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        let name = core::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| VmError::InvalidConfig("cell name is not utf-8"))?
            .into();
        let cpu_set_size = r.u32()? as usize;
        let num_regions = r.u32()? as usize;
        let pio_bitmap_size = r.u32()? as usize;
        let num_devices = r.u32()? as usize;
        debug_assert_eq!(r.pos, HEADER_LEN);

        if cpu_set_size % 8 != 0 {
            return Err(VmError::InvalidConfig("cpu set size"));
        }
        let cpu_set = CpuSet::from_bytes(r.take(cpu_set_size)?);

        let mut memory_regions = Vec::new();
        for _ in 0..num_regions {
            let phys_start = r.u64()?;
            let virt_start = r.u64()?;
            let size = r.u64()?;
            let flags = r.u64()?;
            memory_regions.push(MemoryRegion {
                phys_start,
                virt_start,
                size,
                flags: MemFlags::from_bits(flags)
                    .ok_or(VmError::InvalidConfig("unknown memory flags"))?,
            });
        }
        let pio_bitmap = r.take(pio_bitmap_size)?.to_vec();
        let mut pci_devices = Vec::new();
        for _ in 0..num_devices {
            let domain = r.u16()?;
            let b = r.take(2)?;
            pci_devices.push(PciDevice {
                domain,
                bus: b[0],
                devfn: b[1],
            });
        }
        if r.pos != blob.len() {
            return Err(VmError::InvalidConfig("trailing bytes"));
        }
        Ok(Self {
            name,
            cpu_set,
            memory_regions,
            pci_devices,
            pio_bitmap,
        })
    }

    /// Total size of the blob describing this configuration.
    pub fn blob_size(&self) -> usize {
        HEADER_LEN
            + (self.cpu_set.bits.len() * 8)
            + self.memory_regions.len() * REGION_LEN
            + self.pio_bitmap.len()
            + self.pci_devices.len() * DEVICE_LEN
    }

    /// Encode into the format read by [`CellConfig::parse`].
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.blob_size());
        blob.extend_from_slice(CONFIG_SIGNATURE);
        let mut name = [0u8; NAME_LEN];
        let len = self.name.len().min(NAME_LEN);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        blob.extend_from_slice(&name);
        for v in [
            self.cpu_set.bits.len() * 8,
            self.memory_regions.len(),
            self.pio_bitmap.len(),
            self.pci_devices.len(),
        ] {
            blob.extend_from_slice(&(v as u32).to_le_bytes());
        }
        for w in self.cpu_set.bits.iter() {
            blob.extend_from_slice(&w.to_le_bytes());
        }
        for m in self.memory_regions.iter() {
            for v in [m.phys_start, m.virt_start, m.size, m.flags.bits()] {
                blob.extend_from_slice(&v.to_le_bytes());
            }
        }
        blob.extend_from_slice(&self.pio_bitmap);
        for d in self.pci_devices.iter() {
            blob.extend_from_slice(&d.domain.to_le_bytes());
            blob.push(d.bus);
            blob.push(d.devfn);
        }
        blob
    }

    /// Check every memory region.
    pub fn check_memory_regions(&self) -> Result<(), VmError> {
        self.memory_regions.iter().try_for_each(MemoryRegion::check)
    }

    pub fn has_device(&self, dev: &PciDevice) -> bool {
        self.pci_devices.contains(dev)
    }
}

/// Machine-wide configuration handed to the hypervisor at boot.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Memory reserved for the hypervisor itself.
    pub hypervisor_memory: MemoryRegion,
    /// Window through which configuration blobs are read, if any.
    pub config_memory: Option<MemoryRegion>,
    pub root_cell: CellConfig,
    /// The interrupt controller runs in x2APIC mode.
    pub x2apic: bool,
}

impl SystemConfig {
    /// Validate every region the system declares.
    pub fn check(&self) -> Result<(), VmError> {
        self.hypervisor_memory.check()?;
        if let Some(m) = self.config_memory.as_ref() {
            m.check()?;
        }
        self.root_cell.check_memory_regions()?;
        if self.root_cell.cpu_set.is_empty() {
            return Err(VmError::InvalidConfig("host cell without cpus"));
        }
        Ok(())
    }
}
