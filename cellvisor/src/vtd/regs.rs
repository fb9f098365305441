//! Register interface of a DMA remapping hardware unit.

use abyss::dev::mmio::MmioPage;

/// Capability register.
pub const CAP: usize = 0x08;
/// Extended capability register.
pub const ECAP: usize = 0x10;
/// Global command register.
pub const GCMD: usize = 0x18;
/// Global status register.
pub const GSTS: usize = 0x1c;
/// Root table address register.
pub const RTADDR: usize = 0x20;
/// Context command register.
pub const CCMD: usize = 0x28;

/// Number of domains supported, encoded.
pub const CAP_ND_MASK: u64 = 0x7;
/// Caching mode: invalid entries may be cached.
pub const CAP_CM: u64 = 1 << 7;
/// 39-bit, 3-level second-level translation supported.
pub const CAP_SAGAW39: u64 = 1 << 9;
/// 48-bit, 4-level second-level translation supported.
pub const CAP_SAGAW48: u64 = 1 << 10;

const ECAP_IRO_SHIFT: u64 = 8;
const ECAP_IRO_MASK: u64 = 0x3ff;

pub const GCMD_TE: u32 = 1 << 31;
pub const GCMD_SRTP: u32 = 1 << 30;
pub const GSTS_TES: u32 = 1 << 31;
pub const GSTS_RTPS: u32 = 1 << 30;

pub const CCMD_ICC: u64 = 1 << 63;
pub const CCMD_CIRG_GLOBAL: u64 = 1 << 61;
pub const CCMD_CIRG_DOMAIN: u64 = 2 << 61;

pub const IOTLB_IVT: u64 = 1 << 63;
pub const IOTLB_IIRG_GLOBAL: u64 = 1 << 60;
pub const IOTLB_IIRG_DOMAIN: u64 = 2 << 60;
pub const IOTLB_DR: u64 = 1 << 49;
pub const IOTLB_DW: u64 = 1 << 48;
pub const IOTLB_DID_SHIFT: u64 = 32;

/// Offset of the IOTLB register block, from the extended capabilities.
///
/// The invalidate register itself sits 8 bytes into the block.
#[inline]
pub const fn iotlb_offset(ecap: u64) -> usize {
    (((ecap >> ECAP_IRO_SHIFT) & ECAP_IRO_MASK) * 16) as usize
}

/// Number of domain ids a unit supports.
#[inline]
pub const fn num_domains(cap: u64) -> u32 {
    1 << (4 + (cap & CAP_ND_MASK) * 2)
}

/// Register access to one remapping unit.
pub trait DmarUnit: Send {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read64(&self, offset: usize) -> u64;
    fn write64(&self, offset: usize, value: u64);
}

impl DmarUnit for MmioPage {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        MmioPage::read32(self, offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        MmioPage::write32(self, offset, value)
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        MmioPage::read64(self, offset)
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        MmioPage::write64(self, offset, value)
    }
}
