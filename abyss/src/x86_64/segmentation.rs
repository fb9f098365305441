//! Segmentation.
//!
//! Decoding of GDT descriptors into the (base, limit, access rights) triple
//! that hardware virtualization expects for each segment register.

bitflags::bitflags! {
    /// Access rights in the VMX layout (descriptor bits 40..55, with the
    /// limit nibble removed).
    pub struct SegmentAccess: u32 {
        /// Accessed.
        const A = 1 << 0;
        /// Writable/Readable.
        const WR = 1 << 1;
        /// Expand_down/Conforming.
        const EC = 1 << 2;
        /// Data or Code
        const CODE = 1 << 3;
        /// Descriptor type (0 = system; 1 = code or data).
        const S = 1 << 4;
        /// Segment present
        const P = 1 << 7;
        /// Available for use by system software
        const AVL = 1 << 12;
        /// 64-bit code segment (IA-32e mode only)
        const L = 1 << 13;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const D_B = 1 << 14;
        /// Granularity
        const G = 1 << 15;
        /// Marks the segment register as unusable.
        const UNUSABLE = 1 << 16;
    }
}

/// Busy bit of a TSS descriptor type.
const TSS_BUSY: u64 = 1 << 41;

/// Segment register state decoded from a descriptor table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentState {
    /// Segment register that holds the null selector.
    pub const UNUSABLE: Self = Self {
        selector: 0,
        base: 0,
        limit: 0,
        access_rights: SegmentAccess::UNUSABLE.bits(),
    };

    /// Decode the descriptor `lo` (and `hi`, the upper half of a system
    /// descriptor) referenced by `selector`.
    pub fn decode(selector: u16, lo: u64, hi: u64) -> Self {
        if selector & !3 == 0 {
            return Self::UNUSABLE;
        }
        let mut base = ((lo >> 16) & 0xff_ffff) | (((lo >> 56) & 0xff) << 24);
        let access_rights = ((lo >> 40) & 0xf0ff) as u32;
        if access_rights & SegmentAccess::S.bits() == 0 {
            base |= (hi & 0xffff_ffff) << 32;
        }
        let mut limit = ((lo & 0xffff) | ((lo >> 32) & 0xf_0000)) as u32;
        if access_rights & SegmentAccess::G.bits() != 0 {
            limit = (limit << 12) | 0xfff;
        }
        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }

    /// Read the descriptor for `selector` from the table at `gdt_base`.
    ///
    /// # Safety
    /// `gdt_base` must point to a mapped descriptor table covering `selector`.
    pub unsafe fn from_gdt(gdt_base: u64, selector: u16) -> Self {
        let entry = (gdt_base as *const u64).add((selector >> 3) as usize);
        let lo = core::ptr::read_volatile(entry);
        let hi = if lo & (1 << 44) == 0 {
            core::ptr::read_volatile(entry.add(1))
        } else {
            0
        };
        Self::decode(selector, lo, hi)
    }
}

/// Clear the busy flag of the TSS descriptor so that `ltr` accepts it again.
///
/// # Safety
/// `gdt_base` must point to a writable descriptor table covering `selector`.
pub unsafe fn clear_tss_busy(gdt_base: u64, selector: u16) {
    let entry = (gdt_base as *mut u64).add((selector >> 3) as usize);
    core::ptr::write_volatile(entry, core::ptr::read_volatile(entry) & !TSS_BUSY);
}

/// Current segment selectors.
#[cfg(target_arch = "x86_64")]
pub mod selectors {
    use core::arch::asm;

    macro_rules! read_selector {
        ($name:ident, $reg:literal) => {
            #[doc = concat!("Read the ", $reg, " selector.")]
            #[inline]
            pub fn $name() -> u16 {
                let v: u16;
                unsafe {
                    asm!(concat!("mov {:x}, ", $reg), out(reg) v, options(nomem, nostack));
                }
                v
            }
        };
    }

    read_selector!(cs, "cs");
    read_selector!(ds, "ds");
    read_selector!(es, "es");
    read_selector!(fs, "fs");
    read_selector!(gs, "gs");
    read_selector!(ss, "ss");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_flat_code_segment() {
        // 64-bit kernel code: base 0, limit 0xfffff pages, type 0xb, P, S, L, G.
        let seg = SegmentState::decode(0x10, 0x00af_9b00_0000_ffff, 0);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.limit, 0xffff_ffff);
        assert_eq!(seg.access_rights, 0xa09b);
    }

    #[test]
    fn decode_tss_uses_upper_half() {
        // Busy 64-bit TSS at 0xffff_8880_1234_5000, limit 0x67.
        let lo = 0x1200_8b34_5000_0067u64;
        let seg = SegmentState::decode(0x40, lo, 0xffff_8880);
        assert_eq!(seg.base, 0xffff_8880_1234_5000);
        assert_eq!(seg.limit, 0x67);
        assert_eq!(seg.access_rights & 0xf, 0xb);
    }

    #[test]
    fn null_selector_is_unusable() {
        assert_eq!(SegmentState::decode(0, 0xffff_ffff, 0), SegmentState::UNUSABLE);
        assert_eq!(SegmentState::decode(3, 0, 0).access_rights, 0x10000);
    }
}
