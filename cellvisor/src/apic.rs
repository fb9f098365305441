//! Boundary to the interrupt controller emulation.
//!
//! The emulation itself lives outside of the core; the trap dispatcher only
//! forwards accesses it can not let through and polls for startup requests.

use crate::vcpu::GeneralPurposeRegisters;

/// Physical base of the memory-mapped local APIC.
pub const XAPIC_BASE: u64 = 0xfee0_0000;

/// First x2APIC MSR.
pub const MSR_X2APIC_BASE: u32 = 0x800;
/// Last x2APIC MSR.
pub const MSR_X2APIC_END: u32 = 0x83f;
/// x2APIC interrupt command register.
pub const MSR_X2APIC_ICR: u32 = 0x830;

/// Whether `msr` falls in the x2APIC register range.
#[inline]
pub const fn is_x2apic_msr(msr: u32) -> bool {
    msr >= MSR_X2APIC_BASE && msr <= MSR_X2APIC_END
}

/// Startup request delivered to a parked processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupVector {
    /// INIT-SIPI-SIPI with the given vector.
    Sipi(u8),
    /// Reset of the bootstrap processor; starts at the reset vector.
    BspReset,
}

impl StartupVector {
    /// Real-mode code segment selector, its base and the instruction pointer
    /// the processor starts at.
    pub fn real_mode_entry(self) -> (u16, u64, u64) {
        let (vector, ip) = match self {
            StartupVector::Sipi(v) => (v, 0),
            StartupVector::BspReset => (0xf0, 0xfff0),
        };
        ((vector as u16) << 8, (vector as u64) << 12, ip)
    }
}

/// Interrupt controller emulation consumed by the trap dispatcher.
pub trait ApicEmulation: Sync {
    /// Poll pending events for `cpu`; returns a startup vector when the
    /// processor has to be reset.
    fn handle_events(&self, cpu: usize) -> Option<StartupVector>;

    /// Emulate a linear access to the APIC page.
    ///
    /// `page_table` is the guest's CR3, `register` the index of the 16-byte
    /// register accessed. Returns the length of the faulting instruction, or
    /// `None` when the access can not be emulated.
    fn mmio_access(
        &self,
        gprs: &mut GeneralPurposeRegisters,
        cpu: usize,
        rip: u64,
        page_table: u64,
        register: u32,
        is_write: bool,
    ) -> Option<usize>;

    /// Emulate RDMSR of an x2APIC register; the index is in `rcx`.
    fn x2apic_read(&self, cpu: usize, gprs: &mut GeneralPurposeRegisters);

    /// Emulate WRMSR of an x2APIC register other than the ICR.
    fn x2apic_write(&self, cpu: usize, gprs: &GeneralPurposeRegisters);

    /// Send an inter-processor interrupt on behalf of the guest.
    fn icr_write(&self, cpu: usize, lo: u32, hi: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_entry() {
        assert_eq!(StartupVector::Sipi(0x9a).real_mode_entry(), (0x9a00, 0x9a000, 0));
        assert_eq!(StartupVector::BspReset.real_mode_entry(), (0xf000, 0xf0000, 0xfff0));
    }

    #[test]
    fn x2apic_range() {
        assert!(is_x2apic_msr(0x800));
        assert!(is_x2apic_msr(MSR_X2APIC_ICR));
        assert!(!is_x2apic_msr(0x840));
        assert!(!is_x2apic_msr(0x1b));
    }
}
