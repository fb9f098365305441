//! Model-specific register (MSR).

use core::arch::asm;

/// IA32_SYSENTER_CS.
pub const IA32_SYSENTER_CS: u32 = 0x174;
/// IA32_SYSENTER_ESP.
pub const IA32_SYSENTER_ESP: u32 = 0x175;
/// IA32_SYSENTER_EIP.
pub const IA32_SYSENTER_EIP: u32 = 0x176;
/// IA32_EFER.
pub const IA32_EFER: u32 = 0xc000_0080;
/// IA32_FS_BASE.
pub const IA32_FS_BASE: u32 = 0xc000_0100;
/// IA32_GS_BASE.
pub const IA32_GS_BASE: u32 = 0xc000_0101;

/// Read the msr numbered `index`.
#[inline(always)]
pub fn rdmsr(index: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") index, options(nomem, nostack));
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Write `value` to the msr numbered `index`.
///
/// # Safety
/// Writing an msr may change the processor mode arbitrarily.
#[inline(always)]
pub unsafe fn wrmsr(index: u32, value: u64) {
    asm!(
        "wrmsr",
        in("edx") (value >> 32) as u32,
        in("eax") value as u32,
        in("ecx") index,
        options(nomem, nostack)
    );
}

/// Model specific register with a fixed index.
pub struct Msr<const ADDR: u32>;

impl<const ADDR: u32> Msr<ADDR> {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> u64 {
        rdmsr(ADDR)
    }

    /// Write to the msr.
    ///
    /// # Safety
    /// Writing an msr may change the processor mode arbitrarily.
    #[inline(always)]
    pub unsafe fn write(v: u64) {
        wrmsr(ADDR, v)
    }
}
