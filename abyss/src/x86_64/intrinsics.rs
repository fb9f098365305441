//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/core/arch/x86_64/index.html
use core::arch::asm;

pub use core::arch::x86_64::CpuidResult;

/// Execute cpuid with the given leaf and subleaf.
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) }
}

/// Initial APIC id of this core.
pub fn apic_id() -> usize {
    (cpuid(1, 0).ebx >> 24) as usize
}

/// read current cr3.
#[inline]
pub fn read_cr3() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Switch the address space.
///
/// # Safety
/// The new page table must map the running code and stack.
#[inline]
pub unsafe fn write_cr3(value: u64) {
    asm!("mov cr3, {}", in(reg) value, options(nostack));
}

/// Write an extended control register.
///
/// # Safety
/// `value` must be a state-component set supported by the processor.
#[inline]
pub unsafe fn xsetbv(index: u32, value: u64) {
    asm!(
        "xsetbv",
        in("ecx") index,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nomem, nostack)
    );
}

/// Deliver an NMI to this processor through its own handler.
///
/// # Safety
/// A valid NMI handler must be installed.
#[inline]
pub unsafe fn int_nmi() {
    asm!("int 2", options(nomem, nostack));
}

/// Write back and invalidate the cache lines covering `[addr, addr + len)`.
pub fn clflush_range(addr: usize, len: usize) {
    const CACHE_LINE: usize = 64;
    let mut line = addr & !(CACHE_LINE - 1);
    while line < addr + len {
        unsafe {
            asm!("clflush [{}]", in(reg) line, options(nostack));
        }
        line += CACHE_LINE;
    }
    unsafe {
        asm!("mfence", options(nostack));
    }
}

/// Stop this processor for good.
pub fn halt_forever() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
