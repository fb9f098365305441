//! Global and Interrupt Descriptor Table registers.

use core::arch::asm;

/// X86_64's system table register, as stored by `sgdt`/`sidt`.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct SystemTableRegister {
    pub limit: u16,
    pub base: u64,
}

impl SystemTableRegister {
    /// Store the current GDTR.
    #[inline]
    pub fn gdtr() -> Self {
        let mut reg = Self::default();
        unsafe {
            asm!("sgdt [{}]", in(reg) &mut reg, options(nostack));
        }
        reg
    }

    /// Store the current IDTR.
    #[inline]
    pub fn idtr() -> Self {
        let mut reg = Self::default();
        unsafe {
            asm!("sidt [{}]", in(reg) &mut reg, options(nostack));
        }
        reg
    }

    /// Load this value into the GDTR.
    ///
    /// # Safety
    /// The table must stay valid while loaded.
    #[inline]
    pub unsafe fn load_gdt(&self) {
        asm!("lgdt [{}]", in(reg) self, options(nostack));
    }

    /// Load this value into the IDTR.
    ///
    /// # Safety
    /// The table must stay valid while loaded.
    #[inline]
    pub unsafe fn load_idt(&self) {
        asm!("lidt [{}]", in(reg) self, options(nostack));
    }
}

/// Selector of the current task register.
#[inline]
pub fn task_register() -> u16 {
    let tr: u16;
    unsafe {
        asm!("str {:x}", out(reg) tr, options(nomem, nostack));
    }
    tr
}

/// Load the task register.
///
/// # Safety
/// The descriptor must be an available 64-bit TSS.
#[inline]
pub unsafe fn load_task_register(selector: u16) {
    asm!("ltr {:x}", in(reg) selector, options(nostack));
}
