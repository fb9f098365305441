//! Flags and MSRs for VMX capabilities.

// VMX Capalibility MSRs
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x03a;
/// MSR - IA32_VMX_BASIC
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_MISC.
pub const IA32_VMX_MISC: u32 = 0x485;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48b;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;

/// Distance from a control capability MSR to its "true" counterpart
/// (IA32_VMX_TRUE_PINBASED_CTLS and friends).
pub const VMX_TRUE_MSR_OFFSET: u32 = 0xc;

bitflags::bitflags! {
    /// IA32_FEATURE_CONTROL bits.
    pub struct FeatureControl: u64 {
        /// Further writes fault until reset.
        const LOCKED = 1 << 0;
        /// VMXON allowed inside SMX operation.
        const VMXON_INSIDE_SMX = 1 << 1;
        /// VMXON allowed outside SMX operation.
        const VMXON_OUTSIDE_SMX = 1 << 2;
    }
}

bitflags::bitflags! {
    /// IA32_VMX_BASIC fields.
    pub struct VmxBasic: u64 {
        /// VM-exit information for INS/OUTS is reported.
        const INS_OUTS_INFO = 1 << 54;
        /// The TRUE_*_CTLS capability MSRs exist.
        const TRUE_CTLS = 1 << 55;
    }
}

impl VmxBasic {
    /// Revision identifier to put at the head of VMXON and VMCS regions.
    pub fn revision_id(raw: u64) -> u32 {
        (raw & 0x7fff_ffff) as u32
    }

    /// Size of the VMXON and VMCS regions.
    pub fn region_size(raw: u64) -> usize {
        ((raw >> 32) & 0x1fff) as usize
    }

    /// Memory type the processor uses to access the VMCS.
    pub fn memory_type(raw: u64) -> u64 {
        (raw >> 50) & 0xf
    }
}

bitflags::bitflags! {
    /// Table 24-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// Non-maskable interrupts (NMIs) cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in VMX non-root operation.
        /// A VM exit occurs when the timer counts down to zero.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Table 24-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// VM exit at the beginning of any instruction if RFLAGS.IF = 1.
        const INTRWINEXIT = 1 << 2;
        /// Executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// MOV to CR3 cause VM exits.
        const CR3LOADEXIT = 1 << 15;
        /// MOV from CR3 cause VM exits.
        const CR3STOREXIT = 1 << 16;
        /// Executions of I/O instructions unconditionally cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
        /// I/O bitmaps restrict executions of I/O instructions.
        const USEIOBMP = 1 << 25;
        /// MSR bitmaps control executions of the RDMSR and WRMSR instructions.
        /// If the MSR bitmaps are not used, all executions of the RDMSR and WRMSR instructions cause VM exits.
        const USEMSRBMP = 1 << 28;
        /// The secondary processor-based VM-execution controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 24-7. Definitions of Secondary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// Accesses to the APIC-access page cause VM exits.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables (EPT) are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Executions of RDTSCP do not cause #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Guest software may run in unpaged protected mode or in real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// Executions of INVPCID do not cause #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// Executions of XSAVES or XRSTORS do not cause #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    /// Table 24-13. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on VM entry.
        const LOAD_DEBUG_CTL = 1 << 2;
        /// The logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// IA32_PAT is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Table 24-11. Definitions of VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on VM exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The processor is in 64-bit mode after the next VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// External interrupts are acknowledged on VM exit.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on VM exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on VM exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// The VMX-preemption timer value is saved on VM exit.
        const SAVE_VMX_PREEMPTION_TIMER_VALUE = 1 << 22;
    }
}

bitflags::bitflags! {
    /// IA32_VMX_EPT_VPID_CAP bits the hypervisor relies on.
    pub struct EptVpidCap: u64 {
        /// Page-walk length of 4.
        const WALK_LENGTH_4 = 1 << 6;
        /// Write-back memory type for EPT paging structures.
        const WB = 1 << 14;
        /// 2-Mbyte EPT pages.
        const PAGE_2M = 1 << 16;
        /// INVEPT instruction.
        const INVEPT = 1 << 20;
        /// Single-context INVEPT.
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        /// All-context INVEPT.
        const INVEPT_ALL_CONTEXT = 1 << 26;
    }
}

/// IA32_VMX_MISC: activity state HLT is supported.
pub const VMX_MISC_ACTIVITY_HLT: u64 = 1 << 6;

/// Combine the wanted control bits with what a capability MSR permits.
///
/// The low half of the MSR holds the bits that must be one, the high half the
/// bits that may be one.
#[inline]
pub fn adjust_controls(capability: u64, wanted: u32) -> u32 {
    ((capability as u32) | wanted) & (capability >> 32) as u32
}

/// Whether every bit in `required` may be set according to `capability`.
#[inline]
pub fn controls_supported(capability: u64, required: u32) -> bool {
    (capability >> 32) as u32 & required == required
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_adjustment_respects_both_halves() {
        let cap = (0x0000_00ffu64 << 32) | 0x16;
        assert_eq!(adjust_controls(cap, 0x1 | 0x100), 0x17);
        assert!(controls_supported(cap, 0x48));
        assert!(!controls_supported(cap, 0x148));
    }

    #[test]
    fn basic_decoding() {
        let basic = 0x00da_0400_0000_0004u64;
        assert_eq!(VmxBasic::revision_id(basic), 4);
        assert_eq!(VmxBasic::region_size(basic), 0x400);
        assert_eq!(VmxBasic::memory_type(basic), 6);
        assert!(VmxBasic::from_bits_truncate(basic).contains(VmxBasic::TRUE_CTLS));
    }
}
