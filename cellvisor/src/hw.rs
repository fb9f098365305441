//! Hardware capability layer.
//!
//! Every privileged operation of the virtualization controller goes through
//! [`VmxHardware`]. The bare-metal implementation lives in `arch`; unit tests
//! drive the controller with a mock that models the VMCS as a map.

use crate::{
    vcpu::{CalleeSavedRegisters, GeneralPurposeRegisters, HostContext},
    vmcs::{Field, InstructionError},
};
use abyss::addressing::Pa;

/// Result of the CPUID instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// INVEPT invalidation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InveptKind {
    /// Invalidate mappings tagged with one EPT pointer.
    SingleContext = 1,
    /// Invalidate mappings of every EPT pointer.
    Global = 2,
}

/// Descriptor-table state of the hypervisor itself, loaded on every VM exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostTables {
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub cs_selector: u16,
    pub tr_selector: u16,
    pub tr_base: u64,
}

/// Raw hardware access needed by the virtualization controller.
///
/// Implementations operate on the logical processor they are called on.
/// VMX instructions report failure with the VM-instruction error number read
/// from the current VMCS, or [`InstructionError::VmFailInvalid`] when there is
/// none.
pub trait VmxHardware {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    fn read_msr(&self, index: u32) -> u64;
    fn write_msr(&self, index: u32, value: u64);
    fn read_cr0(&self) -> u64;
    fn read_cr3(&self) -> u64;
    fn read_cr4(&self) -> u64;
    fn write_cr4(&self, value: u64);

    /// Descriptor tables the exit handler runs with.
    fn host_tables(&self) -> HostTables;
    /// Address of the VM-exit entry stub.
    fn exit_entry(&self) -> u64;

    fn vmxon(&self, region: Pa) -> Result<(), InstructionError>;
    fn vmxoff(&self);
    fn vmclear(&self, vmcs: Pa) -> Result<(), InstructionError>;
    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError>;
    fn vmread(&self, field: Field) -> Result<u64, InstructionError>;
    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError>;
    fn invept(&self, kind: InveptKind, eptp: u64) -> Result<(), InstructionError>;

    /// Load `regs`, clear `rax` and execute VMLAUNCH.
    ///
    /// On real hardware a successful launch never comes back: the host
    /// continues inside the partition.
    fn vmlaunch(&self, regs: &CalleeSavedRegisters) -> Result<(), InstructionError>;

    fn xsetbv(&self, index: u32, value: u64);
    /// Deliver an NMI to the host, as if it had not been intercepted.
    fn raise_nmi(&self);

    /// Reload the host descriptor tables, control and model specific
    /// registers recorded in `host` after VMX operation was left.
    fn restore_host_state(&self, host: &HostContext);

    /// Resume non-virtualized execution at `host.ip` with `gprs` loaded and
    /// `rax` cleared. On real hardware this never returns.
    fn return_to_host(&self, host: &HostContext, gprs: &GeneralPurposeRegisters);
}
