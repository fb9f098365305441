//! Hardware-assisted partitioning core.
//!
//! `cellvisor` takes exclusive control of the physical processors of a machine,
//! splits the machine into statically configured partitions ("cells") and keeps
//! them apart with Intel VT-x, extended page tables and VT-d DMA remapping.
//!
//! The crate is organized bottom-up:
//!
//! - [`hw`] is the narrow hardware capability interface ([`hw::VmxHardware`])
//!   every VMX instruction goes through, and [`mm`] the page allocator service
//!   ([`mm::PageAllocator`]).
//! - [`paging`], [`ept`], [`pio`] and [`msr_bitmap`] build the per-cell views of
//!   memory, I/O ports and model specific registers.
//! - [`vtd`] is the IOMMU isolation manager.
//! - [`vcpu`], [`vmcs`] and [`vmexits`] form the per-processor virtualization
//!   controller.
//! - [`cell`] owns every cell and moves resources between the host cell and
//!   the others.
//! - [`boot`] and [`setup`] bring all processors into virtualized execution
//!   exactly once.
//!
//! The hypervisor runs without an operating system underneath. Everything
//! except [`arch`] is hardware independent and is unit tested on the build
//! host against the fakes in `mock`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod apic;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
pub mod boot;
pub mod cell;
pub mod config;
pub mod ept;
pub mod hw;
pub mod hypercall;
pub mod mm;
pub mod msr_bitmap;
pub mod paging;
pub mod pio;
pub mod poll;
pub mod setup;
pub mod vcpu;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;
pub mod vtd;

#[cfg(test)]
mod mock;

use config::PciDevice;
use paging::MappingError;
use vmcs::{ExitReason, Field, InstructionError};

/// Linux compatible error numbers reported to the hypercall caller.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
    pub const ENOSYS: i32 = 38;
}

/// Possible errors of the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The processor or the firmware lacks a required feature.
    UnsupportedHardware(&'static str),
    /// VMX operation was already enabled by someone else.
    AlreadyEnabled,
    /// IA32_FEATURE_CONTROL is locked without VMXON permission.
    LockedOut,
    /// Writing a VMCS field failed.
    ConfigurationFailed {
        field: Field,
        error: InstructionError,
    },
    /// A VMX instruction other than VMWRITE failed.
    VmxOperationError(InstructionError),
    /// VMLAUNCH was rejected by the processor.
    EntryFailed(InstructionError),
    /// Page allocation failed.
    OutOfMemory,
    /// Building an address map failed.
    Mapping(MappingError),
    /// A configuration record is malformed.
    InvalidConfig(&'static str),
    /// A processor or an argument is not part of the system.
    InvalidArgument,
    /// The cell id can not be used as a DMA remapping domain.
    DomainOutOfRange { id: u32, limit: u32 },
    /// A cell with the id already exists.
    CellExists(u32),
    /// No cell with the id.
    NoSuchCell(u32),
    /// The device is already assigned to another cell.
    DeviceBusy(PciDevice),
    /// The processor does not belong to the host cell.
    CpuBusy(usize),
    /// Cells other than the host cell still exist.
    CellsActive,
    /// DMA remapping was already enabled before the hypervisor started.
    IommuBusy,
    /// The firmware DMAR table is malformed.
    FirmwareTable(&'static str),
    /// The caller is not privileged for the operation.
    PermissionDenied,
    /// The operation is not implemented.
    NotSupported,
    /// The controller does not handle this exit. Used to chain controllers.
    HandleVmexitFailed(ExitReason),
    /// No controller handled the exit.
    UnhandledVmexit(ExitReason),
    /// VM entry failed after a VM exit had been handled.
    VmEntryFailure(u16),
    /// Unsupported control register access (exit qualification).
    UnhandledCrAccess(u64),
    /// Unsupported access to the APIC access page (exit qualification).
    UnhandledApicAccess(u64),
    /// Trapped access to a model specific register outside the x2APIC range.
    UnhandledMsr { index: u32, write: bool },
    /// XSETBV with a value the hypervisor does not allow.
    InvalidXsetbv { index: u64, value: u64 },
}

impl VmError {
    /// Positive error number of this error.
    pub fn errno(&self) -> i32 {
        match self {
            VmError::UnsupportedHardware(_) => errno::EIO,
            VmError::AlreadyEnabled
            | VmError::IommuBusy
            | VmError::DeviceBusy(_)
            | VmError::CpuBusy(_)
            | VmError::CellsActive => errno::EBUSY,
            VmError::LockedOut => errno::ENODEV,
            VmError::OutOfMemory | VmError::Mapping(MappingError::OutOfMemory) => errno::ENOMEM,
            VmError::Mapping(_) | VmError::InvalidConfig(_) | VmError::InvalidArgument => {
                errno::EINVAL
            }
            VmError::DomainOutOfRange { .. } => errno::ERANGE,
            VmError::CellExists(_) => errno::EEXIST,
            VmError::NoSuchCell(_) => errno::ENOENT,
            VmError::PermissionDenied => errno::EPERM,
            VmError::NotSupported => errno::ENOSYS,
            _ => errno::EIO,
        }
    }

    /// Whether the error means the isolation state of the processor can no
    /// longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::EntryFailed(_)
                | VmError::UnhandledVmexit(_)
                | VmError::VmEntryFailure(_)
                | VmError::UnhandledCrAccess(_)
                | VmError::UnhandledApicAccess(_)
                | VmError::UnhandledMsr { .. }
                | VmError::InvalidXsetbv { .. }
        )
    }
}

impl From<MappingError> for VmError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::OutOfMemory => VmError::OutOfMemory,
            e => VmError::Mapping(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VmError::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(VmError::CellExists(3).errno(), errno::EEXIST);
        assert_eq!(
            VmError::DomainOutOfRange { id: 300, limit: 256 }.errno(),
            errno::ERANGE
        );
        assert_eq!(VmError::LockedOut.errno(), errno::ENODEV);
        assert_eq!(VmError::AlreadyEnabled.errno(), errno::EBUSY);
        assert_eq!(VmError::UnsupportedHardware("ept").errno(), errno::EIO);
        assert_eq!(VmError::from(MappingError::OutOfMemory), VmError::OutOfMemory);
        assert_eq!(
            VmError::from(MappingError::Unaligned).errno(),
            errno::EINVAL
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(VmError::UnhandledCrAccess(0x13).is_fatal());
        assert!(VmError::EntryFailed(InstructionError::InvalidHostState).is_fatal());
        assert!(!VmError::OutOfMemory.is_fatal());
        assert!(!VmError::PermissionDenied.is_fatal());
    }
}
