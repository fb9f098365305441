//! APIC access page controller.
//!
//! Linear reads and writes of the memory-mapped local APIC are decoded by the
//! interrupt controller emulation, which also reports how long the faulting
//! instruction was.
use super::{Services, VmexitController};
use crate::{
    hw::VmxHardware,
    vcpu::{page_table_base, GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason, Field},
    VmError,
};
use abyss::println;

const ACCESS_TYPE_MASK: u64 = 0xf000;
const ACCESS_LINEAR_READ: u64 = 0x0000;
const ACCESS_LINEAR_WRITE: u64 = 0x1000;
const ACCESS_OFFSET_MASK: u64 = 0xfff;

/// APIC access page controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new APIC access controller.
    pub fn new() -> Self {
        Self {}
    }
}

impl VmexitController for Controller {
    fn handle<H: VmxHardware>(
        &mut self,
        reason: ExitReason,
        services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        match reason {
            ExitReason::BasicExitReason(BasicExitReason::ApicAccess) => {
                let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
                let cpu = vcpu.cpu_id();
                let vmcs = vcpu.vmcs();
                let qualification = vmcs.read(Field::VmexitQualification)?;
                let offset = qualification & ACCESS_OFFSET_MASK;

                let access = qualification & ACCESS_TYPE_MASK;
                if (access == ACCESS_LINEAR_READ || access == ACCESS_LINEAR_WRITE)
                    && offset & 0xf == 0
                {
                    let len = services.apic.mmio_access(
                        gprs,
                        cpu,
                        vmcs.read(Field::GuestRip)?,
                        page_table_base(vmcs.read(Field::GuestCr3)?),
                        (offset >> 4) as u32,
                        access == ACCESS_LINEAR_WRITE,
                    );
                    return match len {
                        Some(len) if len > 0 => {
                            vmcs.skip_instruction(len as u64)?;
                            Ok(VmexitResult::Ok)
                        }
                        _ => Err(VmError::UnhandledApicAccess(qualification)),
                    };
                }
                println!(
                    "FATAL: Unhandled APIC access, qualification {:x}",
                    qualification
                );
                Err(VmError::UnhandledApicAccess(qualification))
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}
