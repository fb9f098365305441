//! Cpuid vmexit controller.
//!
//! Cell code sees the processor it runs on; the instruction is executed on
//! behalf of the guest with the upper halves of the registers cleared.
use super::{Services, VmexitController};
use crate::{
    hw::VmxHardware,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};

/// Length of the cpuid instruction.
const INST_LEN_CPUID: u64 = 2;

/// Cpuid vmexit controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new cpuid controller.
    pub fn new() -> Self {
        Self {}
    }
}

impl VmexitController for Controller {
    fn handle<H: VmxHardware>(
        &mut self,
        reason: ExitReason,
        _services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        match reason {
            ExitReason::BasicExitReason(BasicExitReason::Cpuid) => {
                let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
                vcpu.vmcs().skip_instruction(INST_LEN_CPUID)?;
                let result = vcpu.hw().cpuid(gprs.rax as u32, gprs.rcx as u32);
                gprs.rax = result.eax as u64;
                gprs.rbx = result.ebx as u64;
                gprs.rcx = result.ecx as u64;
                gprs.rdx = result.edx as u64;
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::CpuidResult,
        mock::{MockApic, TestMemory},
        vcpu::GeneralPurposeRegisters,
        vmcs::Field,
        vmexits::tests::{active_vcpu, exit, MockCells},
    };

    #[test]
    fn executes_with_truncated_inputs() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        vcpu.hw().set_cpuid(
            7,
            1,
            CpuidResult {
                eax: 0xa,
                ebx: 0xb,
                ecx: 0xc,
                edx: 0xd,
            },
        );
        let mut gprs = GeneralPurposeRegisters {
            rax: 0xdead_0000_0000_0007,
            rbx: 0xffff_ffff_ffff_ffff,
            rcx: 0x1_0000_0001,
            rdx: 0xffff_0000_0000_0000,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Cpuid, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert_eq!((gprs.rax, gprs.rbx, gprs.rcx, gprs.rdx), (0xa, 0xb, 0xc, 0xd));
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1002));
    }
}
