//! Xsetbv vmexit controller.
use super::{Services, VmexitController};
use crate::{
    hw::VmxHardware,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use abyss::{println, x86_64::Xcr0};

/// Length of the xsetbv instruction.
const INST_LEN_XSETBV: u64 = 3;

/// Xsetbv vmexit controller.
///
/// The guest may only program XCR0, keep x87 state enabled and ask for
/// state components the processor supports.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new xsetbv controller.
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
            ExitReason::BasicExitReason(BasicExitReason::Xsetbv) => {
                let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
                vcpu.vmcs().skip_instruction(INST_LEN_XSETBV)?;
                let supported = vcpu.hw().cpuid(0xd, 0).eax as u64;
                if gprs.rax & Xcr0::FP.bits() != 0
                    && gprs.rax & !supported == 0
                    && gprs.rcx == 0
                    && gprs.rdx == 0
                {
                    vcpu.hw().xsetbv(0, gprs.rax);
                    return Ok(VmexitResult::Ok);
                }
                println!(
                    "FATAL: Invalid xsetbv parameters: xcr[{}] = {:08x}:{:08x}",
                    gprs.rcx, gprs.rdx, gprs.rax
                );
                Err(VmError::InvalidXsetbv {
                    index: gprs.rcx,
                    value: (gprs.rdx << 32) | (gprs.rax & 0xffff_ffff),
                })
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{Event, MockApic, TestMemory},
        vcpu::GeneralPurposeRegisters,
        vmcs::Field,
        vmexits::tests::{active_vcpu, exit, MockCells},
    };

    #[test]
    fn supported_state_is_loaded() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: (Xcr0::FP | Xcr0::SSE | Xcr0::AVX).bits(),
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Xsetbv, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert!(vcpu.hw().events().contains(&Event::Xsetbv(0, 7)));
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1003));
    }

    #[test]
    fn invalid_parameters() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        exit(&vcpu, BasicExitReason::Xsetbv, 0);
        for (rax, rcx, rdx) in [(Xcr0::SSE.bits(), 0, 0), (0x1f, 0, 0), (1, 1, 0), (1, 0, 1)] {
            let mut gprs = GeneralPurposeRegisters {
                rax,
                rcx,
                rdx,
                ..Default::default()
            };
            assert_eq!(
                vcpu.handle_exit(&mut gprs, &services),
                Err(VmError::InvalidXsetbv {
                    index: rcx,
                    value: rdx << 32 | rax
                })
            );
        }
        assert!(!vcpu
            .hw()
            .events()
            .iter()
            .any(|e| matches!(e, Event::Xsetbv(..))));
    }
}
