//! Msr vmexit controller.
//!
//! The msr bitmap lets every access through except for the x2APIC registers
//! the interrupt controller emulation owns. Anything else that traps is a
//! configuration error.
use super::{Services, VmexitController};
use crate::{
    apic::{is_x2apic_msr, MSR_X2APIC_ICR},
    hw::VmxHardware,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use abyss::println;

/// Length of the rdmsr and wrmsr instructions.
const INST_LEN_MSR: u64 = 2;

/// Msr vmexit controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new msr controller.
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
        let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
        let cpu = vcpu.cpu_id();
        match reason {
            ExitReason::BasicExitReason(BasicExitReason::Rdmsr) => {
                vcpu.vmcs().skip_instruction(INST_LEN_MSR)?;
                let index = gprs.rcx as u32;
                if is_x2apic_msr(index) {
                    services.apic.x2apic_read(cpu, gprs);
                    return Ok(VmexitResult::Ok);
                }
                println!("FATAL: Unhandled MSR read: {:08x}", gprs.rcx);
                Err(VmError::UnhandledMsr { index, write: false })
            }
            ExitReason::BasicExitReason(BasicExitReason::Wrmsr) => {
                vcpu.vmcs().skip_instruction(INST_LEN_MSR)?;
                let index = gprs.rcx as u32;
                if index == MSR_X2APIC_ICR {
                    services.apic.icr_write(cpu, gprs.rax as u32, gprs.rdx as u32);
                    return Ok(VmexitResult::Ok);
                }
                if is_x2apic_msr(index) {
                    services.apic.x2apic_write(cpu, gprs);
                    return Ok(VmexitResult::Ok);
                }
                println!("FATAL: Unhandled MSR write: {:08x}", gprs.rcx);
                Err(VmError::UnhandledMsr { index, write: true })
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{ApicCall, MockApic, TestMemory},
        vcpu::GeneralPurposeRegisters,
        vmcs::Field,
        vmexits::tests::{active_vcpu, exit, MockCells},
    };

    #[test]
    fn x2apic_registers_are_emulated() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rcx: 0x802,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Rdmsr, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(gprs.rax, 0x11);

        gprs.rcx = 0x808;
        gprs.rax = 0x20;
        exit(&vcpu, BasicExitReason::Wrmsr, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();

        gprs.rcx = MSR_X2APIC_ICR as u64;
        gprs.rax = 0x4500;
        gprs.rdx = 3;
        vcpu.handle_exit(&mut gprs, &services).unwrap();

        assert_eq!(
            apic.calls(),
            vec![
                ApicCall::X2apicRead(1, 0x802),
                ApicCall::X2apicWrite(1, 0x808, 0x20),
                ApicCall::Icr(1, 0x4500, 3),
            ]
        );
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1006));
    }

    #[test]
    fn other_registers_are_fatal() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rcx: 0x1b,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Rdmsr, 0);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Err(VmError::UnhandledMsr {
                index: 0x1b,
                write: false
            })
        );
        gprs.rcx = 0x840;
        exit(&vcpu, BasicExitReason::Wrmsr, 0);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Err(VmError::UnhandledMsr {
                index: 0x840,
                write: true
            })
        );
        assert!(apic.calls().is_empty());
    }
}
