//! Hypercall vmexit controller.
//!
//! Only ring 0 code of a cell may call the hypervisor. The call number is in
//! `rax`, the argument in `rdi`; the status is returned in `rax`.
use super::{Services, VmexitController};
use crate::{
    errno,
    hw::VmxHardware,
    hypercall::{self, Hypercall},
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason, Field},
    VmError,
};
use abyss::{
    println,
    x86_64::{Efer, Rflags},
};

/// Length of the vmcall instruction.
const INST_LEN_VMCALL: u64 = 3;

/// Hypercall vmexit controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new hypercall controller.
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
            ExitReason::BasicExitReason(BasicExitReason::Vmcall) => {
                self.dispatch(services, generic_vcpu_state)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

impl Controller {
    fn dispatch<H: VmxHardware>(
        &mut self,
        services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
        let cpu = vcpu.cpu_id();
        let vmcs = vcpu.vmcs();
        vmcs.skip_instruction(INST_LEN_VMCALL)?;

        let efer = Efer::from_bits_truncate(vmcs.read(Field::GuestIa32Efer)?);
        let rflags = Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?);
        if (!efer.contains(Efer::LMA) && rflags.contains(Rflags::VM))
            || vmcs.read(Field::GuestCsSelector)? & 3 != 0
        {
            gprs.rax = hypercall::status(Err(VmError::PermissionDenied));
            return Ok(VmexitResult::Ok);
        }

        match Hypercall::try_from(gprs.rax) {
            Ok(Hypercall::Disable) => {
                let result = services.cells.shutdown(cpu);
                gprs.rax = hypercall::status(result);
                if result.is_ok() {
                    vcpu.deactivate(gprs)?;
                    return Ok(VmexitResult::Deactivated);
                }
            }
            Ok(Hypercall::CellCreate) => {
                let result = services.cells.cell_create(cpu, gprs.rdi);
                gprs.rax = hypercall::status(result);
                if result.is_ok() {
                    vcpu.invept()?;
                }
            }
            Ok(Hypercall::CellDestroy) => {
                let result = services.cells.cell_destroy(cpu, gprs.rdi);
                gprs.rax = hypercall::status(result);
                if result.is_ok() {
                    vcpu.invept()?;
                }
            }
            Err(_) => {
                println!(
                    "CPU {}: Unknown vmcall {}, RIP: {:#x}",
                    cpu,
                    gprs.rax,
                    vmcs.read(Field::GuestRip)?.wrapping_sub(INST_LEN_VMCALL)
                );
                gprs.rax = -(errno::ENOSYS as i64) as u64;
            }
        }
        Ok(VmexitResult::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::InveptKind,
        mock::{Event, MockApic, TestMemory},
        vcpu::{GeneralPurposeRegisters, VmxState},
        vmexits::tests::{active_vcpu, cell, exit, MockCells},
    };

    fn neg(errno: i32) -> u64 {
        -(errno as i64) as u64
    }

    #[test]
    fn cell_management_calls() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: Hypercall::CellCreate as u64,
            rdi: 0x7000,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Vmcall, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert_eq!(gprs.rax, 0);
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1003));
        assert!(vcpu
            .hw()
            .events()
            .contains(&Event::Invept(InveptKind::SingleContext, cell().eptp)));

        gprs.rax = Hypercall::CellDestroy as u64;
        gprs.rdi = 3;
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(cells.calls(), vec![("create", 1, 0x7000), ("destroy", 1, 3)]);
    }

    #[test]
    fn failure_is_reported_to_the_caller() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Err(VmError::CellExists(2)));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: Hypercall::CellCreate as u64,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Vmcall, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert_eq!(gprs.rax, neg(errno::EEXIST));
        assert!(!vcpu
            .hw()
            .events()
            .iter()
            .any(|e| matches!(e, Event::Invept(..))));
    }

    #[test]
    fn unprivileged_and_unknown_calls() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: Hypercall::Disable as u64,
            ..Default::default()
        };
        exit(&vcpu, BasicExitReason::Vmcall, 0);
        vcpu.hw().set_field(Field::GuestCsSelector, 0x33);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(gprs.rax, neg(errno::EPERM));

        // Virtual-8086 mode outside of long mode.
        vcpu.hw().set_field(Field::GuestCsSelector, 0);
        vcpu.hw().set_field(Field::GuestIa32Efer, 0);
        vcpu.hw().set_field(Field::GuestRflags, Rflags::VM.bits() | 2);
        gprs.rax = Hypercall::Disable as u64;
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(gprs.rax, neg(errno::EPERM));
        assert!(cells.calls().is_empty());

        vcpu.hw().set_field(Field::GuestRflags, 2);
        gprs.rax = 42;
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(gprs.rax, neg(errno::ENOSYS));
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1009));
    }

    #[test]
    fn disable_leaves_vmx_operation() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: Hypercall::Disable as u64,
            rbx: 9,
            ..Default::default()
        };
        vcpu.hw().set_field(Field::GuestRsp, 0x7ff0);
        exit(&vcpu, BasicExitReason::Vmcall, 0);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Ok(VmexitResult::Deactivated)
        );
        assert_eq!(gprs.rax, 0);
        assert_eq!(vcpu.state(), VmxState::Disabled);
        assert!(vcpu.hw().events().contains(&Event::ReturnToHost {
            ip: 0x1003,
            sp: 0x7ff0,
            rbx: 9
        }));
    }

    #[test]
    fn refused_disable_keeps_running() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Err(VmError::PermissionDenied));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters::default();
        exit(&vcpu, BasicExitReason::Vmcall, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert_eq!(gprs.rax, neg(errno::EPERM));
        assert_eq!(vcpu.state(), VmxState::Active);
    }
}
