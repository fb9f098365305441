//! Preemption timer and NMI controller.
//!
//! Both exits are kicks: another processor or the interrupt controller
//! emulation wants this processor to look at its pending events. A processor
//! that has been handed to another cell meanwhile switches to the new cell's
//! tables at once and halts until it receives a startup request there.
use super::{Services, VmexitController};
use crate::{
    hw::VmxHardware,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use abyss::println;

/// Preemption timer and NMI controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new timer controller.
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
            ExitReason::BasicExitReason(BasicExitReason::ExceptionOrNmi) => {
                // Only NMIs are intercepted; hand it to the host.
                generic_vcpu_state.vcpu.hw().raise_nmi();
                self.handle_events(services, generic_vcpu_state)
            }
            ExitReason::BasicExitReason(BasicExitReason::VmxPreemptTimer) => {
                self.handle_events(services, generic_vcpu_state)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

impl Controller {
    fn handle_events<H: VmxHardware>(
        &mut self,
        services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
        let cpu = vcpu.cpu_id();
        vcpu.disable_preemption_timer()?;

        if let Some(config) = services.cells.vmx_config(cpu) {
            if vcpu.cell() != Some(config) {
                vcpu.set_cell(config)?;
                vcpu.park()?;
            }
        }
        services.cells.handover_done(cpu);

        if let Some(vector) = services.apic.handle_events(cpu) {
            println!("CPU {} received SIPI, vector {:x?}", cpu, vector);
            vcpu.reset(vector, gprs)?;
        }
        Ok(VmexitResult::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apic::StartupVector,
        hw::InveptKind,
        mock::{Event, MockApic, TestMemory},
        vcpu::{CellVmxConfig, GeneralPurposeRegisters},
        vm_control::VmcsPinBasedVmexecCtl,
        vmexits::tests::{active_vcpu, exit, MockCells},
        vmcs::Field,
    };
    use abyss::addressing::Pa;

    const TIMER: u64 = VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER.bits() as u64;

    #[test]
    fn timer_without_events() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: 5,
            ..Default::default()
        };
        vcpu.schedule_vmexit().unwrap();
        exit(&vcpu, BasicExitReason::VmxPreemptTimer, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert_eq!(vcpu.hw().field(Field::PinBasedExecControls).unwrap() & TIMER, 0);
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0x1000));
        assert_eq!(gprs.rax, 5);
    }

    #[test]
    fn nmi_is_forwarded_then_sipi_resets() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters {
            rax: 5,
            ..Default::default()
        };
        apic.post_startup(1, StartupVector::Sipi(0x9a));
        exit(&vcpu, BasicExitReason::ExceptionOrNmi, 0);
        assert_eq!(vcpu.handle_exit(&mut gprs, &services), Ok(VmexitResult::Ok));
        assert!(vcpu.hw().events().contains(&Event::Nmi));
        assert_eq!(vcpu.hw().field(Field::GuestCsSelector), Some(0x9a00));
        assert_eq!(vcpu.hw().field(Field::GuestRip), Some(0));
        assert_eq!(gprs, GeneralPurposeRegisters::default());
    }

    #[test]
    fn handover_parks_until_startup() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let moved = CellVmxConfig {
            io_bitmap_a: Pa::new(0x40_0000).unwrap(),
            io_bitmap_b: Pa::new(0x40_1000).unwrap(),
            eptp: 0x50_0000 | 0x1e,
        };
        *cells.config.lock().unwrap() = Some(moved);
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters::default();

        cells.handover.lock().unwrap().push(1);
        assert_ne!(vcpu.hw().field(Field::Eptptr), Some(moved.eptp));

        exit(&vcpu, BasicExitReason::VmxPreemptTimer, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(vcpu.cell(), Some(moved));
        assert_eq!(vcpu.hw().field(Field::GuestActivityState), Some(1));
        // A wakeup of the halted guest already runs on the new cell.
        let hw = vcpu.hw();
        assert_eq!(hw.field(Field::Eptptr), Some(moved.eptp));
        assert_eq!(hw.field(Field::IoBitmapA), Some(0x40_0000));
        assert_eq!(hw.field(Field::IoBitmapB), Some(0x40_1000));
        assert!(hw
            .events()
            .contains(&Event::Invept(InveptKind::SingleContext, moved.eptp)));
        assert!(cells.handover.lock().unwrap().is_empty());

        apic.post_startup(1, StartupVector::Sipi(0x10));
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(vcpu.hw().field(Field::Eptptr), Some(moved.eptp));
        assert_eq!(vcpu.hw().field(Field::GuestActivityState), Some(0));
    }
}
