//! Interface to play with vmexits.
//!
//! Each exit reason is owned by one [`VmexitController`]. Controllers are
//! chained with tuples; the first one that claims the reason handles it and
//! the rest are not consulted.
pub mod apic_access;
pub mod cpuid;
pub mod cr;
pub mod hypercall;
pub mod msr;
pub mod timer;
pub mod xsetbv;

use crate::{
    apic::ApicEmulation,
    hw::VmxHardware,
    hypercall::CellManager,
    vcpu::{GeneralPurposeRegisters, GenericVCpuState, VCpu, VmexitResult},
    vm_control::VmcsEntryCtl,
    vmcs::{ActiveVmcs, BasicExitReason, ExitReason, Field},
    VmError,
};
use abyss::{print, println};

/// Services outside of the core an exit may need.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    /// Interrupt controller emulation.
    pub apic: &'a dyn ApicEmulation,
    /// Cell lifecycle manager behind the hypercalls.
    pub cells: &'a dyn CellManager,
}

/// Controller that defines action on vmexit.
pub trait VmexitController {
    /// Handle the vmexit on this controller.
    ///
    /// Returns [`VmError::HandleVmexitFailed`] when failed to handle vmexit on this controller.
    fn handle<H: VmxHardware>(
        &mut self,
        reason: ExitReason,
        services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError>;
}

impl VmexitController for () {
    fn handle<H: VmxHardware>(
        &mut self,
        reason: ExitReason,
        _services: &Services,
        _generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        Err(VmError::HandleVmexitFailed(reason))
    }
}

impl<A: VmexitController, B: VmexitController> VmexitController for (A, B) {
    fn handle<H: VmxHardware>(
        &mut self,
        reason: ExitReason,
        services: &Services,
        generic_vcpu_state: &mut GenericVCpuState<H>,
    ) -> Result<VmexitResult, VmError> {
        let (a, b) = self;
        match a.handle(reason, services, generic_vcpu_state) {
            Err(VmError::HandleVmexitFailed(reason)) => b.handle(reason, services, generic_vcpu_state),
            r => r,
        }
    }
}

/// Controllers of a cell processor, in dispatch order.
pub type CellControllers = (
    timer::Controller,
    (
        cpuid::Controller,
        (
            hypercall::Controller,
            (
                cr::Controller,
                (msr::Controller, (apic_access::Controller, (xsetbv::Controller, ()))),
            ),
        ),
    ),
);

/// Build the controller chain of a cell processor.
pub fn cell_controllers() -> CellControllers {
    (
        timer::Controller::new(),
        (
            cpuid::Controller::new(),
            (
                hypercall::Controller::new(),
                (
                    cr::Controller::new(),
                    (
                        msr::Controller::new(),
                        (apic_access::Controller::new(), (xsetbv::Controller::new(), ())),
                    ),
                ),
            ),
        ),
    )
}

impl<H: VmxHardware> VCpu<H> {
    /// Handle the pending vmexit with the cell controllers.
    ///
    /// Called by the exit stub with the guest registers it saved. An error
    /// means the processor must be stopped; the guest registers were dumped
    /// already.
    pub fn handle_exit(
        &mut self,
        gprs: &mut GeneralPurposeRegisters,
        services: &Services,
    ) -> Result<VmexitResult, VmError> {
        self.dispatch_exit(&mut cell_controllers(), gprs, services)
    }

    /// Handle the pending vmexit with `controllers`.
    pub fn dispatch_exit<C: VmexitController>(
        &mut self,
        controllers: &mut C,
        gprs: &mut GeneralPurposeRegisters,
        services: &Services,
    ) -> Result<VmexitResult, VmError> {
        let reason = self.vmcs().exit_reason()?;
        if let ExitReason::EntryFailure(code) = reason {
            println!("FATAL: VM-Entry failure, reason {}", code);
            dump_guest_regs(&self.vmcs(), gprs);
            return Err(VmError::VmEntryFailure(code));
        }

        let mut state = GenericVCpuState { vcpu: self, gprs };
        let result = match controllers.handle(reason, services, &mut state) {
            Err(VmError::HandleVmexitFailed(reason)) => {
                print!("FATAL: Unhandled VM-Exit, reason {}, ", reason.code());
                dump_vm_exit_details(&state.vcpu.vmcs(), reason);
                Err(VmError::UnhandledVmexit(reason))
            }
            r => r,
        };
        if result.is_err() {
            dump_guest_regs(&state.vcpu.vmcs(), state.gprs);
        }
        // A kick that arrived while this exit was handled is not seen by the
        // guest; trap again right after entry instead.
        if matches!(result, Ok(VmexitResult::Ok))
            && services.cells.handover_pending(self.cpu_id())
        {
            self.schedule_vmexit()?;
        }
        result
    }
}

fn dump_vm_exit_details<H: VmxHardware + ?Sized>(vmcs: &ActiveVmcs<H>, reason: ExitReason) {
    let read = |field: Field| vmcs.read(field).unwrap_or(0);
    println!("qualification {:x}", read(Field::VmexitQualification));
    println!(
        "vectoring info: {:x} interrupt info: {:x}",
        read(Field::IdtVectoringInfo),
        read(Field::VmexitInterruptionInfo)
    );
    if matches!(
        reason,
        ExitReason::BasicExitReason(BasicExitReason::EptViolation)
            | ExitReason::BasicExitReason(BasicExitReason::EptMisconfig)
    ) {
        println!(
            "guest phys addr {:#x} guest linear addr: {:#x}",
            read(Field::GuestPhysicalAddr),
            read(Field::GuestLinearAddr)
        );
    }
}

fn dump_guest_regs<H: VmxHardware + ?Sized>(vmcs: &ActiveVmcs<H>, gprs: &GeneralPurposeRegisters) {
    let read = |field: Field| vmcs.read(field).unwrap_or(0);
    println!(
        "RIP: {:#018x} RSP: {:#018x} FLAGS: {:x}",
        read(Field::GuestRip),
        read(Field::GuestRsp),
        read(Field::GuestRflags)
    );
    println!(
        "RAX: {:#018x} RBX: {:#018x} RCX: {:#018x}",
        gprs.rax, gprs.rbx, gprs.rcx
    );
    println!(
        "RDX: {:#018x} RSI: {:#018x} RDI: {:#018x}",
        gprs.rdx, gprs.rsi, gprs.rdi
    );
    println!(
        "CS: {:x} BASE: {:#018x} AR-BYTES: {:x} EFER.LMA {}",
        read(Field::GuestCsSelector),
        read(Field::GuestCsBase),
        read(Field::GuestCsAccessRights),
        (read(Field::VmentryControls) & VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64 != 0) as u8
    );
    println!(
        "CR0: {:#018x} CR3: {:#018x} CR4: {:#018x}",
        read(Field::GuestCr0),
        read(Field::GuestCr3),
        read(Field::GuestCr4)
    );
    println!("EFER: {:#018x}", read(Field::GuestIa32Efer));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        hypercall::CellManager,
        mock::{MockApic, MockVmx, TestMemory},
        vcpu::{CellVmxConfig, HostContext, VmxGlobals},
        vm_control::VmcsPinBasedVmexecCtl,
    };
    use abyss::addressing::Pa;
    use std::sync::Mutex;

    /// Cell manager that records the calls and answers with fixed results.
    pub struct MockCells {
        pub calls: Mutex<Vec<(&'static str, usize, u64)>>,
        pub result: Result<(), VmError>,
        pub config: Mutex<Option<CellVmxConfig>>,
        pub handover: Mutex<Vec<usize>>,
    }

    impl MockCells {
        pub fn new(result: Result<(), VmError>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result,
                config: Mutex::new(Some(cell())),
                handover: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<(&'static str, usize, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CellManager for MockCells {
        fn shutdown(&self, cpu: usize) -> Result<(), VmError> {
            self.calls.lock().unwrap().push(("shutdown", cpu, 0));
            self.result
        }

        fn cell_create(&self, cpu: usize, config_addr: u64) -> Result<(), VmError> {
            self.calls.lock().unwrap().push(("create", cpu, config_addr));
            self.result
        }

        fn cell_destroy(&self, cpu: usize, id: u64) -> Result<(), VmError> {
            self.calls.lock().unwrap().push(("destroy", cpu, id));
            self.result
        }

        fn vmx_config(&self, _cpu: usize) -> Option<CellVmxConfig> {
            *self.config.lock().unwrap()
        }

        fn handover_pending(&self, cpu: usize) -> bool {
            self.handover.lock().unwrap().contains(&cpu)
        }

        fn handover_done(&self, cpu: usize) {
            self.handover.lock().unwrap().retain(|c| *c != cpu);
        }
    }

    pub fn cell() -> CellVmxConfig {
        CellVmxConfig {
            io_bitmap_a: Pa::new(0x10_0000).unwrap(),
            io_bitmap_b: Pa::new(0x10_1000).unwrap(),
            eptp: 0x20_0000 | 0x1e,
        }
    }

    /// An active processor of the host cell with the guest at 0x1000.
    pub fn active_vcpu(mm: &TestMemory) -> VCpu<MockVmx> {
        let host = HostContext {
            ip: 0x1000,
            sp: 0x8000,
            ..Default::default()
        };
        let mut vcpu = VCpu::new(1, MockVmx::new(), mm, host, 0x4000).unwrap();
        vcpu.enable().unwrap();
        vcpu.configure(
            cell(),
            VmxGlobals {
                msr_bitmap: Pa::new(0x30_0000).unwrap(),
                apic_access_page: Pa::new(0x31_0000).unwrap(),
            },
        )
        .unwrap();
        vcpu.activate().unwrap();
        vcpu
    }

    /// Fake an exit with `reason` and `qualification`.
    pub fn exit(vcpu: &VCpu<MockVmx>, reason: BasicExitReason, qualification: u64) {
        vcpu.hw().set_field(Field::VmexitReason, reason as u64);
        vcpu.hw().set_field(Field::VmexitQualification, qualification);
    }

    #[test]
    fn unclaimed_reason_is_fatal() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters::default();

        exit(&vcpu, BasicExitReason::EptViolation, 0x181);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Err(VmError::UnhandledVmexit(ExitReason::BasicExitReason(
                BasicExitReason::EptViolation
            )))
        );

        vcpu.hw().set_field(Field::VmexitReason, 0x23);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Err(VmError::UnhandledVmexit(ExitReason::Unknown(0x23)))
        );
    }

    #[test]
    fn entry_failure() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters::default();
        vcpu.hw()
            .set_field(Field::VmexitReason, ExitReason::ENTRY_FAILURE as u64 | 0x21);
        assert_eq!(
            vcpu.handle_exit(&mut gprs, &services),
            Err(VmError::VmEntryFailure(0x21))
        );
    }

    #[test]
    fn pending_handover_traps_again_after_entry() {
        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let timer = VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER.bits() as u64;
        let mut gprs = GeneralPurposeRegisters::default();

        exit(&vcpu, BasicExitReason::Cpuid, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(vcpu.hw().field(Field::PinBasedExecControls).unwrap() & timer, 0);

        cells.handover.lock().unwrap().push(1);
        exit(&vcpu, BasicExitReason::Cpuid, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_ne!(vcpu.hw().field(Field::PinBasedExecControls).unwrap() & timer, 0);

        exit(&vcpu, BasicExitReason::VmxPreemptTimer, 0);
        vcpu.handle_exit(&mut gprs, &services).unwrap();
        assert_eq!(vcpu.hw().field(Field::PinBasedExecControls).unwrap() & timer, 0);
        assert!(cells.handover.lock().unwrap().is_empty());
    }

    #[test]
    fn chain_order() {
        struct Claims(BasicExitReason, usize);

        impl VmexitController for Claims {
            fn handle<H: VmxHardware>(
                &mut self,
                reason: ExitReason,
                _services: &Services,
                _generic_vcpu_state: &mut GenericVCpuState<H>,
            ) -> Result<VmexitResult, VmError> {
                if reason == ExitReason::BasicExitReason(self.0) {
                    self.1 += 1;
                    Ok(VmexitResult::Ok)
                } else {
                    Err(VmError::HandleVmexitFailed(reason))
                }
            }
        }

        let mm = TestMemory::new();
        let mut vcpu = active_vcpu(&mm);
        let apic = MockApic::new();
        let cells = MockCells::new(Ok(()));
        let services = Services {
            apic: &apic,
            cells: &cells,
        };
        let mut gprs = GeneralPurposeRegisters::default();
        let mut chain = (
            Claims(BasicExitReason::Hlt, 0),
            (Claims(BasicExitReason::Hlt, 0), (Claims(BasicExitReason::Pause, 0), ())),
        );
        exit(&vcpu, BasicExitReason::Hlt, 0);
        assert_eq!(
            vcpu.dispatch_exit(&mut chain, &mut gprs, &services),
            Ok(VmexitResult::Ok)
        );
        exit(&vcpu, BasicExitReason::Pause, 0);
        assert_eq!(
            vcpu.dispatch_exit(&mut chain, &mut gprs, &services),
            Ok(VmexitResult::Ok)
        );
        assert_eq!((chain.0 .1, (chain.1).0 .1, ((chain.1).1).0 .1), (1, 0, 1));
    }
}
