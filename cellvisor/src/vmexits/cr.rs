//! Control register access controller.
//!
//! Only moves to CR0 and CR4 trap, and only for bits the hypervisor owns
//! through the guest/host masks.
use super::{Services, VmexitController};
use crate::{
    hw::VmxHardware,
    vcpu::{GenericVCpuState, GuestCr, VmexitResult},
    vmcs::{BasicExitReason, ExitReason, Field},
    VmError,
};
use abyss::{println, x86_64::Cr0};

/// Length of a mov to control register instruction.
const INST_LEN_MOV_TO_CR: u64 = 3;

const ACCESS_MOV_TO_CR: u64 = 0;
const REG_RSP: usize = 4;

/// Control register access controller.
#[derive(Default)]
pub struct Controller {}

impl Controller {
    /// Create a new control register controller.
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
            ExitReason::BasicExitReason(BasicExitReason::MovCr) => {
                let GenericVCpuState { vcpu, gprs } = generic_vcpu_state;
                let vmcs = vcpu.vmcs();
                let qualification = vmcs.read(Field::VmexitQualification)?;
                let cr = qualification & 0xf;
                let reg = ((qualification >> 8) & 0xf) as usize;

                let target = match cr {
                    0 => Some(GuestCr::Cr0),
                    4 => Some(GuestCr::Cr4),
                    _ => None,
                };
                match (((qualification >> 4) & 3), target) {
                    (ACCESS_MOV_TO_CR, Some(target)) => {
                        let val = if reg == REG_RSP {
                            vmcs.read(Field::GuestRsp)?
                        } else {
                            gprs.get(reg)
                        };
                        vmcs.skip_instruction(INST_LEN_MOV_TO_CR)?;
                        vcpu.set_guest_cr(target, val)?;
                        if target == GuestCr::Cr0 && Cr0::from_bits_truncate(val).contains(Cr0::PG) {
                            vcpu.update_efer()?;
                        }
                        Ok(VmexitResult::Ok)
                    }
                    _ => {
                        println!(
                            "FATAL: Unhandled CR access, qualification {:x}",
                            qualification
                        );
                        Err(VmError::UnhandledCrAccess(qualification))
                    }
                }
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}
