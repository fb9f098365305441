//! Virtual-Machine Control State (VMCS) related apis.
//!
//! The processor keeps one VMCS current per logical CPU. [`ActiveVmcs`] is the
//! typed key→value view of that current VMCS; every access goes through the
//! [`VmxHardware`] layer so the control logic can be exercised against a mock.
use crate::{hw::VmxHardware, mm::PageAllocator, vcpu::SegmentState, VmError};
use abyss::addressing::{Pa, Va};
use num_enum::{FromPrimitive, TryFromPrimitive};

/// A VMXON region or a VMCS region.
///
/// Both share the header layout of Intel® 64 and IA-32 Architectures Software
/// Developer’s Manual, 24.2 FORMAT OF THE VMCS REGION: a revision identifier
/// followed by the VMX-abort indicator; the rest is implementation specific.
pub struct VmxRegion {
    pa: Pa,
    va: Va,
}

impl VmxRegion {
    /// Allocate a zeroed region.
    pub fn new<M: PageAllocator + ?Sized>(mm: &M) -> Result<Self, VmError> {
        let pa = mm.alloc_pages(1).ok_or(VmError::OutOfMemory)?;
        Ok(Self {
            pa,
            va: mm.phys_to_virt(pa),
        })
    }

    /// Physical address handed to VMXON, VMCLEAR and VMPTRLD.
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Stamp the revision identifier reported by IA32_VMX_BASIC.
    pub fn set_revision_id(&self, rev_id: u32) {
        let header = self.va.as_mut_ptr::<u32>();
        unsafe {
            // Bit 31 is the shadow-VMCS indicator and must be clear.
            header.write_volatile(rev_id & 0x7fff_ffff);
            header.add(1).write_volatile(0);
        }
    }

    /// Return the region to the allocator.
    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        mm.free_pages(self.pa, 1);
    }
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, FromPrimitive)]
#[repr(u32)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidControlField = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs = 16,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs = 18,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs = 25,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
    /// VMfailInvalid: there is no current VMCS to hold an error number.
    VmFailInvalid = 0x1_0000,
    /// Unknown error.
    #[num_enum(default)]
    Unknown = 0xffff_ffff,
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    // 16-bit fields
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080A,
    GuestLdtrSelector = 0x080C,
    GuestTrSelector = 0x080E,
    HostEsSelector = 0x0C00,
    HostCsSelector = 0x0C02,
    HostSsSelector = 0x0C04,
    HostDsSelector = 0x0C06,
    HostFsSelector = 0x0C08,
    HostGsSelector = 0x0C0A,
    HostTrSelector = 0x0C0C,

    // 64-bit fields
    IoBitmapA = 0x2000,
    IoBitmapB = 0x2002,
    MsrBitmaps = 0x2004,
    VmexitMsrStoreAddr = 0x2006,
    VmexitMsrLoadAddr = 0x2008,
    VmentryMsrLoadAddr = 0x200A,
    TscOffset = 0x2010,
    ApicAccessAddr = 0x2014,
    Eptptr = 0x201A,
    GuestPhysicalAddr = 0x2400,
    GuestLinkPointer = 0x2800,
    GuestIa32Debugctl = 0x2802,
    GuestIa32Pat = 0x2804,
    GuestIa32Efer = 0x2806,
    HostIa32Pat = 0x2C00,
    HostIa32Efer = 0x2C02,

    // 32-bit fields
    PinBasedExecControls = 0x4000,
    ProcessorBasedVmexecControls = 0x4002,
    ExceptionBitmap = 0x4004,
    PageFaultErrCodeMask = 0x4006,
    PageFaultErrCodeMatch = 0x4008,
    Cr3TargetCount = 0x400A,
    VmexitControls = 0x400C,
    VmexitMsrStoreCount = 0x400E,
    VmexitMsrLoadCount = 0x4010,
    VmentryControls = 0x4012,
    VmentryMsrLoadCount = 0x4014,
    VmentryInterruptionInfo = 0x4016,
    VmentryExceptionErrCode = 0x4018,
    VmentryInstructionLength = 0x401A,
    SecondaryVmexecControls = 0x401E,
    InstructionError = 0x4400,
    VmexitReason = 0x4402,
    VmexitInterruptionInfo = 0x4404,
    VmexitInterruptionErrCode = 0x4406,
    IdtVectoringInfo = 0x4408,
    IdtVectoringErrCode = 0x440A,
    VmexitInstructionLength = 0x440C,
    VmexitInstructionInfo = 0x440E,
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480A,
    GuestLdtrLimit = 0x480C,
    GuestTrLimit = 0x480E,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsAccessRights = 0x4814,
    GuestCsAccessRights = 0x4816,
    GuestSsAccessRights = 0x4818,
    GuestDsAccessRights = 0x481A,
    GuestFsAccessRights = 0x481C,
    GuestGsAccessRights = 0x481E,
    GuestLdtrAccessRights = 0x4820,
    GuestTrAccessRights = 0x4822,
    GuestInterruptibilityState = 0x4824,
    GuestActivityState = 0x4826,
    GuestIa32SysenterCsMsr = 0x482A,
    GuestPreemptionTimerValue = 0x482E,
    HostIa32SysenterCsMsr = 0x4C00,

    // Natural-width fields
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    VmexitQualification = 0x6400,
    GuestLinearAddr = 0x640A,
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680A,
    GuestDsBase = 0x680C,
    GuestFsBase = 0x680E,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681A,
    GuestRsp = 0x681C,
    GuestRip = 0x681E,
    GuestRflags = 0x6820,
    GuestPendingDbgExceptions = 0x6822,
    GuestIa32SysenterEspMsr = 0x6824,
    GuestIa32SysenterEipMsr = 0x6826,
    HostCr0 = 0x6C00,
    HostCr3 = 0x6C02,
    HostCr4 = 0x6C04,
    HostFsBase = 0x6C06,
    HostGsBase = 0x6C08,
    HostTrBase = 0x6C0A,
    HostGdtrBase = 0x6C0C,
    HostIdtrBase = 0x6C0E,
    HostIa32SysenterEspMsr = 0x6C10,
    HostIa32SysenterEipMsr = 0x6C12,
    HostRsp = 0x6C14,
    HostRip = 0x6C16,
}

/// Segment registers of the guest-state area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestSegment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl GuestSegment {
    /// Selector, base, limit and access-rights fields of the segment.
    pub fn fields(self) -> [Field; 4] {
        match self {
            GuestSegment::Es => [
                Field::GuestEsSelector,
                Field::GuestEsBase,
                Field::GuestEsLimit,
                Field::GuestEsAccessRights,
            ],
            GuestSegment::Cs => [
                Field::GuestCsSelector,
                Field::GuestCsBase,
                Field::GuestCsLimit,
                Field::GuestCsAccessRights,
            ],
            GuestSegment::Ss => [
                Field::GuestSsSelector,
                Field::GuestSsBase,
                Field::GuestSsLimit,
                Field::GuestSsAccessRights,
            ],
            GuestSegment::Ds => [
                Field::GuestDsSelector,
                Field::GuestDsBase,
                Field::GuestDsLimit,
                Field::GuestDsAccessRights,
            ],
            GuestSegment::Fs => [
                Field::GuestFsSelector,
                Field::GuestFsBase,
                Field::GuestFsLimit,
                Field::GuestFsAccessRights,
            ],
            GuestSegment::Gs => [
                Field::GuestGsSelector,
                Field::GuestGsBase,
                Field::GuestGsLimit,
                Field::GuestGsAccessRights,
            ],
            GuestSegment::Ldtr => [
                Field::GuestLdtrSelector,
                Field::GuestLdtrBase,
                Field::GuestLdtrLimit,
                Field::GuestLdtrAccessRights,
            ],
            GuestSegment::Tr => [
                Field::GuestTrSelector,
                Field::GuestTrBase,
                Field::GuestTrLimit,
                Field::GuestTrAccessRights,
            ],
        }
    }
}

/// A representation of active vmcs.
///
/// Holding one means VMPTRLD succeeded on this processor.
pub struct ActiveVmcs<'a, H: VmxHardware + ?Sized> {
    hw: &'a H,
}

impl<'a, H: VmxHardware + ?Sized> ActiveVmcs<'a, H> {
    /// View the VMCS that is current on the processor behind `hw`.
    pub fn new(hw: &'a H) -> Self {
        Self { hw }
    }

    /// Write to the vmcs field of the activated vmcs.
    ///
    /// A failure names the field and the reason the processor reported.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.hw
            .vmwrite(field, v)
            .map_err(|error| VmError::ConfigurationFailed { field, error })
    }

    /// Read from the vmcs field of the activated vmcs.
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.hw.vmread(field).map_err(VmError::VmxOperationError)
    }

    /// Read-modify-write a field.
    pub fn update(&self, field: Field, f: impl FnOnce(u64) -> u64) -> Result<(), VmError> {
        self.write(field, f(self.read(field)?))
    }

    /// Load a whole guest segment register.
    pub fn write_segment(&self, seg: GuestSegment, state: &SegmentState) -> Result<(), VmError> {
        let [selector, base, limit, access_rights] = seg.fields();
        self.write(selector, state.selector as u64)?;
        self.write(base, state.base)?;
        self.write(limit, state.limit as u64)?;
        self.write(access_rights, state.access_rights as u64)
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        self.read(Field::VmexitReason)
            .map(|raw| ExitReason::from_raw(raw as u32))
    }

    /// Advance the guest past an instruction of `len` bytes.
    pub fn skip_instruction(&self, len: u64) -> Result<(), VmError> {
        self.update(Field::GuestRip, |rip| rip.wrapping_add(len))
    }

    /// Forward to the next instruction.
    pub fn forward_rip(&self) -> Result<(), VmError> {
        let len = self.read(Field::VmexitInstructionLength)?;
        self.skip_instruction(len)
    }
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0x0,
    ExternalInt = 0x1,
    TripleFault = 0x2,
    InitSignal = 0x3,
    StartupIpi = 0x4,
    IoSmi = 0x5,
    OtherSmi = 0x6,
    InterruptWindow = 0x7,
    NmiWindow = 0x8,
    TaskSwitch = 0x9,
    Cpuid = 0xa,
    Getsec = 0xb,
    Hlt = 0xc,
    Invd = 0xd,
    Invlpg = 0xe,
    Rdpmc = 0xf,
    Rdtsc = 0x10,
    Rsm = 0x11,
    Vmcall = 0x12,
    Vmclear = 0x13,
    Vmlaunch = 0x14,
    Vmptrld = 0x15,
    Vmptrst = 0x16,
    Vmread = 0x17,
    Vmresume = 0x18,
    Vmwrite = 0x19,
    Vmxoff = 0x1a,
    Vmxon = 0x1b,
    MovCr = 0x1c,
    MovDr = 0x1d,
    IoInstruction = 0x1e,
    Rdmsr = 0x1f,
    Wrmsr = 0x20,
    EntfailGuestState = 0x21,
    EntfailMsrLoading = 0x22,
    Mwait = 0x24,
    Mtf = 0x25,
    Monitor = 0x27,
    Pause = 0x28,
    EntfailMachineChk = 0x29,
    TprBelowThreshold = 0x2b,
    ApicAccess = 0x2c,
    AccessGdtrOrIdtr = 0x2e,
    AccessLdtrOrTr = 0x2f,
    EptViolation = 0x30,
    EptMisconfig = 0x31,
    Invept = 0x32,
    Rdtscp = 0x33,
    VmxPreemptTimer = 0x34,
    Invvpid = 0x35,
    Wbinvd = 0x36,
    Xsetbv = 0x37,
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(u16),
    /// A basic reason this hypervisor does not know.
    Unknown(u16),
}

impl ExitReason {
    /// Bit 31 of the exit reason field: VM-entry failure.
    pub const ENTRY_FAILURE: u32 = 1 << 31;

    /// Decode the raw exit reason field.
    pub fn from_raw(raw: u32) -> Self {
        let basic = raw as u16;
        if raw & Self::ENTRY_FAILURE != 0 {
            ExitReason::EntryFailure(basic)
        } else {
            BasicExitReason::try_from(basic)
                .map(ExitReason::BasicExitReason)
                .unwrap_or(ExitReason::Unknown(basic))
        }
    }

    /// Basic exit reason number.
    pub fn code(&self) -> u16 {
        match self {
            ExitReason::BasicExitReason(r) => *r as u16,
            ExitReason::EntryFailure(c) | ExitReason::Unknown(c) => *c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockVmx, TestMemory};

    #[test]
    fn exit_reason_decoding() {
        assert_eq!(
            ExitReason::from_raw(0x12),
            ExitReason::BasicExitReason(BasicExitReason::Vmcall)
        );
        assert_eq!(
            ExitReason::from_raw(0x8000_0021),
            ExitReason::EntryFailure(0x21)
        );
        assert_eq!(ExitReason::from_raw(0x23), ExitReason::Unknown(0x23));
        assert_eq!(ExitReason::from_raw(0x34).code(), 0x34);
    }

    #[test]
    fn instruction_error_numbers() {
        assert_eq!(InstructionError::from(8), InstructionError::InvalidHostState);
        assert_eq!(InstructionError::from(14), InstructionError::Unknown);
        assert_eq!(InstructionError::from(28), InstructionError::InvalidOperandToInveptInvvpid);
    }

    #[test]
    fn failing_write_names_the_field() {
        let hw = MockVmx::new();
        hw.fail_vmwrite(Field::HostRip, InstructionError::UnsupportedVmcsField);
        let vmcs = ActiveVmcs::new(&hw);
        assert!(vmcs.write(Field::GuestRip, 1).is_ok());
        assert_eq!(
            vmcs.write(Field::HostRip, 1),
            Err(VmError::ConfigurationFailed {
                field: Field::HostRip,
                error: InstructionError::UnsupportedVmcsField
            })
        );
    }

    #[test]
    fn forward_rip_uses_instruction_length() {
        let hw = MockVmx::new();
        let vmcs = ActiveVmcs::new(&hw);
        vmcs.write(Field::GuestRip, 0x1000).unwrap();
        hw.set_field(Field::VmexitInstructionLength, 3);
        vmcs.forward_rip().unwrap();
        assert_eq!(vmcs.read(Field::GuestRip), Ok(0x1003));
    }

    #[test]
    fn region_header() {
        let mm = TestMemory::new();
        let region = VmxRegion::new(&mm).unwrap();
        region.set_revision_id(0x8000_0004);
        let words = mm.phys_to_virt(region.pa()).as_ptr::<u32>();
        assert_eq!(unsafe { (*words, *words.add(1)) }, (4, 0));
        region.release(&mm);
        assert_eq!(mm.outstanding(), 0);
    }
}
