//! Per-processor virtualization controller.
//!
//! Every logical processor owns one [`VCpu`]. It walks the VMX life cycle
//!
//! ```text
//! Disabled -> Enabled -> Configured -> Active (<-> exit handling) -> Disabled
//! ```
//!
//! and, once active, runs the code that was executing when the hypervisor was
//! loaded as the guest of the host cell.
use crate::{
    apic::StartupVector,
    hw::{InveptKind, VmxHardware},
    mm::PageAllocator,
    vm_control::*,
    vmcs::{ActiveVmcs, Field, GuestSegment, VmxRegion},
    VmError,
};
use abyss::{
    addressing::{Pa, PAGE_MASK, PAGE_SIZE},
    println,
    x86_64::{Cr0, Cr4, Efer},
};

pub use abyss::x86_64::segmentation::SegmentState;

/// CPUID.1:ECX.VMX
const CPUID_1_ECX_VMX: u32 = 1 << 5;
/// Write-back memory type.
pub const MEMORY_TYPE_WB: u64 = 6;
/// Guest activity states.
const ACTIVITY_ACTIVE: u64 = 0;
const ACTIVITY_HLT: u64 = 1;
/// Reserved bit 1 of RFLAGS.
const RFLAGS_RESERVED: u64 = 0x2;
const DR7_INIT: u64 = 0x400;

/// General purpose registers of the guest, in the order the exit stub
/// pushes them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// Placeholder; the guest stack pointer lives in the VMCS.
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

impl GeneralPurposeRegisters {
    /// Register by its instruction encoding (0 = rax, ..., 15 = r15).
    pub fn get(&self, index: usize) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }
}

/// Registers preserved across the call that loaded the hypervisor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalleeSavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
}

/// Base and limit of GDTR or IDTR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// State of the interrupted host, captured when the hypervisor was entered
/// and needed to resume it either as a guest or natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostContext {
    pub cr3: u64,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub cs: SegmentState,
    pub ds: SegmentState,
    pub es: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub tss: SegmentState,
    pub efer: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    /// Resume address.
    pub ip: u64,
    /// Stack pointer at the resume address.
    pub sp: u64,
    pub callee: CalleeSavedRegisters,
}

/// VMX life cycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmxState {
    Disabled,
    Enabled,
    Configured,
    Active,
}

/// What a processor needs to know about the cell it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellVmxConfig {
    pub io_bitmap_a: Pa,
    pub io_bitmap_b: Pa,
    pub eptp: u64,
}

/// Structures shared by every processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxGlobals {
    pub msr_bitmap: Pa,
    pub apic_access_page: Pa,
}

/// Control registers trapped on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCr {
    Cr0,
    Cr4,
}

/// Possible result of the Vmexit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    /// Resume the guest.
    Ok,
    /// The processor left VMX operation and must not resume the guest.
    Deactivated,
}

/// A visible state for the exit controllers.
pub struct GenericVCpuState<'a, H: VmxHardware> {
    pub vcpu: &'a mut VCpu<H>,
    /// General purpose registers saved by the exit stub.
    pub gprs: &'a mut GeneralPurposeRegisters,
}

/// Virtual cpu.
pub struct VCpu<H: VmxHardware> {
    cpu_id: usize,
    hw: H,
    vmxon: VmxRegion,
    vmcs: VmxRegion,
    /// Stack the exit handler runs on.
    stack_top: u64,
    true_msr_offset: u32,
    state: VmxState,
    host: HostContext,
    cell: Option<CellVmxConfig>,
    globals: Option<VmxGlobals>,
}

impl<H: VmxHardware> VCpu<H> {
    /// Allocate the VMXON and VMCS regions of processor `cpu_id`.
    pub fn new<M: PageAllocator + ?Sized>(
        cpu_id: usize,
        hw: H,
        mm: &M,
        host: HostContext,
        stack_top: u64,
    ) -> Result<Self, VmError> {
        let vmxon = VmxRegion::new(mm)?;
        let vmcs = match VmxRegion::new(mm) {
            Ok(vmcs) => vmcs,
            Err(e) => {
                vmxon.release(mm);
                return Err(e);
            }
        };
        Ok(Self {
            cpu_id,
            hw,
            vmxon,
            vmcs,
            stack_top,
            true_msr_offset: 0,
            state: VmxState::Disabled,
            host,
            cell: None,
            globals: None,
        })
    }

    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    #[inline]
    pub fn hw(&self) -> &H {
        &self.hw
    }

    #[inline]
    pub fn state(&self) -> VmxState {
        self.state
    }

    #[inline]
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// The current VMCS of this processor.
    #[inline]
    pub fn vmcs(&self) -> ActiveVmcs<'_, H> {
        ActiveVmcs::new(&self.hw)
    }

    /// Check the processor's VMX capabilities and enter VMX operation.
    pub fn enable(&mut self) -> Result<(), VmError> {
        let hw = &self.hw;
        if hw.cpuid(1, 0).ecx & CPUID_1_ECX_VMX == 0 {
            return Err(VmError::UnsupportedHardware("vmx"));
        }
        let cr4 = hw.read_cr4();
        if Cr4::from_bits_truncate(cr4).contains(Cr4::VMXE) {
            return Err(VmError::AlreadyEnabled);
        }

        let basic = hw.read_msr(IA32_VMX_BASIC);
        if VmxBasic::region_size(basic) > PAGE_SIZE {
            return Err(VmError::UnsupportedHardware("vmcs size"));
        }
        if VmxBasic::memory_type(basic) != MEMORY_TYPE_WB {
            return Err(VmError::UnsupportedHardware("vmcs memory type"));
        }
        self.true_msr_offset = if VmxBasic::from_bits_truncate(basic).contains(VmxBasic::TRUE_CTLS)
        {
            VMX_TRUE_MSR_OFFSET
        } else {
            0
        };

        let pin = hw.read_msr(IA32_VMX_PINBASED_CTLS + self.true_msr_offset);
        if !controls_supported(
            pin,
            (VmcsPinBasedVmexecCtl::NMI_EXITING
                | VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER)
                .bits(),
        ) {
            return Err(VmError::UnsupportedHardware("pin-based controls"));
        }
        let proc = hw.read_msr(IA32_VMX_PROC_BASED_CTLS + self.true_msr_offset);
        if !controls_supported(
            proc,
            (VmcsProcBasedVmexecCtl::USEIOBMP
                | VmcsProcBasedVmexecCtl::USEMSRBMP
                | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                .bits(),
        ) {
            return Err(VmError::UnsupportedHardware("processor-based controls"));
        }
        let proc2 = hw.read_msr(IA32_VMX_PROC_BASED_CTLS2);
        if !controls_supported(
            proc2,
            (VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZE_APIC_ACCESSES
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST)
                .bits(),
        ) {
            return Err(VmError::UnsupportedHardware("secondary controls"));
        }
        let ept = EptVpidCap::from_bits_truncate(hw.read_msr(IA32_VMX_EPT_VPID_CAP));
        if !ept.contains(EptVpidCap::WALK_LENGTH_4 | EptVpidCap::WB)
            || !ept.intersects(EptVpidCap::INVEPT_SINGLE_CONTEXT | EptVpidCap::INVEPT_ALL_CONTEXT)
        {
            return Err(VmError::UnsupportedHardware("ept"));
        }
        if hw.read_msr(IA32_VMX_MISC) & VMX_MISC_ACTIVITY_HLT == 0 {
            return Err(VmError::UnsupportedHardware("activity state hlt"));
        }

        let revision_id = VmxBasic::revision_id(basic);
        self.vmxon.set_revision_id(revision_id);
        self.vmcs.set_revision_id(revision_id);

        // TXT is assumed off.
        let feature_control = FeatureControl::from_bits_truncate(hw.read_msr(IA32_FEATURE_CONTROL));
        let mask = FeatureControl::LOCKED | FeatureControl::VMXON_OUTSIDE_SMX;
        if !feature_control.contains(mask) {
            if feature_control.contains(FeatureControl::LOCKED) {
                return Err(VmError::LockedOut);
            }
            hw.write_msr(IA32_FEATURE_CONTROL, (feature_control | mask).bits());
        }

        hw.write_cr4(cr4 | Cr4::VMXE.bits());
        if let Err(e) = hw.vmxon(self.vmxon.pa()) {
            hw.write_cr4(cr4);
            return Err(VmError::VmxOperationError(e));
        }
        self.state = VmxState::Enabled;
        Ok(())
    }

    /// Load a fresh VMCS and program it so that the captured host context
    /// continues as the guest of `cell`.
    pub fn configure(&mut self, cell: CellVmxConfig, globals: VmxGlobals) -> Result<(), VmError> {
        debug_assert_eq!(self.state, VmxState::Enabled);
        self.hw
            .vmclear(self.vmcs.pa())
            .map_err(VmError::VmxOperationError)?;
        self.hw
            .vmptrld(self.vmcs.pa())
            .map_err(VmError::VmxOperationError)?;
        self.cell = Some(cell);
        self.globals = Some(globals);
        self.setup_host_state()?;
        self.setup_guest_state()?;
        self.setup_controls(cell, globals)?;
        self.state = VmxState::Configured;
        Ok(())
    }

    fn setup_host_state(&self) -> Result<(), VmError> {
        let hw = &self.hw;
        let vmcs = self.vmcs();
        let tables = hw.host_tables();

        vmcs.write(Field::HostCr0, hw.read_cr0())?;
        vmcs.write(Field::HostCr3, hw.read_cr3())?;
        vmcs.write(Field::HostCr4, hw.read_cr4())?;

        vmcs.write(Field::HostCsSelector, tables.cs_selector as u64)?;
        vmcs.write(Field::HostDsSelector, 0)?;
        vmcs.write(Field::HostEsSelector, 0)?;
        vmcs.write(Field::HostSsSelector, 0)?;
        vmcs.write(Field::HostFsSelector, 0)?;
        vmcs.write(Field::HostGsSelector, 0)?;
        vmcs.write(Field::HostTrSelector, tables.tr_selector as u64)?;

        vmcs.write(Field::HostFsBase, 0)?;
        vmcs.write(Field::HostGsBase, 0)?;
        vmcs.write(Field::HostTrBase, tables.tr_base)?;
        vmcs.write(Field::HostGdtrBase, tables.gdtr_base)?;
        vmcs.write(Field::HostIdtrBase, tables.idtr_base)?;

        vmcs.write(Field::HostIa32Efer, (Efer::LMA | Efer::LME).bits())?;
        vmcs.write(Field::HostIa32SysenterCsMsr, 0)?;
        vmcs.write(Field::HostIa32SysenterEipMsr, 0)?;
        vmcs.write(Field::HostIa32SysenterEspMsr, 0)?;

        vmcs.write(Field::HostRsp, self.stack_top)?;
        vmcs.write(Field::HostRip, hw.exit_entry())
    }

    fn setup_guest_state(&self) -> Result<(), VmError> {
        let vmcs = self.vmcs();
        let host = &self.host;

        self.set_guest_cr(GuestCr::Cr0, self.hw.read_cr0())?;
        self.set_guest_cr(GuestCr::Cr4, self.hw.read_cr4())?;
        vmcs.write(Field::GuestCr3, host.cr3)?;

        vmcs.write_segment(GuestSegment::Cs, &host.cs)?;
        vmcs.write_segment(GuestSegment::Ds, &host.ds)?;
        vmcs.write_segment(GuestSegment::Es, &host.es)?;
        vmcs.write_segment(GuestSegment::Fs, &host.fs)?;
        vmcs.write_segment(GuestSegment::Gs, &host.gs)?;
        vmcs.write_segment(GuestSegment::Ss, &SegmentState::UNUSABLE)?;
        vmcs.write_segment(GuestSegment::Tr, &host.tss)?;
        vmcs.write_segment(GuestSegment::Ldtr, &SegmentState::UNUSABLE)?;

        vmcs.write(Field::GuestGdtrBase, host.gdtr.base)?;
        vmcs.write(Field::GuestGdtrLimit, host.gdtr.limit as u64)?;
        vmcs.write(Field::GuestIdtrBase, host.idtr.base)?;
        vmcs.write(Field::GuestIdtrLimit, host.idtr.limit as u64)?;

        vmcs.write(Field::GuestRflags, RFLAGS_RESERVED)?;
        vmcs.write(Field::GuestRsp, host.sp)?;
        vmcs.write(Field::GuestRip, host.ip)?;

        vmcs.write(Field::GuestIa32SysenterCsMsr, host.sysenter_cs)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, host.sysenter_eip)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, host.sysenter_esp)?;

        vmcs.write(Field::GuestDr7, DR7_INIT)?;
        vmcs.write(Field::GuestActivityState, ACTIVITY_ACTIVE)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        vmcs.write(Field::GuestPendingDbgExceptions, 0)?;
        vmcs.write(Field::GuestIa32Efer, host.efer)?;

        vmcs.write(Field::GuestLinkPointer, !0)?;
        vmcs.write(Field::VmentryInterruptionInfo, 0)
    }

    fn setup_controls(&self, cell: CellVmxConfig, globals: VmxGlobals) -> Result<(), VmError> {
        let hw = &self.hw;
        let vmcs = self.vmcs();
        let offset = self.true_msr_offset;

        vmcs.write(
            Field::PinBasedExecControls,
            adjust_controls(
                hw.read_msr(IA32_VMX_PINBASED_CTLS + offset),
                VmcsPinBasedVmexecCtl::NMI_EXITING.bits(),
            ) as u64,
        )?;
        vmcs.write(Field::GuestPreemptionTimerValue, 0)?;

        vmcs.write(
            Field::ProcessorBasedVmexecControls,
            adjust_controls(
                hw.read_msr(IA32_VMX_PROC_BASED_CTLS + offset),
                (VmcsProcBasedVmexecCtl::USEIOBMP
                    | VmcsProcBasedVmexecCtl::USEMSRBMP
                    | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                    .bits(),
            ) as u64,
        )?;
        vmcs.write(Field::MsrBitmaps, globals.msr_bitmap.into_u64())?;

        vmcs.write(
            Field::SecondaryVmexecControls,
            adjust_controls(
                hw.read_msr(IA32_VMX_PROC_BASED_CTLS2),
                (VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZE_APIC_ACCESSES
                    | VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                    | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST)
                    .bits(),
            ) as u64,
        )?;
        vmcs.write(Field::ApicAccessAddr, globals.apic_access_page.into_u64())?;

        self.apply_cell(cell)?;

        vmcs.write(Field::ExceptionBitmap, 0)?;
        vmcs.write(
            Field::VmexitControls,
            adjust_controls(
                hw.read_msr(IA32_VMX_EXIT_CTLS + offset),
                (VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE
                    | VmcsExitCtl::SAVE_IA32_EFER
                    | VmcsExitCtl::LOAD_IA32_EFER)
                    .bits(),
            ) as u64,
        )?;
        vmcs.write(Field::VmexitMsrStoreCount, 0)?;
        vmcs.write(Field::VmexitMsrLoadCount, 0)?;
        vmcs.write(Field::VmentryMsrLoadCount, 0)?;
        vmcs.write(
            Field::VmentryControls,
            adjust_controls(
                hw.read_msr(IA32_VMX_ENTRY_CTLS + offset),
                (VmcsEntryCtl::IA32E_MODE_GUEST | VmcsEntryCtl::LOAD_IA32_EFER).bits(),
            ) as u64,
        )?;
        vmcs.write(Field::Cr4GuestHostMask, 0)?;
        vmcs.write(Field::Cr3TargetCount, 0)
    }

    fn apply_cell(&self, cell: CellVmxConfig) -> Result<(), VmError> {
        let vmcs = self.vmcs();
        vmcs.write(Field::IoBitmapA, cell.io_bitmap_a.into_u64())?;
        vmcs.write(Field::IoBitmapB, cell.io_bitmap_b.into_u64())?;
        vmcs.write(Field::Eptptr, cell.eptp)
    }

    /// Switch to the tables of `cell`. They are in force from the next VM
    /// entry on, with no translation of an earlier cell left cached.
    pub fn set_cell(&mut self, cell: CellVmxConfig) -> Result<(), VmError> {
        self.apply_cell(cell)?;
        self.cell = Some(cell);
        self.invept()
    }

    pub fn cell(&self) -> Option<CellVmxConfig> {
        self.cell
    }

    /// Write a guest control register through the VMX fixed-bit filter.
    ///
    /// The guest reads back `val` from the shadow; the bits the processor
    /// forces are owned by the hypervisor through the guest/host mask.
    pub fn set_guest_cr(&self, cr: GuestCr, mut val: u64) -> Result<(), VmError> {
        let (fixed0_msr, fixed1_msr, real, shadow, mask) = match cr {
            GuestCr::Cr0 => (
                IA32_VMX_CR0_FIXED0,
                IA32_VMX_CR0_FIXED1,
                Field::GuestCr0,
                Field::Cr0ReadShadow,
                Field::Cr0GuestHostMask,
            ),
            GuestCr::Cr4 => (
                IA32_VMX_CR4_FIXED0,
                IA32_VMX_CR4_FIXED1,
                Field::GuestCr4,
                Field::Cr4ReadShadow,
                Field::Cr4GuestHostMask,
            ),
        };
        let fixed0 = self.hw.read_msr(fixed0_msr);
        let mut fixed1 = self.hw.read_msr(fixed1_msr);
        let mut required1 = fixed0 & fixed1;
        match cr {
            GuestCr::Cr0 => {
                fixed1 &= !(Cr0::NW | Cr0::CD).bits();
                required1 &= !(Cr0::PE | Cr0::PG).bits();
                required1 |= Cr0::ET.bits();
            }
            // Keeps the hypervisor visible.
            GuestCr::Cr4 => val |= Cr4::VMXE.bits(),
        }
        let vmcs = self.vmcs();
        vmcs.write(real, (val & fixed1) | required1)?;
        vmcs.write(shadow, val)?;
        vmcs.write(mask, required1 | !fixed1)
    }

    /// Enter IA-32e mode if the guest just enabled paging with LME set.
    pub fn update_efer(&self) -> Result<(), VmError> {
        let vmcs = self.vmcs();
        let efer = Efer::from_bits_truncate(vmcs.read(Field::GuestIa32Efer)?);
        if efer & (Efer::LME | Efer::LMA) != Efer::LME {
            return Ok(());
        }
        vmcs.write(Field::GuestIa32Efer, (efer | Efer::LMA).bits())?;
        vmcs.update(Field::VmentryControls, |v| {
            v | VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64
        })
    }

    /// Launch the guest. On success this does not return on real hardware.
    pub fn activate(&mut self) -> Result<(), VmError> {
        debug_assert_eq!(self.state, VmxState::Configured);
        self.state = VmxState::Active;
        if let Err(e) = self.hw.vmlaunch(&self.host.callee) {
            println!("FATAL: vmlaunch failed, error {}", e as u32);
            return Err(VmError::EntryFailed(e));
        }
        Ok(())
    }

    /// Leave VMX operation and reload the host's own descriptor tables and
    /// model specific registers.
    pub fn restore(&mut self) {
        if self.state == VmxState::Disabled {
            return;
        }
        self.state = VmxState::Disabled;
        let _ = self.hw.vmclear(self.vmcs.pa());
        self.hw.vmxoff();
        self.hw
            .write_cr4(self.hw.read_cr4() & !Cr4::VMXE.bits());
        self.hw.restore_host_state(&self.host);
    }

    /// Hand the processor back to non-virtualized execution, continuing where
    /// the guest left off.
    pub fn deactivate(&mut self, gprs: &GeneralPurposeRegisters) -> Result<(), VmError> {
        let vmcs = ActiveVmcs::new(&self.hw);
        let host = &mut self.host;

        host.sp = vmcs.read(Field::GuestRsp)?;
        host.ip = vmcs.read(Field::GuestRip)?;
        host.cr3 = vmcs.read(Field::GuestCr3)?;
        host.gdtr = DescriptorTable {
            base: vmcs.read(Field::GuestGdtrBase)?,
            limit: vmcs.read(Field::GuestGdtrLimit)? as u16,
        };
        host.idtr = DescriptorTable {
            base: vmcs.read(Field::GuestIdtrBase)?,
            limit: vmcs.read(Field::GuestIdtrLimit)? as u16,
        };
        host.cs.selector = vmcs.read(Field::GuestCsSelector)? as u16;
        host.tss.selector = vmcs.read(Field::GuestTrSelector)? as u16;
        host.efer = vmcs.read(Field::GuestIa32Efer)?;
        host.fs.base = vmcs.read(Field::GuestFsBase)?;
        host.gs.base = vmcs.read(Field::GuestGsBase)?;
        host.sysenter_cs = vmcs.read(Field::GuestIa32SysenterCsMsr)?;
        host.sysenter_eip = vmcs.read(Field::GuestIa32SysenterEipMsr)?;
        host.sysenter_esp = vmcs.read(Field::GuestIa32SysenterEspMsr)?;
        host.ds.selector = vmcs.read(Field::GuestDsSelector)? as u16;
        host.es.selector = vmcs.read(Field::GuestEsSelector)? as u16;
        host.fs.selector = vmcs.read(Field::GuestFsSelector)? as u16;
        host.gs.selector = vmcs.read(Field::GuestGsSelector)? as u16;

        self.restore();
        self.hw.return_to_host(&self.host, gprs);
        Ok(())
    }

    /// Reset the guest processor into real mode at `vector`.
    pub fn reset(
        &mut self,
        vector: StartupVector,
        gprs: &mut GeneralPurposeRegisters,
    ) -> Result<(), VmError> {
        self.reset_state(vector, gprs).map_err(|e| {
            println!("FATAL: CPU reset failed");
            e
        })
    }

    fn reset_state(
        &mut self,
        vector: StartupVector,
        gprs: &mut GeneralPurposeRegisters,
    ) -> Result<(), VmError> {
        let (cs_selector, cs_base, ip) = vector.real_mode_entry();
        self.set_guest_cr(GuestCr::Cr0, (Cr0::NW | Cr0::CD | Cr0::ET).bits())?;
        self.set_guest_cr(GuestCr::Cr4, 0)?;

        let vmcs = self.vmcs();
        vmcs.write(Field::GuestCr3, 0)?;
        vmcs.write(Field::GuestRflags, RFLAGS_RESERVED)?;
        vmcs.write(Field::GuestRsp, 0)?;
        vmcs.write(Field::GuestRip, ip)?;

        let real_mode = |selector: u16, base: u64, access_rights: u32| SegmentState {
            selector,
            base,
            limit: 0xffff,
            access_rights,
        };
        vmcs.write_segment(GuestSegment::Cs, &real_mode(cs_selector, cs_base, 0x9b))?;
        for seg in [
            GuestSegment::Ds,
            GuestSegment::Es,
            GuestSegment::Fs,
            GuestSegment::Gs,
            GuestSegment::Ss,
        ] {
            vmcs.write_segment(seg, &real_mode(0, 0, 0x93))?;
        }
        vmcs.write_segment(GuestSegment::Tr, &real_mode(0, 0, 0x8b))?;
        vmcs.write_segment(GuestSegment::Ldtr, &real_mode(0, 0, 0x82))?;

        vmcs.write(Field::GuestGdtrBase, 0)?;
        vmcs.write(Field::GuestGdtrLimit, 0xffff)?;
        vmcs.write(Field::GuestIdtrBase, 0)?;
        vmcs.write(Field::GuestIdtrLimit, 0xffff)?;
        vmcs.write(Field::GuestIa32Efer, 0)?;
        vmcs.write(Field::GuestIa32SysenterCsMsr, 0)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, 0)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, 0)?;
        vmcs.write(Field::GuestDr7, DR7_INIT)?;
        vmcs.write(Field::GuestActivityState, ACTIVITY_ACTIVE)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        vmcs.write(Field::GuestPendingDbgExceptions, 0)?;

        vmcs.update(Field::VmentryControls, |v| {
            v & !(VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64)
        })?;
        if let Some(cell) = self.cell {
            self.apply_cell(cell)?;
        }

        *gprs = GeneralPurposeRegisters::default();
        Ok(())
    }

    /// Force a VM exit as soon as the guest runs again.
    pub fn schedule_vmexit(&self) -> Result<(), VmError> {
        if self.state < VmxState::Configured {
            return Ok(());
        }
        self.vmcs().update(Field::PinBasedExecControls, |v| {
            v | VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER.bits() as u64
        })
    }

    pub fn disable_preemption_timer(&self) -> Result<(), VmError> {
        self.vmcs().update(Field::PinBasedExecControls, |v| {
            v & !(VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER.bits() as u64)
        })
    }

    /// Halt the guest until its next startup request.
    pub fn park(&self) -> Result<(), VmError> {
        let vmcs = self.vmcs();
        vmcs.write(Field::GuestRflags, RFLAGS_RESERVED)?;
        vmcs.write(Field::GuestActivityState, ACTIVITY_HLT)
    }

    /// Flush cached EPT translations.
    pub fn invept(&self) -> Result<(), VmError> {
        let cap = EptVpidCap::from_bits_truncate(self.hw.read_msr(IA32_VMX_EPT_VPID_CAP));
        let result = if cap.contains(EptVpidCap::INVEPT_SINGLE_CONTEXT) {
            let eptp = self.vmcs().read(Field::Eptptr)?;
            self.hw.invept(InveptKind::SingleContext, eptp)
        } else {
            self.hw.invept(InveptKind::Global, 0)
        };
        result.map_err(|e| {
            println!("FATAL: invept failed, error {}", e as u32);
            VmError::VmxOperationError(e)
        })
    }

    /// Free the VMXON and VMCS regions. The processor must have left VMX
    /// operation.
    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        debug_assert_eq!(self.state, VmxState::Disabled);
        self.vmxon.release(mm);
        self.vmcs.release(mm);
    }
}

/// Guest CR3 with the attribute bits cleared.
#[inline]
pub(crate) fn page_table_base(cr3: u64) -> u64 {
    cr3 & !(PAGE_MASK as u64)
}
