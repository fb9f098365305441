//! Test doubles for the hardware and platform services.

use crate::{
    apic::{ApicEmulation, StartupVector},
    hw::{CpuidResult, HostTables, InveptKind, VmxHardware},
    mm::PageAllocator,
    vcpu::{CalleeSavedRegisters, GeneralPurposeRegisters, HostContext},
    vm_control::*,
    vmcs::{Field, InstructionError},
    vtd::regs::{self, DmarUnit},
};
use abyss::addressing::{Pa, Va, PAGE_SIZE};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    vec::Vec,
};

/// Side effects observed by [`MockVmx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Vmxon(Pa),
    Vmxoff,
    Vmclear(Pa),
    Vmptrld(Pa),
    Invept(InveptKind, u64),
    Vmlaunch,
    Xsetbv(u32, u64),
    Nmi,
    RestoreHost,
    ReturnToHost { ip: u64, sp: u64, rbx: u64 },
}

struct VmxState {
    fields: BTreeMap<Field, u64>,
    msrs: BTreeMap<u32, u64>,
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    fail_vmwrite: Option<(Field, InstructionError)>,
    fail_vmxon: Option<InstructionError>,
    fail_vmlaunch: Option<InstructionError>,
    events: Vec<Event>,
}

/// A processor whose VMCS is a map.
pub struct MockVmx {
    state: Mutex<VmxState>,
}

impl MockVmx {
    /// A processor with every feature the hypervisor needs.
    pub fn new() -> Self {
        let allow_all = 0xffff_ffff_0000_0000;
        let mut msrs = BTreeMap::new();
        msrs.insert(IA32_VMX_BASIC, 1 | (4096 << 32) | (6 << 50) | (1 << 55));
        for msr in [
            IA32_VMX_PINBASED_CTLS,
            IA32_VMX_PROC_BASED_CTLS,
            IA32_VMX_EXIT_CTLS,
            IA32_VMX_ENTRY_CTLS,
            IA32_VMX_PROC_BASED_CTLS2,
        ] {
            msrs.insert(msr, allow_all);
            msrs.insert(msr + VMX_TRUE_MSR_OFFSET, allow_all);
        }
        msrs.insert(IA32_VMX_MISC, VMX_MISC_ACTIVITY_HLT);
        msrs.insert(
            IA32_VMX_EPT_VPID_CAP,
            (EptVpidCap::WALK_LENGTH_4
                | EptVpidCap::WB
                | EptVpidCap::INVEPT_SINGLE_CONTEXT
                | EptVpidCap::INVEPT_ALL_CONTEXT)
                .bits(),
        );
        msrs.insert(
            IA32_FEATURE_CONTROL,
            (FeatureControl::LOCKED | FeatureControl::VMXON_OUTSIDE_SMX).bits(),
        );
        msrs.insert(IA32_VMX_CR0_FIXED0, 0x8000_0021);
        msrs.insert(IA32_VMX_CR0_FIXED1, 0xffff_ffff);
        msrs.insert(IA32_VMX_CR4_FIXED0, 0x2000);
        msrs.insert(IA32_VMX_CR4_FIXED1, 0x3767ff);

        let mut cpuid = BTreeMap::new();
        cpuid.insert(
            (1, 0),
            CpuidResult {
                ecx: 1 << 5,
                ..Default::default()
            },
        );
        // x87, SSE and AVX state.
        cpuid.insert(
            (0xd, 0),
            CpuidResult {
                eax: 0x7,
                ..Default::default()
            },
        );
        Self {
            state: Mutex::new(VmxState {
                fields: BTreeMap::new(),
                msrs,
                cpuid,
                cr0: 0x8005_0033,
                cr3: 0x1000,
                cr4: 0,
                fail_vmwrite: None,
                fail_vmxon: None,
                fail_vmlaunch: None,
                events: Vec::new(),
            }),
        }
    }

    /// Value of a field, `None` if it was never written.
    pub fn field(&self, field: Field) -> Option<u64> {
        self.state.lock().unwrap().fields.get(&field).copied()
    }

    pub fn set_field(&self, field: Field, value: u64) {
        self.state.lock().unwrap().fields.insert(field, value);
    }

    pub fn set_msr(&self, index: u32, value: u64) {
        self.state.lock().unwrap().msrs.insert(index, value);
    }

    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.state
            .lock()
            .unwrap()
            .cpuid
            .insert((leaf, subleaf), result);
    }

    pub fn fail_vmwrite(&self, field: Field, error: InstructionError) {
        self.state.lock().unwrap().fail_vmwrite = Some((field, error));
    }

    pub fn fail_vmxon(&self, error: InstructionError) {
        self.state.lock().unwrap().fail_vmxon = Some(error);
    }

    pub fn fail_vmlaunch(&self, error: InstructionError) {
        self.state.lock().unwrap().fail_vmlaunch = Some(error);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }
}

impl VmxHardware for MockVmx {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.state
            .lock()
            .unwrap()
            .cpuid
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn read_msr(&self, index: u32) -> u64 {
        self.state
            .lock()
            .unwrap()
            .msrs
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    fn write_msr(&self, index: u32, value: u64) {
        self.set_msr(index, value)
    }

    fn read_cr0(&self) -> u64 {
        self.state.lock().unwrap().cr0
    }

    fn read_cr3(&self) -> u64 {
        self.state.lock().unwrap().cr3
    }

    fn read_cr4(&self) -> u64 {
        self.state.lock().unwrap().cr4
    }

    fn write_cr4(&self, value: u64) {
        self.state.lock().unwrap().cr4 = value;
    }

    fn host_tables(&self) -> HostTables {
        HostTables {
            gdtr_base: 0xffff_8000_0001_0000,
            idtr_base: 0xffff_8000_0002_0000,
            cs_selector: 0x8,
            tr_selector: 0x28,
            tr_base: 0xffff_8000_0003_0000,
        }
    }

    fn exit_entry(&self) -> u64 {
        0xffff_8000_0004_0000
    }

    fn vmxon(&self, region: Pa) -> Result<(), InstructionError> {
        if let Some(e) = self.state.lock().unwrap().fail_vmxon {
            return Err(e);
        }
        self.record(Event::Vmxon(region));
        Ok(())
    }

    fn vmxoff(&self) {
        self.record(Event::Vmxoff);
    }

    fn vmclear(&self, vmcs: Pa) -> Result<(), InstructionError> {
        self.record(Event::Vmclear(vmcs));
        Ok(())
    }

    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError> {
        self.record(Event::Vmptrld(vmcs));
        Ok(())
    }

    fn vmread(&self, field: Field) -> Result<u64, InstructionError> {
        Ok(self.field(field).unwrap_or(0))
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError> {
        let mut state = self.state.lock().unwrap();
        match state.fail_vmwrite {
            Some((f, e)) if f == field => Err(e),
            _ => {
                state.fields.insert(field, value);
                Ok(())
            }
        }
    }

    fn invept(&self, kind: InveptKind, eptp: u64) -> Result<(), InstructionError> {
        self.record(Event::Invept(kind, eptp));
        Ok(())
    }

    fn vmlaunch(&self, _regs: &CalleeSavedRegisters) -> Result<(), InstructionError> {
        if let Some(e) = self.state.lock().unwrap().fail_vmlaunch {
            return Err(e);
        }
        self.record(Event::Vmlaunch);
        Ok(())
    }

    fn xsetbv(&self, index: u32, value: u64) {
        self.record(Event::Xsetbv(index, value));
    }

    fn raise_nmi(&self) {
        self.record(Event::Nmi);
    }

    fn restore_host_state(&self, _host: &HostContext) {
        self.record(Event::RestoreHost);
    }

    fn return_to_host(&self, host: &HostContext, gprs: &GeneralPurposeRegisters) {
        self.record(Event::ReturnToHost {
            ip: host.ip,
            sp: host.sp,
            rbx: gprs.rbx,
        });
    }
}

/// Page allocator over the test process heap.
///
/// Physical and virtual addresses coincide. Pages still allocated when the
/// allocator is dropped are reclaimed then.
pub struct TestMemory {
    pages: Mutex<BTreeMap<usize, usize>>,
    budget: AtomicUsize,
    flushes: AtomicUsize,
}

impl TestMemory {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            budget: AtomicUsize::new(usize::MAX),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Let the next `count` allocations succeed and fail every one after.
    /// `usize::MAX` removes the limit.
    pub fn fail_after(&self, count: usize) {
        self.budget.store(count, Ordering::SeqCst);
    }

    /// Number of live allocations.
    pub fn outstanding(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// Number of cache flushes requested so far.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Copy `bytes` to physical address `pa`.
    pub fn write(&self, pa: Pa, bytes: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                pa.into_usize() as *mut u8,
                bytes.len(),
            )
        }
    }

    fn layout(count: usize) -> Layout {
        Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
    }
}

impl PageAllocator for TestMemory {
    fn alloc_pages(&self, count: usize) -> Option<Pa> {
        let budget = self.budget.load(Ordering::SeqCst);
        if budget == 0 {
            return None;
        }
        if budget != usize::MAX {
            self.budget.store(budget - 1, Ordering::SeqCst);
        }
        let ptr = unsafe { alloc_zeroed(Self::layout(count)) };
        if ptr.is_null() {
            return None;
        }
        self.pages.lock().unwrap().insert(ptr as usize, count);
        Pa::new(ptr as usize)
    }

    fn free_pages(&self, pa: Pa, count: usize) {
        let addr = pa.into_usize();
        let recorded = self.pages.lock().unwrap().remove(&addr);
        assert_eq!(recorded, Some(count), "bad free of {:?}", pa);
        unsafe { dealloc(addr as *mut u8, Self::layout(count)) }
    }

    fn phys_to_virt(&self, pa: Pa) -> Va {
        Va::new(pa.into_usize()).unwrap()
    }

    fn virt_to_phys(&self, va: Va) -> Pa {
        Pa::new(va.into_usize()).unwrap()
    }

    fn flush_cache(&self, _va: Va, _len: usize) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn used_pages(&self) -> Option<usize> {
        Some(self.pages.lock().unwrap().values().sum())
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        for (addr, count) in self.pages.lock().unwrap().iter() {
            unsafe { dealloc(*addr as *mut u8, Self::layout(*count)) }
        }
    }
}

#[derive(Default)]
struct DmarRegs {
    regs: BTreeMap<usize, u64>,
    writes: Vec<(usize, u64)>,
}

/// A DMA remapping unit that completes every command at once.
///
/// Clones share their registers so that a test can observe a unit that was
/// handed to the manager.
#[derive(Clone, Default)]
pub struct FakeDmarUnit {
    inner: Arc<Mutex<DmarRegs>>,
}

impl FakeDmarUnit {
    /// A unit with the given capability registers.
    pub fn new(cap: u64, ecap: u64) -> Self {
        let unit = Self::default();
        unit.set(regs::CAP, cap);
        unit.set(regs::ECAP, ecap);
        unit
    }

    /// 4-level, 256-domain unit with the IOTLB registers at 0x100.
    pub fn standard() -> Self {
        Self::new(regs::CAP_SAGAW48 | 2, 0x10 << 8)
    }

    pub fn set(&self, offset: usize, value: u64) {
        self.inner.lock().unwrap().regs.insert(offset, value);
    }

    pub fn get(&self, offset: usize) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .regs
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    /// Every register write in order.
    pub fn writes(&self) -> Vec<(usize, u64)> {
        self.inner.lock().unwrap().writes.clone()
    }

    fn store(&self, offset: usize, value: u64) {
        let iotlb = regs::iotlb_offset(self.get(regs::ECAP)) + 8;
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push((offset, value));
        let stored = match offset {
            regs::GCMD => {
                let mut status = 0;
                if value & regs::GCMD_SRTP as u64 != 0 {
                    status |= regs::GSTS_RTPS;
                }
                if value & regs::GCMD_TE as u64 != 0 {
                    status |= regs::GSTS_TES;
                }
                inner.regs.insert(regs::GSTS, status as u64);
                value
            }
            regs::CCMD => value & !regs::CCMD_ICC,
            o if o == iotlb => value & !regs::IOTLB_IVT,
            _ => value,
        };
        inner.regs.insert(offset, stored);
    }
}

impl DmarUnit for FakeDmarUnit {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset) as u32
    }

    fn write32(&self, offset: usize, value: u32) {
        self.store(offset, value as u64)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.get(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.store(offset, value)
    }
}

/// Calls received by [`MockApic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicCall {
    Mmio {
        cpu: usize,
        rip: u64,
        page_table: u64,
        register: u32,
        is_write: bool,
    },
    X2apicRead(usize, u64),
    X2apicWrite(usize, u64, u64),
    Icr(usize, u32, u32),
}

#[derive(Default)]
struct ApicState {
    startup: BTreeMap<usize, StartupVector>,
    mmio_len: Option<usize>,
    calls: Vec<ApicCall>,
}

/// Interrupt controller emulation that records every call.
#[derive(Default)]
pub struct MockApic {
    state: Mutex<ApicState>,
}

impl MockApic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next event poll of `cpu` return `vector`.
    pub fn post_startup(&self, cpu: usize, vector: StartupVector) {
        self.state.lock().unwrap().startup.insert(cpu, vector);
    }

    /// Instruction length reported for emulated APIC page accesses.
    pub fn set_mmio_len(&self, len: Option<usize>) {
        self.state.lock().unwrap().mmio_len = len;
    }

    pub fn calls(&self) -> Vec<ApicCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl ApicEmulation for MockApic {
    fn handle_events(&self, cpu: usize) -> Option<StartupVector> {
        self.state.lock().unwrap().startup.remove(&cpu)
    }

    fn mmio_access(
        &self,
        _gprs: &mut GeneralPurposeRegisters,
        cpu: usize,
        rip: u64,
        page_table: u64,
        register: u32,
        is_write: bool,
    ) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApicCall::Mmio {
            cpu,
            rip,
            page_table,
            register,
            is_write,
        });
        state.mmio_len
    }

    fn x2apic_read(&self, cpu: usize, gprs: &mut GeneralPurposeRegisters) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(ApicCall::X2apicRead(cpu, gprs.rcx));
        gprs.rax = 0x11;
        gprs.rdx = 0;
    }

    fn x2apic_write(&self, cpu: usize, gprs: &GeneralPurposeRegisters) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(ApicCall::X2apicWrite(cpu, gprs.rcx, gprs.rax));
    }

    fn icr_write(&self, cpu: usize, lo: u32, hi: u32) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(ApicCall::Icr(cpu, lo, hi));
    }
}
