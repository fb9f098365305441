//! Bare-metal x86_64 backend.
//!
//! The loader calls `cellvisor_entry(cpu)` once on every processor it brings
//! under the hypervisor. The entry stub records where the call came from and
//! forwards to `cellvisor_main`, which the binary linking this crate defines:
//!
//! ```ignore
//! #[no_mangle]
//! fn cellvisor_main(cpu: usize) -> Result<(), VmError> {
//!     BOOT.entry(cpu, &*SETUP).map(|_| ())
//! }
//! ```
//!
//! A successful launch continues the caller as the host cell, returning 0
//! from `cellvisor_entry`. On failure the negative error number is returned
//! and the processor keeps running natively.
//!
//! VM exits arrive on a per-processor exit stack whose topmost word holds the
//! processor index.

use crate::{
    errno,
    hw::{CpuidResult, HostTables, InveptKind, VmxHardware},
    setup::Platform,
    vcpu::{
        CalleeSavedRegisters, DescriptorTable, GeneralPurposeRegisters, HostContext, VCpu,
        VmexitResult,
    },
    vmcs::{Field, InstructionError},
    vmexits::Services,
    VmError,
};
use abyss::{
    addressing::{Pa, Va},
    dev::mmio::MmioPage,
    println,
    x86_64::{
        intrinsics::{self, halt_forever, read_cr3, write_cr3},
        msr::{
            rdmsr, wrmsr, IA32_EFER, IA32_FS_BASE, IA32_GS_BASE, IA32_SYSENTER_CS,
            IA32_SYSENTER_EIP, IA32_SYSENTER_ESP,
        },
        segmentation::{clear_tss_busy, selectors, SegmentState},
        table::{load_task_register, task_register, SystemTableRegister},
        Rflags,
    },
};
use core::{
    arch::{asm, global_asm},
    cell::UnsafeCell,
};
use spin_lock::SpinLock;

/// Processors the backend has room for.
pub const MAX_CPUS: usize = 64;
const EXIT_STACK_SIZE: usize = 0x4000;

/// Per-processor storage. Only ever touched by its own processor.
#[repr(C, align(4096))]
struct PerCpu {
    stack: UnsafeCell<[u8; EXIT_STACK_SIZE]>,
    host: UnsafeCell<Option<HostContext>>,
    vcpu: UnsafeCell<Option<VCpu<NativeVmx>>>,
}

unsafe impl Sync for PerCpu {}

impl PerCpu {
    const EMPTY: Self = Self {
        stack: UnsafeCell::new([0; EXIT_STACK_SIZE]),
        host: UnsafeCell::new(None),
        vcpu: UnsafeCell::new(None),
    };

    fn of(cpu: usize) -> Option<&'static PerCpu> {
        PER_CPU.get(cpu)
    }

    /// Stack pointer on VM exit. The word it points to holds the processor
    /// index.
    fn stack_top(&self) -> u64 {
        self.stack.get() as u64 + EXIT_STACK_SIZE as u64 - 16
    }
}

static PER_CPU: [PerCpu; MAX_CPUS] = [PerCpu::EMPTY; MAX_CPUS];

static SERVICES: SpinLock<Option<Services<'static>>> = SpinLock::new(None);

/// Register the collaborators of the exit handlers. Must happen before the
/// first processor is launched.
pub fn install_services(services: Services<'static>) {
    *SERVICES.lock() = Some(services);
}

extern "C" {
    fn cellvisor_vmexit();
    fn cellvisor_vmlaunch(regs: *const CalleeSavedRegisters) -> u8;
    fn cellvisor_return_to_host(gprs: *const GeneralPurposeRegisters, ip: u64, sp: u64) -> !;
}

extern "Rust" {
    fn cellvisor_main(cpu: usize) -> Result<(), VmError>;
}

global_asm!(
    ".global cellvisor_entry",
    "cellvisor_entry:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rsi, rsp",
    "sub rsp, 8",
    "call {entry}",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    entry = sym cpu_entry,
);

// Guest registers are pushed in `GeneralPurposeRegisters` order; a slot is
// left for rsp, which lives in the VMCS.
global_asm!(
    ".global cellvisor_vmexit",
    "cellvisor_vmexit:",
    "push rax",
    "push rcx",
    "push rdx",
    "push rbx",
    "sub rsp, 8",
    "push rbp",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "mov rsi, [rsp + 16 * 8]",
    "call {handler}",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rbp",
    "add rsp, 8",
    "pop rbx",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "vmresume",
    "mov rdi, [rsp]",
    "call {failed}",
    handler = sym handle_vmexit,
    failed = sym vmresume_failed,
);

// Returns 1 for VMfailInvalid, 2 for VMfailValid.
global_asm!(
    ".global cellvisor_vmlaunch",
    "cellvisor_vmlaunch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov r15, [rdi]",
    "mov r14, [rdi + 0x8]",
    "mov r13, [rdi + 0x10]",
    "mov r12, [rdi + 0x18]",
    "mov rbx, [rdi + 0x20]",
    "mov rbp, [rdi + 0x28]",
    "xor eax, eax",
    "vmlaunch",
    "mov eax, 2",
    "jnc 1f",
    "mov eax, 1",
    "1:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

global_asm!(
    ".global cellvisor_return_to_host",
    "cellvisor_return_to_host:",
    "mov rsp, rdx",
    "push rsi",
    "mov r15, [rdi]",
    "mov r14, [rdi + 0x8]",
    "mov r13, [rdi + 0x10]",
    "mov r12, [rdi + 0x18]",
    "mov r11, [rdi + 0x20]",
    "mov r10, [rdi + 0x28]",
    "mov r9, [rdi + 0x30]",
    "mov r8, [rdi + 0x38]",
    "mov rsi, [rdi + 0x48]",
    "mov rbp, [rdi + 0x50]",
    "mov rbx, [rdi + 0x60]",
    "mov rdx, [rdi + 0x68]",
    "mov rcx, [rdi + 0x70]",
    "mov rdi, [rdi + 0x40]",
    "xor eax, eax",
    "ret",
);

/// Record the caller of `cellvisor_entry` and run the boot.
unsafe extern "C" fn cpu_entry(cpu: usize, frame: *const CalleeSavedRegisters) -> i64 {
    let per_cpu = match PerCpu::of(cpu) {
        Some(per_cpu) => per_cpu,
        None => return -(errno::EINVAL as i64),
    };
    // The return address sits right above the saved registers.
    let ret = frame.add(1) as *const u64;
    *per_cpu.host.get() = Some(capture_host(*frame, *ret, ret.add(1) as u64));
    *(per_cpu.stack_top() as *mut u64) = cpu as u64;

    match cellvisor_main(cpu) {
        Ok(()) => 0,
        Err(e) => -(e.errno() as i64),
    }
}

fn capture_host(callee: CalleeSavedRegisters, ip: u64, sp: u64) -> HostContext {
    let gdtr = SystemTableRegister::gdtr();
    let idtr = SystemTableRegister::idtr();
    let (gdt_base, gdt_limit) = (gdtr.base, gdtr.limit);
    let segment = |selector| unsafe { SegmentState::from_gdt(gdt_base, selector) };

    let mut fs = segment(selectors::fs());
    fs.base = rdmsr(IA32_FS_BASE);
    let mut gs = segment(selectors::gs());
    gs.base = rdmsr(IA32_GS_BASE);

    HostContext {
        cr3: read_cr3(),
        gdtr: DescriptorTable {
            base: gdt_base,
            limit: gdt_limit,
        },
        idtr: DescriptorTable {
            base: idtr.base,
            limit: idtr.limit,
        },
        cs: segment(selectors::cs()),
        ds: segment(selectors::ds()),
        es: segment(selectors::es()),
        fs,
        gs,
        tss: segment(task_register()),
        efer: rdmsr(IA32_EFER),
        sysenter_cs: rdmsr(IA32_SYSENTER_CS),
        sysenter_esp: rdmsr(IA32_SYSENTER_ESP),
        sysenter_eip: rdmsr(IA32_SYSENTER_EIP),
        ip,
        sp,
        callee,
    }
}

unsafe extern "C" fn handle_vmexit(gprs: &mut GeneralPurposeRegisters, cpu: usize) {
    let services = *SERVICES.lock();
    let vcpu = PerCpu::of(cpu).and_then(|per_cpu| (*per_cpu.vcpu.get()).as_mut());
    match (services, vcpu) {
        (Some(services), Some(vcpu)) => match vcpu.handle_exit(gprs, &services) {
            Ok(VmexitResult::Ok) => return,
            // The processor already left through `return_to_host`.
            Ok(VmexitResult::Deactivated) => (),
            Err(e) => println!("FATAL: CPU {} cannot continue: {:?}", cpu, e),
        },
        _ => println!("FATAL: VM exit on CPU {} before launch", cpu),
    }
    stop(cpu)
}

unsafe extern "C" fn vmresume_failed(cpu: usize) -> ! {
    println!(
        "FATAL: vmresume failed, error {}",
        instruction_error() as u32
    );
    stop(cpu)
}

fn stop(cpu: usize) -> ! {
    println!("Stopping CPU {}", cpu);
    halt_forever()
}

fn instruction_error() -> InstructionError {
    let raw: u64;
    unsafe {
        asm!(
            "vmread {}, {}",
            out(reg) raw,
            in(reg) Field::InstructionError as u64,
            options(nostack)
        );
    }
    InstructionError::from(raw as u32)
}

/// Outcome of a VMX instruction from the flags it left.
#[inline]
fn vmx_result(rflags: u64) -> Result<(), InstructionError> {
    let rflags = Rflags::from_bits_truncate(rflags);
    if rflags.contains(Rflags::CF) {
        Err(InstructionError::VmFailInvalid)
    } else if rflags.contains(Rflags::ZF) {
        Err(instruction_error())
    } else {
        Ok(())
    }
}

/// VT-x of the processor this runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeVmx;

impl VmxHardware for NativeVmx {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let r = intrinsics::cpuid(leaf, subleaf);
        CpuidResult {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }

    fn read_msr(&self, index: u32) -> u64 {
        rdmsr(index)
    }

    fn write_msr(&self, index: u32, value: u64) {
        unsafe { wrmsr(index, value) }
    }

    fn read_cr0(&self) -> u64 {
        let v: u64;
        unsafe {
            asm!("mov {}, cr0", out(reg) v, options(nomem, nostack));
        }
        v
    }

    fn read_cr3(&self) -> u64 {
        read_cr3()
    }

    fn read_cr4(&self) -> u64 {
        let v: u64;
        unsafe {
            asm!("mov {}, cr4", out(reg) v, options(nomem, nostack));
        }
        v
    }

    fn write_cr4(&self, value: u64) {
        unsafe {
            asm!("mov cr4, {}", in(reg) value, options(nomem, nostack));
        }
    }

    fn host_tables(&self) -> HostTables {
        let gdtr = SystemTableRegister::gdtr();
        let idtr = SystemTableRegister::idtr();
        let (gdtr_base, idtr_base) = (gdtr.base, idtr.base);
        let tr_selector = task_register();
        HostTables {
            gdtr_base,
            idtr_base,
            cs_selector: selectors::cs(),
            tr_selector,
            tr_base: unsafe { SegmentState::from_gdt(gdtr_base, tr_selector) }.base,
        }
    }

    fn exit_entry(&self) -> u64 {
        cellvisor_vmexit as usize as u64
    }

    fn vmxon(&self, region: Pa) -> Result<(), InstructionError> {
        let addr = region.into_u64();
        let rflags: u64;
        unsafe {
            asm!("vmxon [{}]", "pushfq", "pop {}", in(reg) &addr, lateout(reg) rflags);
        }
        vmx_result(rflags)
    }

    fn vmxoff(&self) {
        unsafe {
            asm!("vmxoff", options(nostack));
        }
    }

    fn vmclear(&self, vmcs: Pa) -> Result<(), InstructionError> {
        let addr = vmcs.into_u64();
        let rflags: u64;
        unsafe {
            asm!("vmclear [{}]", "pushfq", "pop {}", in(reg) &addr, lateout(reg) rflags);
        }
        vmx_result(rflags)
    }

    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError> {
        let addr = vmcs.into_u64();
        let rflags: u64;
        unsafe {
            asm!("vmptrld [{}]", "pushfq", "pop {}", in(reg) &addr, lateout(reg) rflags);
        }
        vmx_result(rflags)
    }

    fn vmread(&self, field: Field) -> Result<u64, InstructionError> {
        let (v, rflags): (u64, u64);
        unsafe {
            asm!(
                "vmread {}, {}",
                "pushfq",
                "pop {}",
                lateout(reg) v,
                in(reg) field as u64,
                lateout(reg) rflags,
            );
        }
        vmx_result(rflags).map(|_| v)
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError> {
        let rflags: u64;
        unsafe {
            asm!(
                "vmwrite {}, {}",
                "pushfq",
                "pop {}",
                in(reg) field as u64,
                in(reg) value,
                lateout(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn invept(&self, kind: InveptKind, eptp: u64) -> Result<(), InstructionError> {
        let descriptor: [u64; 2] = [eptp, 0];
        let rflags: u64;
        unsafe {
            asm!(
                "invept {}, [{}]",
                "pushfq",
                "pop {}",
                in(reg) kind as u64,
                in(reg) &descriptor,
                lateout(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn vmlaunch(&self, regs: &CalleeSavedRegisters) -> Result<(), InstructionError> {
        match unsafe { cellvisor_vmlaunch(regs) } {
            1 => Err(InstructionError::VmFailInvalid),
            _ => Err(instruction_error()),
        }
    }

    fn xsetbv(&self, index: u32, value: u64) {
        unsafe { intrinsics::xsetbv(index, value) }
    }

    fn raise_nmi(&self) {
        unsafe { intrinsics::int_nmi() }
    }

    fn restore_host_state(&self, host: &HostContext) {
        unsafe {
            write_cr3(host.cr3);
            SystemTableRegister {
                limit: host.gdtr.limit,
                base: host.gdtr.base,
            }
            .load_gdt();
            SystemTableRegister {
                limit: host.idtr.limit,
                base: host.idtr.base,
            }
            .load_idt();

            asm!(
                "mov ds, {:x}",
                "mov es, {:x}",
                "mov fs, {:x}",
                "mov gs, {:x}",
                in(reg) host.ds.selector,
                in(reg) host.es.selector,
                in(reg) host.fs.selector,
                in(reg) host.gs.selector,
                options(nostack)
            );
            // Loading the selectors clobbered the bases.
            wrmsr(IA32_FS_BASE, host.fs.base);
            wrmsr(IA32_GS_BASE, host.gs.base);

            clear_tss_busy(host.gdtr.base, host.tss.selector);
            load_task_register(host.tss.selector);

            wrmsr(IA32_EFER, host.efer);
            wrmsr(IA32_SYSENTER_CS, host.sysenter_cs);
            wrmsr(IA32_SYSENTER_ESP, host.sysenter_esp);
            wrmsr(IA32_SYSENTER_EIP, host.sysenter_eip);
        }
    }

    fn return_to_host(&self, host: &HostContext, gprs: &GeneralPurposeRegisters) {
        unsafe { cellvisor_return_to_host(gprs, host.ip, host.sp) }
    }
}

/// The machine as seen by the loader.
pub struct NativePlatform {
    dmar: Option<&'static [u8]>,
    map_mmio: fn(u64) -> Option<Va>,
    send_nmi: fn(usize),
}

impl NativePlatform {
    /// `map_mmio` maps one uncached page of device registers into the
    /// hypervisor's address space. `send_nmi` sends an NMI IPI to the
    /// processor with the given index through the physical local APIC.
    pub const fn new(
        dmar: Option<&'static [u8]>,
        map_mmio: fn(u64) -> Option<Va>,
        send_nmi: fn(usize),
    ) -> Self {
        Self {
            dmar,
            map_mmio,
            send_nmi,
        }
    }
}

impl Platform for NativePlatform {
    type Hardware = NativeVmx;
    type Unit = MmioPage;

    fn hardware(&self, _cpu: usize) -> NativeVmx {
        NativeVmx
    }

    fn host_context(&self, cpu: usize) -> HostContext {
        PerCpu::of(cpu)
            .and_then(|per_cpu| unsafe { *per_cpu.host.get() })
            .unwrap_or_default()
    }

    fn stack_top(&self, cpu: usize) -> u64 {
        PerCpu::of(cpu).map(PerCpu::stack_top).unwrap_or(0)
    }

    fn dmar_table(&self) -> Option<&[u8]> {
        self.dmar
    }

    fn map_dmar_unit(&self, register_base: u64) -> Result<MmioPage, VmError> {
        let base = (self.map_mmio)(register_base).ok_or(VmError::OutOfMemory)?;
        Ok(unsafe { MmioPage::new(base) })
    }

    fn kick(&self, cpu: usize) {
        (self.send_nmi)(cpu)
    }

    fn launch(&self, vcpu: VCpu<NativeVmx>) -> Result<VCpu<NativeVmx>, VmError> {
        let per_cpu = PerCpu::of(vcpu.cpu_id()).ok_or(VmError::InvalidArgument)?;
        // The exit handler finds the processor here from now on.
        let slot = unsafe { &mut *per_cpu.vcpu.get() };
        let result = slot.insert(vcpu).activate();
        let vcpu = slot.take().ok_or(VmError::InvalidArgument)?;
        result.map(|_| vcpu)
    }
}
