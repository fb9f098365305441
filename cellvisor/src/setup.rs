//! Hypervisor setup run by [`BootContext::entry`](crate::boot::BootContext::entry).

use crate::{
    apic::ApicEmulation,
    boot::BootOps,
    cell::Cells,
    config::{CpuSet, SystemConfig},
    hw::VmxHardware,
    hypercall::CellManager,
    mm::PageAllocator,
    poll::spin_until,
    vcpu::{CellVmxConfig, HostContext, VCpu},
    vmexits::Services,
    vtd::{regs::DmarUnit, Vtd},
    VmError,
};
use abyss::{info, println};
use spin_lock::SpinLock;

/// Machine specific services the setup needs.
pub trait Platform: Sync {
    type Hardware: VmxHardware;
    type Unit: DmarUnit;

    /// Hardware access for processor `cpu`, used on that processor only.
    fn hardware(&self, cpu: usize) -> Self::Hardware;

    /// Host state captured when `cpu` entered the hypervisor.
    fn host_context(&self, cpu: usize) -> HostContext;

    /// Top of the hypervisor stack of `cpu`.
    fn stack_top(&self, cpu: usize) -> u64;

    /// The firmware DMAR table, if there is one.
    fn dmar_table(&self) -> Option<&[u8]>;

    /// Map the registers of the remapping unit at `register_base`.
    fn map_dmar_unit(&self, register_base: u64) -> Result<Self::Unit, VmError>;

    /// Force processor `cpu` out of guest mode with an NMI.
    fn kick(&self, cpu: usize);

    /// Launch the host cell on the calling processor.
    ///
    /// A platform whose launch does not come back must keep `vcpu` where its
    /// exit handler finds it.
    fn launch(&self, mut vcpu: VCpu<Self::Hardware>) -> Result<VCpu<Self::Hardware>, VmError> {
        vcpu.activate()?;
        Ok(vcpu)
    }
}

/// Machine-wide hypervisor state.
pub struct Setup<'m, M: PageAllocator + ?Sized, P: Platform> {
    mm: &'m M,
    platform: P,
    system: SystemConfig,
    cells: SpinLock<Option<Cells<'m, M, P::Unit>>>,
    /// Processors moved to another cell that still run on the old tables.
    handover: SpinLock<CpuSet>,
}

impl<'m, M: PageAllocator + ?Sized, P: Platform> Setup<'m, M, P> {
    pub fn new(mm: &'m M, platform: P, system: SystemConfig) -> Self {
        Self {
            mm,
            platform,
            system,
            cells: SpinLock::new(None),
            handover: SpinLock::new(CpuSet::new()),
        }
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Run `f` on the cells once they exist.
    pub fn with_cells<R>(
        &self,
        f: impl FnOnce(&mut Cells<'m, M, P::Unit>) -> Result<R, VmError>,
    ) -> Result<R, VmError> {
        let mut cells = self.cells.lock();
        match cells.as_mut() {
            Some(cells) => f(cells),
            None => Err(VmError::InvalidArgument),
        }
    }

    /// Collaborators of the exit handlers.
    pub fn services<'a>(&'a self, apic: &'a dyn ApicEmulation) -> Services<'a> {
        Services { apic, cells: self }
    }

    // Kick `cpus` out of the guest and wait until each of them runs on the
    // tables of the cell it now belongs to. Called without the cells lock,
    // which the kicked processors take to learn their cell.
    fn hand_over(&self, cpus: &CpuSet) {
        {
            let mut pending = self.handover.lock();
            for cpu in cpus.iter() {
                pending.insert(cpu);
            }
        }
        for cpu in cpus.iter() {
            self.platform.kick(cpu);
        }
        spin_until("processors to switch cells", || {
            let pending = self.handover.lock();
            cpus.iter().all(|cpu| !pending.contains(cpu))
        });
    }

    fn report_pages(&self, when: &str) {
        if let Some(pages) = self.mm.used_pages() {
            info!("Page usage {}: {} pages", when, pages);
        }
    }
}

impl<'m, M: PageAllocator + ?Sized, P: Platform> BootOps for Setup<'m, M, P> {
    type Cpu = VCpu<P::Hardware>;

    fn init_early(&self, cpu: usize) -> Result<(), VmError> {
        println!("\nInitializing cellvisor on CPU {}", cpu);
        self.system.check()?;
        let vtd = Vtd::init(self.mm, self.platform.dmar_table(), |base| {
            self.platform.map_dmar_unit(base)
        })?;
        let cells = Cells::new(self.mm, self.system.clone(), vtd)?;
        *self.cells.lock() = Some(cells);
        self.report_pages("after early setup");
        println!("Initializing first processor:");
        Ok(())
    }

    fn cpu_init(&self, cpu: usize) -> Result<Self::Cpu, VmError> {
        let (config, globals) = self.with_cells(|cells| {
            cells.register_root_cpu(cpu)?;
            let config = cells.vmx_config(cpu).ok_or(VmError::InvalidArgument)?;
            Ok((config, cells.vmx_globals()))
        })?;
        let mut vcpu = VCpu::new(
            cpu,
            self.platform.hardware(cpu),
            self.mm,
            self.platform.host_context(cpu),
            self.platform.stack_top(cpu),
        )?;
        let result = vcpu
            .enable()
            .and_then(|_| vcpu.configure(config, globals));
        match result {
            Ok(()) => Ok(vcpu),
            Err(e) => {
                vcpu.restore();
                vcpu.release(self.mm);
                Err(e)
            }
        }
    }

    fn init_late(&self) -> Result<(), VmError> {
        self.with_cells(|cells| {
            cells.activate_iommu();
            Ok(())
        })?;
        self.report_pages("after late setup");
        println!("Initializing remaining processors:");
        Ok(())
    }

    fn cpu_restore(&self, mut vcpu: Self::Cpu) {
        vcpu.restore();
        vcpu.release(self.mm);
    }

    fn activate(&self, vcpu: Self::Cpu) -> Result<Self::Cpu, VmError> {
        self.platform.launch(vcpu)
    }
}

impl<'m, M: PageAllocator + ?Sized, P: Platform> CellManager for Setup<'m, M, P> {
    fn shutdown(&self, cpu: usize) -> Result<(), VmError> {
        self.with_cells(|cells| cells.request_shutdown(cpu))
    }

    fn cell_create(&self, cpu: usize, config_addr: u64) -> Result<(), VmError> {
        let moved = self.with_cells(|cells| cells.request_create(cpu, config_addr))?;
        self.hand_over(&moved);
        Ok(())
    }

    fn cell_destroy(&self, cpu: usize, id: u64) -> Result<(), VmError> {
        let cell = self.with_cells(|cells| cells.request_destroy(cpu, id))?;
        self.hand_over(cell.cpus());
        cell.release(self.mm)
    }

    fn vmx_config(&self, cpu: usize) -> Option<CellVmxConfig> {
        self.cells
            .lock()
            .as_ref()
            .and_then(|cells| cells.vmx_config(cpu))
    }

    fn handover_pending(&self, cpu: usize) -> bool {
        self.handover.lock().contains(cpu)
    }

    fn handover_done(&self, cpu: usize) {
        self.handover.lock().remove(cpu);
    }
}
