//! Multi-processor bring-up.
//!
//! Every processor of the machine calls [`BootContext::entry`] once. The first
//! one to arrive becomes the master and does the one-time setup; all of them
//! then enable virtualization for themselves and wait for each other. Either
//! every processor crosses into virtualized execution, or none does.

use crate::{poll::spin_until, VmError};
use abyss::{print, println};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use spin_lock::SpinLock;

/// The work done while bringing processors up.
pub trait BootOps: Sync {
    /// Per-processor state produced by [`BootOps::cpu_init`].
    type Cpu;

    /// One-time setup on the master, before any processor initializes.
    fn init_early(&self, cpu: usize) -> Result<(), VmError>;

    /// Prepare processor `cpu`. Cleans up after itself on failure.
    fn cpu_init(&self, cpu: usize) -> Result<Self::Cpu, VmError>;

    /// One-time setup on the master, after its own processor initialized.
    fn init_late(&self) -> Result<(), VmError>;

    /// Return an initialized processor to its state before the hypervisor.
    fn cpu_restore(&self, cpu: Self::Cpu);

    /// Enter virtualized execution. Does not return on success on real
    /// hardware.
    fn activate(&self, cpu: Self::Cpu) -> Result<Self::Cpu, VmError>;
}

#[derive(Debug, Default)]
struct InitState {
    master: Option<usize>,
    error: Option<VmError>,
}

/// Boot state shared by every processor.
pub struct BootContext {
    init_lock: SpinLock<InitState>,
    initialized: CachePadded<AtomicUsize>,
    failed: CachePadded<AtomicBool>,
    online: usize,
}

impl BootContext {
    /// Context for `online` processors.
    pub const fn new(online: usize) -> Self {
        Self {
            init_lock: SpinLock::new(InitState {
                master: None,
                error: None,
            }),
            initialized: CachePadded::new(AtomicUsize::new(0)),
            failed: CachePadded::new(AtomicBool::new(false)),
            online,
        }
    }

    #[inline]
    pub fn online(&self) -> usize {
        self.online
    }

    /// Processors that finished [`BootOps::cpu_init`].
    #[inline]
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Processor that did the one-time setup.
    pub fn master(&self) -> Option<usize> {
        self.init_lock.lock().master
    }

    /// First failure of the boot, if any.
    pub fn error(&self) -> Option<VmError> {
        self.init_lock.lock().error
    }

    fn fail(&self, init: &mut InitState, e: VmError) {
        if init.error.is_none() {
            init.error = Some(e);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Bring processor `cpu` up with `ops`.
    ///
    /// Returns the state of the processor once it runs virtualized, or the
    /// first error any processor hit. In the latter case the processor was
    /// restored and continues natively.
    pub fn entry<O: BootOps>(&self, cpu: usize, ops: &O) -> Result<O::Cpu, VmError> {
        let mut master = false;
        let local = {
            let mut init = self.init_lock.lock();
            if init.master.is_none() {
                master = true;
                init.master = Some(cpu);
                if let Err(e) = ops.init_early(cpu) {
                    self.fail(&mut init, e);
                }
            }

            let error = init.error;
            let local = match error {
                Some(e) => Err(e),
                None => {
                    print!(" CPU {}... ", cpu);
                    match ops.cpu_init(cpu) {
                        Ok(state) => {
                            println!("OK");
                            // The last processor releases the others; they
                            // must observe everything done so far.
                            fence(Ordering::SeqCst);
                            self.initialized.fetch_add(1, Ordering::SeqCst);
                            if master {
                                if let Err(e) = ops.init_late() {
                                    self.fail(&mut init, e);
                                }
                            }
                            Ok(state)
                        }
                        Err(e) => {
                            println!("FAILED");
                            self.fail(&mut init, e);
                            Err(e)
                        }
                    }
                }
            };
            local
        };

        spin_until("processors to come up", || {
            self.failed.load(Ordering::SeqCst)
                || self.initialized.load(Ordering::SeqCst) >= self.online
        });

        if let Some(e) = self.error() {
            if let Ok(state) = local {
                ops.cpu_restore(state);
            }
            return Err(e);
        }
        let state = local?;
        if master {
            println!("Activating hypervisor");
        }
        // Point of no return.
        ops.activate(state)
    }
}
