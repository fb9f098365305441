//! Hypercall interface.
//!
//! Partition code issues VMCALL with the call number in `rax` and the
//! argument in `rdi`. The status comes back in `rax`: zero on success, a
//! negated error number otherwise.

use crate::{vcpu::CellVmxConfig, VmError};
use num_enum::TryFromPrimitive;

/// Defined hypercalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum Hypercall {
    /// Leave partitioning mode on every processor.
    Disable = 0,
    /// Create a cell; `rdi` holds the guest-physical address of its
    /// configuration.
    CellCreate = 1,
    /// Destroy the cell with the id in `rdi`.
    CellDestroy = 2,
}

/// Cell lifecycle manager the hypercalls are delegated to.
///
/// Calls are made from the exit handler of the processor that issued the
/// hypercall.
pub trait CellManager: Sync {
    /// Tear down partitioning. On success the calling processor leaves VMX
    /// operation.
    fn shutdown(&self, cpu: usize) -> Result<(), VmError>;

    /// Create a cell from the configuration at guest-physical `config_addr`.
    fn cell_create(&self, cpu: usize, config_addr: u64) -> Result<(), VmError>;

    /// Destroy cell `id`.
    fn cell_destroy(&self, cpu: usize, id: u64) -> Result<(), VmError>;

    /// Bitmaps and EPT pointer of the cell `cpu` currently belongs to.
    fn vmx_config(&self, cpu: usize) -> Option<CellVmxConfig>;

    /// Whether `cpu` was moved to another cell and has not switched yet.
    fn handover_pending(&self, cpu: usize) -> bool;

    /// `cpu` runs on the tables [`vmx_config`](Self::vmx_config) reports.
    fn handover_done(&self, cpu: usize);
}

/// Encode a hypercall result for `rax`.
pub fn status(result: Result<(), VmError>) -> u64 {
    match result {
        Ok(()) => 0,
        Err(e) => (-(e.errno() as i64)) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;

    #[test]
    fn call_numbers() {
        assert_eq!(Hypercall::try_from(0u64).ok(), Some(Hypercall::Disable));
        assert_eq!(Hypercall::try_from(2u64).ok(), Some(Hypercall::CellDestroy));
        assert!(Hypercall::try_from(3u64).is_err());
    }

    #[test]
    fn status_encoding() {
        assert_eq!(status(Ok(())), 0);
        assert_eq!(status(Err(VmError::PermissionDenied)) as i64, -(errno::EPERM as i64));
        assert_eq!(status(Err(VmError::NotSupported)) as i64, -38);
    }
}
