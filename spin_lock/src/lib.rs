//! Spinlock shared by the hypervisor core and its hardware access layer.
//!
//! There is no scheduler underneath the hypervisor, so waiting for a lock always
//! means busy-waiting on an atomic flag.

#![cfg_attr(not(test), no_std)]

mod smplock;

pub use smplock::{SpinLock, SpinLockGuard, TryLockError};
