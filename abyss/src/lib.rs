//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate collects the raw hardware accesses the partitioning core is built
//! on: physical/virtual addresses, x86_64 system registers, model-specific
//! registers, descriptor tables, port I/O and the serial console behind the
//! `kprint` macros.
//!
//! Everything that executes a privileged instruction is only compiled for
//! x86_64. Register layouts (`Cr0`, `Cr4`, `Efer`, ...) are plain bitflags and
//! are available everywhere so the core can be unit tested on a hosted target.

#![cfg_attr(not(test), no_std)]

#[cfg(all(not(test), not(target_os = "none")))]
extern crate std;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod dev;
pub mod x86_64;
